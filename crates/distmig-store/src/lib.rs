//! Mount table state shared between migration stages.
//!
//! Every stage of the migration pipeline runs as its own process. The only
//! state handed from one stage to the next is the mount table file written by
//! [`MountTable::export`] and read back by [`MountTable::read`]: an ordered,
//! fstab-compatible list of what is mounted, in the order it was layered.
//! [`MigrationLayout`] names the well-known paths and [`TableLock`] serializes
//! read-modify-write cycles on the table.

pub mod layout;
pub mod lock;
pub mod record;
pub mod table;

pub use layout::{MigrationLayout, MOUNT_TABLE, SOURCE_TABLE, SYSTEM_ROOT};
pub use lock::TableLock;
pub use record::{escape_field, unescape_field, MountRecord, DEFAULT_FSTYPE, DEFAULT_OPTIONS};
pub use table::{resolve_device_spec, MountTable};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mount table I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mount table lock failed: {0}")]
    LockFailed(String),
    #[error("mount table path has no parent directory: {0}")]
    NoParent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_lock_failed() {
        let e = StoreError::LockFailed("busy".to_owned());
        assert!(e.to_string().contains("busy"));
    }

    #[test]
    fn store_error_display_no_parent() {
        let e = StoreError::NoParent("/".to_owned());
        assert!(e.to_string().contains("no parent"));
    }
}
