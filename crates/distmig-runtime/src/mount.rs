use crate::command::{argv, CommandExecutor};
use crate::RuntimeError;
use distmig_store::{unescape_field, MountRecord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Mount primitives the operator is built on.
pub trait MountBackend: Send + Sync {
    /// Mount `record.device()` on `target` with the record's type and options.
    fn mount(&self, record: &MountRecord, target: &Path) -> Result<(), RuntimeError>;

    /// Unmount `mountpoint`; `lazy` detaches it even while busy.
    fn unmount(&self, mountpoint: &Path, lazy: bool) -> Result<(), RuntimeError>;

    /// Side-effect free check whether `path` is currently a mount point.
    fn is_mounted(&self, path: &Path) -> Result<bool, RuntimeError>;
}

/// Mounts through the `mount`/`umount` programs and answers
/// [`is_mounted`](MountBackend::is_mounted) from the kernel mount list.
pub struct CommandMountBackend {
    runner: Arc<dyn CommandExecutor>,
    mounts_file: PathBuf,
}

impl CommandMountBackend {
    pub fn new(runner: Arc<dyn CommandExecutor>) -> Self {
        Self {
            runner,
            mounts_file: PathBuf::from("/proc/self/mounts"),
        }
    }

    /// Read mount points from another mounts-format file.
    #[must_use]
    pub fn with_mounts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_file = path.into();
        self
    }
}

/// Command line for mounting `record` on `target`.
pub fn mount_argv(record: &MountRecord, target: &Path) -> Vec<String> {
    let mut args = argv(&["mount"]);
    let fstype = record.filesystem_type();
    if !record.is_bind() && fstype != "none" && fstype != "auto" {
        args.push("-t".to_owned());
        args.push(fstype.to_owned());
    }
    if record.options() != "defaults" {
        args.push("-o".to_owned());
        args.push(record.options().to_owned());
    }
    args.push(record.device().to_string_lossy().into_owned());
    args.push(target.to_string_lossy().into_owned());
    args
}

/// Whether `path` appears as a mount point in a mounts-format listing.
pub fn listed_as_mount_point(mounts: &str, path: &Path) -> bool {
    mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|field| Path::new(&unescape_field(field)) == path)
    })
}

impl MountBackend for CommandMountBackend {
    fn mount(&self, record: &MountRecord, target: &Path) -> Result<(), RuntimeError> {
        self.runner.run(&mount_argv(record, target), None, true)?;
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path, lazy: bool) -> Result<(), RuntimeError> {
        let mut args = argv(&["umount"]);
        if lazy {
            args.push("--lazy".to_owned());
        }
        args.push(mountpoint.to_string_lossy().into_owned());
        self.runner.run(&args, None, true)?;
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> Result<bool, RuntimeError> {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mounts = std::fs::read_to_string(&self.mounts_file)?;
        let mounted = listed_as_mount_point(&mounts, &canonical);
        debug!("{} mounted: {mounted}", canonical.display());
        Ok(mounted)
    }
}
