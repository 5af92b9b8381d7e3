use crate::record::rebase;
use std::path::{Path, PathBuf};

/// Mountpoint of the system being migrated.
pub const SYSTEM_ROOT: &str = "/system-root";
/// Persisted mount table handed from stage to stage.
pub const MOUNT_TABLE: &str = "/etc/system-root.fstab";
/// Plan produced by root discovery and consumed by the mount stage.
pub const SOURCE_TABLE: &str = "/etc/system-root.source.fstab";
const TABLE_LOCK: &str = "/etc/system-root.fstab.lock";
const CONFIG_FILE: &str = "/etc/distmig/migration-config.toml";
const LOG_FILE: &str = "/var/log/distro_migration.log";
const MIGRATION_IMAGE_DIR: &str = "/migration-image";
const KERNEL_CMDLINE: &str = "/proc/cmdline";

/// Well-known paths of a migration host.
///
/// Every path is anchored at `host_root` (`/` on a real live system) so that
/// the whole pipeline can run against a scratch directory.
#[derive(Debug, Clone)]
pub struct MigrationLayout {
    host_root: PathBuf,
}

impl Default for MigrationLayout {
    fn default() -> Self {
        Self::new("/")
    }
}

impl MigrationLayout {
    pub fn new(host_root: impl Into<PathBuf>) -> Self {
        Self {
            host_root: host_root.into(),
        }
    }

    #[inline]
    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    /// Map an absolute host path below the host root.
    #[inline]
    pub fn host_path(&self, path: impl AsRef<Path>) -> PathBuf {
        rebase(&self.host_root, path.as_ref())
    }

    #[inline]
    pub fn system_root(&self) -> PathBuf {
        self.host_path(SYSTEM_ROOT)
    }

    /// Map an absolute path of the target system below the system root.
    #[inline]
    pub fn target_path(&self, path: impl AsRef<Path>) -> PathBuf {
        rebase(&self.system_root(), path.as_ref())
    }

    #[inline]
    pub fn mount_table(&self) -> PathBuf {
        self.host_path(MOUNT_TABLE)
    }

    #[inline]
    pub fn source_table(&self) -> PathBuf {
        self.host_path(SOURCE_TABLE)
    }

    #[inline]
    pub fn table_lock(&self) -> PathBuf {
        self.host_path(TABLE_LOCK)
    }

    #[inline]
    pub fn config_file(&self) -> PathBuf {
        self.host_path(CONFIG_FILE)
    }

    /// Customer config shipped inside the system being migrated.
    #[inline]
    pub fn target_config_file(&self) -> PathBuf {
        self.target_path(CONFIG_FILE)
    }

    #[inline]
    pub fn log_file(&self) -> PathBuf {
        self.host_path(LOG_FILE)
    }

    #[inline]
    pub fn target_log_file(&self) -> PathBuf {
        self.target_path(LOG_FILE)
    }

    #[inline]
    pub fn migration_image_dir(&self) -> PathBuf {
        self.host_path(MIGRATION_IMAGE_DIR)
    }

    #[inline]
    pub fn kernel_cmdline(&self) -> PathBuf {
        self.host_path(KERNEL_CMDLINE)
    }
}
