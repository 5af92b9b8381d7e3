//! Execution layer for distmig: running external programs and performing mounts.
//!
//! `CommandExecutor` abstracts process execution (`SystemCommandRunner` for
//! real runs, `MockCommandRunner` for tests). `MountBackend` abstracts the
//! mount/unmount primitives, and `MountOperator` builds the ordered apply,
//! rollback and teardown discipline on top of it. `DeviceProbe` lists
//! candidate root partitions and `PackageManager` wraps the package manager
//! binary.

pub mod command;
pub mod mock;
pub mod mount;
pub mod operator;
pub mod package;
pub mod probe;

pub use command::{argv, which, CommandExecutor, CommandOutput, SystemCommandRunner};
pub use mock::{MockCommandRunner, MockMountBackend, MountCall, StaticProbe};
pub use mount::{CommandMountBackend, MountBackend};
pub use operator::{MountOperator, SoftFailure, TeardownReport};
pub use package::{CommandPackageManager, PackageManager};
pub use probe::{DeviceProbe, LsblkProbe};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("empty command line")]
    EmptyCommand,
    #[error("command not found: {0}")]
    CommandNotFound(String),
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("'{command}' exited with {code}: stdout: {stdout}; stderr: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("mount on {} failed: {reason}", mountpoint.display())]
    MountFailed { mountpoint: PathBuf, reason: String },
    #[error("mount sequence failed ({} mounts rolled back): {cause}", rollback.unmounted.len())]
    SystemMount {
        #[source]
        cause: Box<RuntimeError>,
        rollback: TeardownReport,
    },
    #[error("internal runtime error: {0}")]
    Internal(String),
}
