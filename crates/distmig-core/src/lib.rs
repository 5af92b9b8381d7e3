//! Migration pipeline for distmig.
//!
//! Ten stages run one at a time, usually each in its own process. They hand
//! state to each other through the persisted mount table, which every stage
//! reads under an advisory lock, extends or shrinks, and rewrites before it
//! exits. A failing stage unmounts whatever it mounted itself, newest first,
//! and reports a stage-specific `MigrationError` without touching the table.

mod boot;
mod fsops;
mod host;
mod migrate;
pub mod pipeline;
pub mod stage;
mod system;

pub use pipeline::{stage_span, Pipeline, StageContext};
pub use stage::{StageName, StageReport, UnknownStage};

use distmig_runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("no system to migrate found: {0}")]
    SystemNotFound(String),
    #[error("mounting the system failed: {0}")]
    SystemMount(#[source] RuntimeError),
    #[error("package manager setup failed: {0}")]
    PackageManagerSetup(String),
    #[error("host network setup failed: {0}")]
    HostNetwork(String),
    #[error("package manager migration failed: {0}")]
    PackageManagerMigration(String),
    #[error("base product not found: {0}")]
    ProductNotFound(String),
    #[error("migration product setup failed: {0}")]
    ProductSetup(String),
    #[error("post-mount actions failed: {0}")]
    PostMount(String),
    #[error("bootloader update failed: {0}")]
    Bootloader(String),
    #[error("kernel load failed: {0}")]
    KernelLoad(String),
    #[error("reboot failed: {0}")]
    Reboot(String),
    #[error("configuration error: {0}")]
    Config(#[from] distmig_schema::ConfigError),
    #[error("mount table error: {0}")]
    Table(#[from] distmig_store::StoreError),
}

impl MigrationError {
    /// Whether the failure left a mount sequence rolled back.
    pub fn is_mount_failure(&self) -> bool {
        matches!(self, Self::SystemMount(_))
    }
}
