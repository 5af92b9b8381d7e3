//! Configuration schema and migration target identity for distmig.
//!
//! This crate defines the read-only inputs every pipeline stage consumes: the
//! TOML migration configuration (`MigrationConfig`), including the optional
//! overlay shipped inside the target system, and the
//! `MigrationTarget` descriptor naming the product the system migrates to.

pub mod config;
pub mod target;

pub use config::{
    parse_config_file, parse_config_str, BootloaderSection, ConfigError, MigrationConfig,
    NetworkSection, PackageManagerSection, PreserveSection,
};
pub use target::{host_arch, MigrationTarget, TargetError, FALLBACK_IDENTIFIER, FALLBACK_VERSION};
