use crate::target::MigrationTarget;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read migration config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse migration config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to merge migration config: {0}")]
    Merge(#[from] toml::ser::Error),
    #[error("unsupported config_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("invalid migration_product '{0}', expected '<identifier>/<version>/<arch>'")]
    InvalidProduct(String),
    #[error("{0} must not be empty")]
    EmptyCommand(&'static str),
    #[error("path '{path}' in {field} must be absolute")]
    RelativePath { path: String, field: &'static str },
}

/// Validated migration configuration, loaded once per stage process.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    /// Leaves the system in its migrated, pre-reboot state.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_true")]
    pub soft_reboot: bool,
    #[serde(default)]
    pub verbose_migration: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_product: Option<String>,
    #[serde(default)]
    pub package_manager: PackageManagerSection,
    #[serde(default)]
    pub preserve: PreserveSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub bootloader: BootloaderSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageManagerSection {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_metadata_paths")]
    pub metadata_paths: Vec<String>,
    #[serde(default = "default_credential_paths")]
    pub credential_paths: Vec<String>,
    #[serde(default = "default_certificate_paths")]
    pub certificate_paths: Vec<String>,
    #[serde(default = "default_update_ca_command")]
    pub update_ca_command: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for PackageManagerSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            metadata_paths: default_metadata_paths(),
            credential_paths: default_credential_paths(),
            certificate_paths: default_certificate_paths(),
            update_ca_command: default_update_ca_command(),
            extra_args: Vec::new(),
        }
    }
}

/// Files copied from the target system into the live host before migration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PreserveSection {
    /// udev rule globs; copying any of them triggers a udev reload.
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default, rename = "static")]
    pub static_files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    #[serde(default = "default_network_paths")]
    pub config_paths: Vec<String>,
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            config_paths: default_network_paths(),
            reload_command: default_reload_command(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BootloaderSection {
    #[serde(default = "default_bootloader_command")]
    pub command: Vec<String>,
}

impl Default for BootloaderSection {
    fn default() -> Self {
        Self {
            command: default_bootloader_command(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            debug: false,
            soft_reboot: true,
            verbose_migration: false,
            migration_product: None,
            package_manager: PackageManagerSection::default(),
            preserve: PreserveSection::default(),
            network: NetworkSection::default(),
            bootloader: BootloaderSection::default(),
        }
    }
}

fn default_config_version() -> u32 {
    CONFIG_VERSION
}

fn default_true() -> bool {
    true
}

fn default_program() -> String {
    "zypper".to_owned()
}

fn default_metadata_paths() -> Vec<String> {
    vec![
        "/etc/zypp".to_owned(),
        "/usr/lib/zypp/plugins/services".to_owned(),
    ]
}

fn default_credential_paths() -> Vec<String> {
    vec!["/etc/SUSEConnect".to_owned()]
}

fn default_certificate_paths() -> Vec<String> {
    vec!["/etc/pki/trust/anchors".to_owned()]
}

fn default_update_ca_command() -> Vec<String> {
    vec!["update-ca-certificates".to_owned()]
}

fn default_network_paths() -> Vec<String> {
    vec![
        "/etc/sysconfig/network".to_owned(),
        "/etc/NetworkManager/system-connections".to_owned(),
    ]
}

fn default_reload_command() -> Vec<String> {
    vec![
        "systemctl".to_owned(),
        "reload-or-restart".to_owned(),
        "network".to_owned(),
    ]
}

fn default_bootloader_command() -> Vec<String> {
    vec![
        "grub2-mkconfig".to_owned(),
        "-o".to_owned(),
        "/boot/grub2/grub.cfg".to_owned(),
    ]
}

impl MigrationConfig {
    /// Load the config at `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("no migration config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        parse_config_file(path)
    }

    /// Apply a partial config on top of this one. Keys set in `overlay` win;
    /// nested tables are merged key by key.
    pub fn with_overlay_str(&self, overlay: &str) -> Result<Self, ConfigError> {
        let overlay: toml::Table = toml::from_str(overlay)?;
        let mut base = match toml::Value::try_from(self)? {
            toml::Value::Table(table) => table,
            _ => toml::Table::new(),
        };
        merge_table(&mut base, overlay);
        let merged: MigrationConfig = toml::Value::Table(base).try_into()?;
        merged.validate()?;
        Ok(merged)
    }

    /// Overlay the config file shipped inside the target system, if any.
    pub fn with_overlay_file(&self, path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(self.clone());
        }
        debug!("applying target system config overlay {}", path.display());
        let content = fs::read_to_string(path)?;
        self.with_overlay_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.config_version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.config_version));
        }
        if let Some(product) = &self.migration_product {
            MigrationTarget::parse(product)
                .map_err(|_| ConfigError::InvalidProduct(product.clone()))?;
        }
        if self.package_manager.program.trim().is_empty() {
            return Err(ConfigError::EmptyCommand("package_manager.program"));
        }
        if self.bootloader.command.is_empty() {
            return Err(ConfigError::EmptyCommand("bootloader.command"));
        }

        let checked: [(&'static str, &[String]); 6] = [
            ("package_manager.metadata_paths", &self.package_manager.metadata_paths),
            ("package_manager.credential_paths", &self.package_manager.credential_paths),
            ("package_manager.certificate_paths", &self.package_manager.certificate_paths),
            ("preserve.rules", &self.preserve.rules),
            ("preserve.static", &self.preserve.static_files),
            ("network.config_paths", &self.network.config_paths),
        ];
        for (field, paths) in checked {
            if let Some(bad) = paths.iter().find(|p| !p.starts_with('/')) {
                return Err(ConfigError::RelativePath {
                    path: bad.clone(),
                    field,
                });
            }
        }
        Ok(())
    }

    pub fn is_debug_requested(&self) -> bool {
        self.debug
    }

    pub fn is_soft_reboot_requested(&self) -> bool {
        self.soft_reboot
    }

    pub fn is_verbose_migration_requested(&self) -> bool {
        self.verbose_migration
    }

    pub fn get_preserve_rules(&self) -> &[String] {
        &self.preserve.rules
    }

    pub fn get_preserve_static(&self) -> &[String] {
        &self.preserve.static_files
    }
}

fn merge_table(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_table(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

pub fn parse_config_str(input: &str) -> Result<MigrationConfig, ConfigError> {
    let config: MigrationConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<MigrationConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}
