use crate::config::MigrationConfig;
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const FALLBACK_IDENTIFIER: &str = "SLES";
pub const FALLBACK_VERSION: &str = "15.5";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid migration product '{0}', expected '<identifier>/<version>/<arch>'")]
    Invalid(String),
    #[error("invalid migration image name pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// The product a migration run moves the system to. Computed once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTarget {
    pub identifier: String,
    pub version: String,
    pub arch: String,
}

impl fmt::Display for MigrationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.identifier, self.version, self.arch)
    }
}

const IMAGE_NAME_PATTERN: &str = r"^(?P<id>[A-Za-z][A-Za-z_]*?)(?P<major>\d+)-SP(?P<sp>\d+).*Migration.*\.(?P<arch>x86_64|aarch64|ppc64le|s390x)";

fn image_name_pattern() -> Result<Regex, TargetError> {
    Ok(Regex::new(IMAGE_NAME_PATTERN)?)
}

/// Architecture name as the package manager expects it.
pub fn host_arch() -> String {
    match std::env::consts::ARCH {
        "powerpc64" => "ppc64le".to_owned(),
        other => other.to_owned(),
    }
}

impl MigrationTarget {
    /// Parse an explicit `ID/VERSION/ARCH` product string.
    pub fn parse(product: &str) -> Result<Self, TargetError> {
        let parts: Vec<&str> = product.split('/').collect();
        match parts.as_slice() {
            [id, version, arch] if !id.is_empty() && !version.is_empty() && !arch.is_empty() => {
                Ok(Self {
                    identifier: (*id).to_owned(),
                    version: (*version).to_owned(),
                    arch: (*arch).to_owned(),
                })
            }
            _ => Err(TargetError::Invalid(product.to_owned())),
        }
    }

    /// Derive the target from a migration image file name such as
    /// `SLES15-SP5_Migration.x86_64-2.0.40.iso`.
    pub fn from_image_name(name: &str) -> Result<Option<Self>, TargetError> {
        Ok(Self::match_image_name(&image_name_pattern()?, name))
    }

    fn match_image_name(pattern: &Regex, name: &str) -> Option<Self> {
        let caps = pattern.captures(name)?;
        Some(Self {
            identifier: caps["id"].to_owned(),
            version: format!("{}.{}", &caps["major"], &caps["sp"]),
            arch: caps["arch"].to_owned(),
        })
    }

    pub fn fallback() -> Self {
        Self {
            identifier: FALLBACK_IDENTIFIER.to_owned(),
            version: FALLBACK_VERSION.to_owned(),
            arch: host_arch(),
        }
    }

    /// Resolve the target for this run: explicit config, then the first
    /// recognizable file in `image_dir`, then the hardcoded fallback.
    pub fn detect(config: &MigrationConfig, image_dir: &Path) -> Result<Self, TargetError> {
        if let Some(product) = &config.migration_product {
            let target = Self::parse(product)?;
            info!("migration target from config: {target}");
            return Ok(target);
        }

        match fs::read_dir(image_dir) {
            Ok(entries) => {
                let mut names: Vec<String> = entries
                    .flatten()
                    .filter_map(|e| e.file_name().to_str().map(str::to_owned))
                    .collect();
                names.sort();
                let pattern = image_name_pattern()?;
                if let Some(target) = names
                    .iter()
                    .find_map(|n| Self::match_image_name(&pattern, n))
                {
                    info!("migration target from image name: {target}");
                    return Ok(target);
                }
                debug!("no migration image name recognized in {}", image_dir.display());
            }
            Err(e) => debug!("cannot scan {}: {e}", image_dir.display()),
        }

        let target = Self::fallback();
        warn!("migration target detection failed, using fallback {target}");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_explicit_product() {
        let t = MigrationTarget::parse("SLES/15.5/x86_64").unwrap();
        assert_eq!(t.identifier, "SLES");
        assert_eq!(t.version, "15.5");
        assert_eq!(t.arch, "x86_64");
        assert_eq!(t.to_string(), "SLES/15.5/x86_64");
    }

    #[test]
    fn parse_rejects_malformed_products() {
        assert!(MigrationTarget::parse("SLES/15.5").is_err());
        assert!(MigrationTarget::parse("SLES//x86_64").is_err());
        assert!(MigrationTarget::parse("a/b/c/d").is_err());
    }

    #[test]
    fn image_name_is_recognized() {
        let t = MigrationTarget::from_image_name("SLES15-SP5_Migration.x86_64-2.0.40.iso")
            .unwrap()
            .unwrap();
        assert_eq!(t.to_string(), "SLES/15.5/x86_64");

        let t = MigrationTarget::from_image_name("SLES_SAP15-SP4-Migration.aarch64.iso")
            .unwrap()
            .unwrap();
        assert_eq!(t.identifier, "SLES_SAP");
        assert_eq!(t.version, "15.4");
    }

    #[test]
    fn image_name_pattern_compiles() {
        let pattern = image_name_pattern().unwrap();
        assert!(pattern.is_match("SLES15-SP6-Migration.s390x.iso"));
    }

    #[test]
    fn unrelated_file_names_are_ignored() {
        assert!(MigrationTarget::from_image_name("README").unwrap().is_none());
        assert!(MigrationTarget::from_image_name("SLES15-SP5.x86_64.iso")
            .unwrap()
            .is_none());
    }

    #[test]
    fn detect_prefers_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("SLES15-SP4_Migration.x86_64.iso"), "").unwrap();
        let config = MigrationConfig {
            migration_product: Some("SLES/15.6/s390x".to_owned()),
            ..MigrationConfig::default()
        };
        let t = MigrationTarget::detect(&config, dir.path()).unwrap();
        assert_eq!(t.to_string(), "SLES/15.6/s390x");
    }

    #[test]
    fn detect_uses_image_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::write(dir.path().join("SLES15-SP4_Migration.ppc64le.iso"), "").unwrap();
        let t = MigrationTarget::detect(&MigrationConfig::default(), dir.path()).unwrap();
        assert_eq!(t.to_string(), "SLES/15.4/ppc64le");
    }

    #[test]
    fn detect_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let t = MigrationTarget::detect(&MigrationConfig::default(), &dir.path().join("missing"))
            .unwrap();
        assert_eq!(t, MigrationTarget::fallback());
        assert_eq!(t.identifier, FALLBACK_IDENTIFIER);
    }
}
