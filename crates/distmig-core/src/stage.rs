use chrono::{DateTime, Utc};
use distmig_runtime::SoftFailure;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// The migration stages, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    DiscoverRoot,
    MountSystem,
    Prepare,
    SetupNetwork,
    Migrate,
    PostMount,
    UpdateBootloader,
    LoadKernel,
    UnmountSystem,
    Reboot,
}

impl StageName {
    pub const ALL: [StageName; 10] = [
        StageName::DiscoverRoot,
        StageName::MountSystem,
        StageName::Prepare,
        StageName::SetupNetwork,
        StageName::Migrate,
        StageName::PostMount,
        StageName::UpdateBootloader,
        StageName::LoadKernel,
        StageName::UnmountSystem,
        StageName::Reboot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::DiscoverRoot => "discover-root",
            StageName::MountSystem => "mount-system",
            StageName::Prepare => "prepare",
            StageName::SetupNetwork => "setup-network",
            StageName::Migrate => "migrate",
            StageName::PostMount => "post-mount",
            StageName::UpdateBootloader => "update-bootloader",
            StageName::LoadKernel => "load-kernel",
            StageName::UnmountSystem => "unmount-system",
            StageName::Reboot => "reboot",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            StageName::DiscoverRoot => "find the root filesystem of the system to migrate",
            StageName::MountSystem => "mount the system tree under the system root",
            StageName::Prepare => "make package manager metadata and credentials available",
            StageName::SetupNetwork => "apply the system's network configuration to the host",
            StageName::Migrate => "run the package manager migration",
            StageName::PostMount => "preserve selected files from the system",
            StageName::UpdateBootloader => "regenerate the bootloader configuration",
            StageName::LoadKernel => "load the migrated kernel for a soft reboot",
            StageName::UnmountSystem => "unmount everything in reverse order",
            StageName::Reboot => "reboot into the migrated system",
        }
    }

    /// 1-based position in the pipeline.
    pub fn position(self) -> usize {
        StageName::ALL
            .iter()
            .position(|s| *s == self)
            .map_or(0, |i| i + 1)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown stage '{0}'")]
pub struct UnknownStage(pub String);

impl FromStr for StageName {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStage(s.to_owned()))
    }
}

/// Outcome of one successful stage run.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: StageName,
    /// Mounts this run performed that are still in place.
    pub mounted: Vec<PathBuf>,
    /// Unmounts that failed and were tolerated.
    pub soft_failures: Vec<SoftFailure>,
    /// The stage found nothing to do.
    pub skipped: bool,
    pub finished_at: DateTime<Utc>,
}
