use crate::command::{argv, CommandExecutor};
use crate::RuntimeError;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Lists block devices that may hold the root filesystem of the system to migrate.
pub trait DeviceProbe: Send + Sync {
    fn candidates(&self) -> Result<Vec<PathBuf>, RuntimeError>;
}

/// Candidates from `lsblk`: partitions, logical volumes, RAID and crypt mappings.
pub struct LsblkProbe {
    runner: Arc<dyn CommandExecutor>,
}

impl LsblkProbe {
    pub fn new(runner: Arc<dyn CommandExecutor>) -> Self {
        Self { runner }
    }
}

fn is_candidate_type(kind: &str) -> bool {
    matches!(kind, "part" | "lvm" | "crypt" | "md") || kind.starts_with("raid")
}

/// Parse `lsblk -p -n -r -o NAME,TYPE` output.
pub fn parse_lsblk(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let kind = fields.next()?;
            is_candidate_type(kind).then(|| PathBuf::from(name))
        })
        .collect()
}

impl DeviceProbe for LsblkProbe {
    fn candidates(&self) -> Result<Vec<PathBuf>, RuntimeError> {
        let out = self
            .runner
            .run(&argv(&["lsblk", "-p", "-n", "-r", "-o", "NAME,TYPE"]), None, true)?;
        let devices = parse_lsblk(&out.output);
        debug!("root candidates: {devices:?}");
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCommandRunner;

    const LSBLK: &str = "\
/dev/sda disk
/dev/sda1 part
/dev/sda2 part
/dev/sr0 rom
/dev/mapper/system-root lvm
/dev/md0 raid1
/dev/mapper/luks-1 crypt
/dev/loop0 loop
";

    #[test]
    fn parse_keeps_only_filesystem_carriers() {
        assert_eq!(
            parse_lsblk(LSBLK),
            vec![
                PathBuf::from("/dev/sda1"),
                PathBuf::from("/dev/sda2"),
                PathBuf::from("/dev/mapper/system-root"),
                PathBuf::from("/dev/md0"),
                PathBuf::from("/dev/mapper/luks-1"),
            ]
        );
    }

    #[test]
    fn parse_ignores_malformed_lines() {
        assert!(parse_lsblk("\n/dev/sda\n").is_empty());
    }

    #[test]
    fn probe_runs_lsblk() {
        let runner = Arc::new(MockCommandRunner::new().with_output("lsblk", LSBLK));
        let probe = LsblkProbe::new(runner.clone());
        assert_eq!(probe.candidates().unwrap().len(), 5);
        assert_eq!(
            runner.calls(),
            vec![argv(&["lsblk", "-p", "-n", "-r", "-o", "NAME,TYPE"])]
        );
    }
}
