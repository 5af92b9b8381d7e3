use crate::mount::MountBackend;
use crate::RuntimeError;
use distmig_store::{MountRecord, MountTable};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Span};

/// An unmount that failed during teardown and was tolerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftFailure {
    pub mountpoint: PathBuf,
    pub reason: String,
}

/// Outcome of a rollback or teardown pass. Never an error: what could not be
/// unmounted is reported in `soft_failures`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub unmounted: Vec<PathBuf>,
    pub soft_failures: Vec<SoftFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.soft_failures.is_empty()
    }
}

/// Applies and unwinds mount tables on top of a [`MountBackend`].
///
/// The operator remembers every mount it performed in its own lifetime.
/// A failing [`apply`](Self::apply) unmounts exactly those, newest first,
/// before returning. [`teardown`](Self::teardown) works from a persisted
/// table instead, so it can undo mounts made by an earlier process.
pub struct MountOperator<'b> {
    backend: &'b dyn MountBackend,
    mounted: Vec<PathBuf>,
    span: Span,
}

impl<'b> MountOperator<'b> {
    pub fn new(backend: &'b dyn MountBackend) -> Self {
        Self {
            backend,
            mounted: Vec::new(),
            span: Span::current(),
        }
    }

    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Mount points performed by this operator that are still mounted, oldest first.
    pub fn mounted_this_run(&self) -> &[PathBuf] {
        &self.mounted
    }

    pub fn is_mounted(&self, path: &Path) -> Result<bool, RuntimeError> {
        let _enter = self.span.enter();
        self.backend.is_mounted(path)
    }

    /// Mount every record of `table` below `root`, in table order.
    ///
    /// Returns the applied table, each mountpoint rewritten to its absolute
    /// location under `root`. Missing target directories are created. On the
    /// first failure everything this operator has mounted is rolled back and
    /// [`RuntimeError::SystemMount`] carries the cause and the rollback outcome.
    pub fn apply(&mut self, table: &MountTable, root: &Path) -> Result<MountTable, RuntimeError> {
        let span = self.span.clone();
        let _enter = span.enter();
        let mut applied = MountTable::new();
        for record in table {
            let target = record.rebased(root);
            if let Err(cause) = self.mount_one(record, target.mountpoint()) {
                warn!(
                    "mounting {} on {} failed: {cause}",
                    record.device().display(),
                    target.mountpoint().display()
                );
                let rollback = self.rollback_inner();
                return Err(RuntimeError::SystemMount {
                    cause: Box::new(cause),
                    rollback,
                });
            }
            applied.push(target);
        }
        Ok(applied)
    }

    /// Mount a single record at its own mountpoint and remember it.
    pub fn mount(&mut self, record: &MountRecord) -> Result<(), RuntimeError> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.mount_one(record, record.mountpoint())
    }

    fn mount_one(&mut self, record: &MountRecord, target: &Path) -> Result<(), RuntimeError> {
        if !target.exists() {
            std::fs::create_dir_all(target)?;
        }
        debug!(
            "mount {} on {} ({} {})",
            record.device().display(),
            target.display(),
            record.filesystem_type(),
            record.options()
        );
        self.backend.mount(record, target)?;
        self.mounted.push(target.to_path_buf());
        Ok(())
    }

    /// Unmount everything mounted by this operator, newest first.
    pub fn rollback(&mut self) -> TeardownReport {
        let span = self.span.clone();
        let _enter = span.enter();
        self.rollback_inner()
    }

    fn rollback_inner(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.mounted.is_empty() {
            return report;
        }
        info!("rolling back {} mount(s)", self.mounted.len());
        while let Some(mountpoint) = self.mounted.pop() {
            self.unmount_soft(mountpoint, false, &mut report);
        }
        report
    }

    /// Lazily unmount every record of `table`, last entry first.
    ///
    /// Failures are logged and collected, never raised. Mountpoints that
    /// this operator mounted itself are forgotten once unmounted.
    pub fn teardown(&mut self, table: &MountTable) -> TeardownReport {
        let span = self.span.clone();
        let _enter = span.enter();
        let mut report = TeardownReport::default();
        for record in table.get_devices().iter().rev() {
            let mountpoint = record.mountpoint().to_path_buf();
            if let Some(pos) = self.mounted.iter().rposition(|m| *m == mountpoint) {
                self.mounted.remove(pos);
            }
            self.unmount_soft(mountpoint, true, &mut report);
        }
        report
    }

    fn unmount_soft(&self, mountpoint: PathBuf, lazy: bool, report: &mut TeardownReport) {
        match self.backend.unmount(&mountpoint, lazy) {
            Ok(()) => {
                debug!("unmounted {}", mountpoint.display());
                report.unmounted.push(mountpoint);
            }
            Err(e) => {
                warn!("unmount of {} failed: {e}", mountpoint.display());
                report.soft_failures.push(SoftFailure {
                    mountpoint,
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockMountBackend, MountCall};

    fn three_records() -> MountTable {
        let mut t = MountTable::new();
        t.add_entry("/dev/sda2", "/", Some("ext4"), None);
        t.add_entry("/dev/sda3", "/home", Some("xfs"), None);
        t.add_entry("/dev/sda4", "/var", Some("btrfs"), Some("subvol=@var"));
        t
    }

    #[test]
    fn apply_rebases_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockMountBackend::new();
        let mut op = MountOperator::new(&backend);

        let applied = op.apply(&three_records(), dir.path()).unwrap();
        let mountpoints: Vec<_> = applied
            .get_devices()
            .iter()
            .map(|r| r.mountpoint().to_path_buf())
            .collect();
        assert_eq!(
            mountpoints,
            vec![
                dir.path().to_path_buf(),
                dir.path().join("home"),
                dir.path().join("var")
            ]
        );
        assert_eq!(applied.get_devices()[2].options(), "subvol=@var");
        assert!(dir.path().join("home").is_dir());
        assert_eq!(op.mounted_this_run().len(), 3);
    }

    #[test]
    fn teardown_reverses_apply_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockMountBackend::new();
        let mut op = MountOperator::new(&backend);
        let applied = op.apply(&three_records(), dir.path()).unwrap();

        let report = op.teardown(&applied);
        assert!(report.is_clean());

        let mut mounts = backend.mount_targets();
        mounts.reverse();
        assert_eq!(backend.unmount_targets(), mounts);
        assert!(op.mounted_this_run().is_empty());
        assert!(backend
            .calls()
            .iter()
            .all(|c| !matches!(c, MountCall::Unmount { lazy: false, .. })));
    }

    #[test]
    fn failure_in_middle_rolls_back_first_only() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockMountBackend::new().failing_mount_at(dir.path().join("home"));
        let mut op = MountOperator::new(&backend);

        let err = op.apply(&three_records(), dir.path()).unwrap_err();
        match err {
            RuntimeError::SystemMount { rollback, .. } => {
                assert_eq!(rollback.unmounted, vec![dir.path().to_path_buf()]);
                assert!(rollback.is_clean());
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(
            backend.mount_targets(),
            vec![dir.path().to_path_buf(), dir.path().join("home")]
        );
        assert_eq!(backend.unmount_targets(), vec![dir.path().to_path_buf()]);
        assert!(op.mounted_this_run().is_empty());
    }

    #[test]
    fn rollback_covers_earlier_apply_calls_too() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockMountBackend::new().failing_mount_at(dir.path().join("sys"));
        let mut op = MountOperator::new(&backend);

        let mut first = MountTable::new();
        first.add_entry("/dev/sda2", "/", Some("ext4"), None);
        op.apply(&first, dir.path()).unwrap();

        let mut binds = MountTable::new();
        binds.push(MountRecord::bind("/dev", "/dev"));
        binds.push(MountRecord::bind("/sys", "/sys"));
        assert!(op.apply(&binds, dir.path()).is_err());

        assert_eq!(
            backend.unmount_targets(),
            vec![dir.path().join("dev"), dir.path().to_path_buf()]
        );
    }

    #[test]
    fn teardown_soft_fails_busy_mounts_and_continues() {
        let backend = MockMountBackend::new()
            .with_mounted("/system-root")
            .with_mounted("/system-root/home")
            .failing_unmount_at("/system-root/home");
        let mut op = MountOperator::new(&backend);

        let mut persisted = MountTable::new();
        persisted.add_entry("/dev/sda2", "/system-root", Some("ext4"), None);
        persisted.add_entry("/dev/sda3", "/system-root/home", Some("xfs"), None);

        let report = op.teardown(&persisted);
        assert_eq!(report.unmounted, vec![PathBuf::from("/system-root")]);
        assert_eq!(report.soft_failures.len(), 1);
        assert_eq!(
            report.soft_failures[0].mountpoint,
            PathBuf::from("/system-root/home")
        );
        assert_eq!(
            backend.unmount_targets(),
            vec![
                PathBuf::from("/system-root/home"),
                PathBuf::from("/system-root")
            ]
        );
    }

    #[test]
    fn operator_with_stage_span_mounts_and_unwinds() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockMountBackend::new();
        let mut op = MountOperator::new(&backend)
            .with_span(tracing::info_span!("stage", name = "mount-system"));

        let applied = op.apply(&three_records(), dir.path()).unwrap();
        op.mount(&MountRecord::bind("/run", dir.path().join("run")))
            .unwrap();
        assert_eq!(op.mounted_this_run().len(), 4);

        let report = op.teardown(&applied);
        assert_eq!(report.unmounted.len(), 3);
        assert_eq!(op.mounted_this_run(), [dir.path().join("run")]);

        let report = op.rollback();
        assert_eq!(report.unmounted, vec![dir.path().join("run")]);
        assert!(op.mounted_this_run().is_empty());
    }

    #[test]
    fn rollback_with_nothing_mounted_is_empty() {
        let backend = MockMountBackend::new();
        let mut op = MountOperator::new(&backend);
        assert_eq!(op.rollback(), TeardownReport::default());
        assert!(backend.calls().is_empty());
    }
}
