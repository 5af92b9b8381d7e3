use crate::stage::{StageName, StageReport};
use crate::{boot, host, migrate, system, MigrationError};
use distmig_runtime::{
    CommandExecutor, CommandMountBackend, CommandPackageManager, DeviceProbe, LsblkProbe,
    MountBackend, MountOperator, PackageManager, SoftFailure, SystemCommandRunner,
};
use distmig_schema::MigrationConfig;
use distmig_store::{MigrationLayout, MountTable, TableLock};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Span};

/// Logging span every line of a stage run is attributed to.
pub fn stage_span(stage: StageName) -> Span {
    info_span!("stage", name = %stage)
}

/// Everything a stage body works with during one run.
pub struct StageContext<'p> {
    pub layout: &'p MigrationLayout,
    /// Host config with the target system's overlay applied, when present.
    pub config: MigrationConfig,
    /// Persisted mount table; exported again when the stage succeeds.
    pub table: MountTable,
    pub operator: MountOperator<'p>,
    pub runner: &'p dyn CommandExecutor,
    pub probe: &'p dyn DeviceProbe,
    pub package_manager: &'p dyn PackageManager,
    soft_failures: Vec<SoftFailure>,
    skipped: bool,
}

impl StageContext<'_> {
    /// Record that the stage had nothing to do.
    pub fn skip(&mut self, reason: &str) {
        info!("skipped: {reason}");
        self.skipped = true;
    }

    pub fn record_soft_failures(&mut self, failures: Vec<SoftFailure>) {
        self.soft_failures.extend(failures);
    }
}

/// Runs migration stages against a host.
///
/// Each call to [`run_stage`](Self::run_stage) is a complete unit: it locks
/// the mount table, reads it, runs the stage body, and writes the table back
/// only when the body succeeded. A failed body has its own mounts rolled back.
pub struct Pipeline {
    layout: MigrationLayout,
    config: MigrationConfig,
    runner: Arc<dyn CommandExecutor>,
    mounts: Arc<dyn MountBackend>,
    probe: Arc<dyn DeviceProbe>,
    package_manager: Option<Arc<dyn PackageManager>>,
    span: Option<Span>,
}

impl Pipeline {
    pub fn new(
        layout: MigrationLayout,
        config: MigrationConfig,
        runner: Arc<dyn CommandExecutor>,
        mounts: Arc<dyn MountBackend>,
    ) -> Self {
        let probe = Arc::new(LsblkProbe::new(Arc::clone(&runner)));
        Self {
            layout,
            config,
            runner,
            mounts,
            probe,
            package_manager: None,
            span: None,
        }
    }

    /// Pipeline acting on the real system: external programs and `mount(8)`.
    pub fn system(layout: MigrationLayout, config: MigrationConfig, span: Span) -> Self {
        let runner: Arc<dyn CommandExecutor> =
            Arc::new(SystemCommandRunner::new().with_span(span.clone()));
        let mounts = Arc::new(CommandMountBackend::new(Arc::clone(&runner)));
        Self::new(layout, config, runner, mounts).with_span(span)
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Use `package_manager` instead of the configured program.
    #[must_use]
    pub fn with_package_manager(mut self, package_manager: Arc<dyn PackageManager>) -> Self {
        self.package_manager = Some(package_manager);
        self
    }

    /// Run stages inside `span` instead of a fresh [`stage_span`].
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn layout(&self) -> &MigrationLayout {
        &self.layout
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    fn effective_config(&self) -> Result<MigrationConfig, MigrationError> {
        let overlay = self.layout.target_config_file();
        let config = self.config.with_overlay_file(&overlay)?;
        if config != self.config {
            info!("applied migration config overlay {}", overlay.display());
        }
        Ok(config)
    }

    pub fn run_stage(&self, stage: StageName) -> Result<StageReport, MigrationError> {
        let span = self.span.clone().unwrap_or_else(|| stage_span(stage));
        let _enter = span.enter();
        info!("running stage {}/{}: {stage}", stage.position(), StageName::ALL.len());

        let table_path = self.layout.mount_table();
        let lock_path = self.layout.table_lock();
        let _lock = match TableLock::try_acquire(&lock_path)? {
            Some(lock) => lock,
            None => {
                warn!("mount table is locked by another stage, waiting");
                TableLock::acquire(&lock_path)?
            }
        };
        let table = MountTable::read_if_exists(&table_path)?;
        debug!("mount table has {} entries", table.len());

        let config = self.effective_config()?;
        let package_manager: Arc<dyn PackageManager> = match &self.package_manager {
            Some(pm) => Arc::clone(pm),
            None => Arc::new(CommandPackageManager::new(
                config.package_manager.program.clone(),
                Arc::clone(&self.runner),
            )),
        };

        let mut ctx = StageContext {
            layout: &self.layout,
            config,
            table,
            operator: MountOperator::new(self.mounts.as_ref()).with_span(span.clone()),
            runner: self.runner.as_ref(),
            probe: self.probe.as_ref(),
            package_manager: package_manager.as_ref(),
            soft_failures: Vec::new(),
            skipped: false,
        };

        let mut outcome = run_body(stage, &mut ctx);
        if outcome.is_ok() {
            outcome = ctx.table.export(&table_path).map_err(MigrationError::from);
        }

        if let Err(e) = outcome {
            error!("stage {stage} failed: {e}");
            let rollback = ctx.operator.rollback();
            if !rollback.unmounted.is_empty() || !rollback.is_clean() {
                info!(
                    "rolled back {} mount(s), {} could not be unmounted",
                    rollback.unmounted.len(),
                    rollback.soft_failures.len()
                );
            }
            return Err(e);
        }

        info!("stage {stage} finished");
        Ok(StageReport {
            stage,
            mounted: ctx.operator.mounted_this_run().to_vec(),
            soft_failures: ctx.soft_failures,
            skipped: ctx.skipped,
            finished_at: chrono::Utc::now(),
        })
    }

    /// Run the stages in order, stopping at the first failure.
    pub fn run_all(&self) -> Result<Vec<StageReport>, MigrationError> {
        StageName::ALL
            .into_iter()
            .map(|stage| self.run_stage(stage))
            .collect()
    }
}

fn run_body(stage: StageName, ctx: &mut StageContext<'_>) -> Result<(), MigrationError> {
    match stage {
        StageName::DiscoverRoot => system::discover_root(ctx),
        StageName::MountSystem => system::mount_system(ctx),
        StageName::Prepare => host::prepare(ctx),
        StageName::SetupNetwork => host::setup_network(ctx),
        StageName::Migrate => migrate::migrate(ctx),
        StageName::PostMount => host::post_mount(ctx),
        StageName::UpdateBootloader => boot::update_bootloader(ctx),
        StageName::LoadKernel => boot::load_kernel(ctx),
        StageName::UnmountSystem => system::unmount_system(ctx),
        StageName::Reboot => boot::reboot(ctx),
    }
}
