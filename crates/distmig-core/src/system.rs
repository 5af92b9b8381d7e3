use crate::fsops::copy_path;
use crate::pipeline::StageContext;
use crate::MigrationError;
use distmig_store::{MountRecord, MountTable};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Kernel filesystems bound into the system root after its own tree.
const KERNEL_FILESYSTEMS: [&str; 3] = ["/dev", "/proc", "/sys"];

const FSTAB: &str = "/etc/fstab";

/// Put the `/` entry first, inserting one for `root_device` when the fstab
/// has no usable root line.
fn ensure_root_first(
    table: &MountTable,
    root_device: Option<&Path>,
) -> Result<MountTable, MigrationError> {
    let root = Path::new("/");
    let mut records: Vec<MountRecord> = table.get_devices().to_vec();
    match records.iter().position(|r| r.mountpoint() == root) {
        Some(0) => {}
        Some(pos) => {
            let entry = records.remove(pos);
            records.insert(0, entry);
        }
        None => {
            let Some(device) = root_device else {
                return Err(MigrationError::SystemNotFound(
                    "fstab of the mounted system has no usable root entry".to_owned(),
                ));
            };
            warn!("fstab has no usable root entry, using {}", device.display());
            records.insert(0, MountRecord::new(device, "/", None, None));
        }
    }
    Ok(MountTable::from_records(records))
}

/// Probe-mount each candidate at the system root until one carries an fstab.
fn probe_candidates(ctx: &mut StageContext<'_>) -> Result<(PathBuf, MountTable), MigrationError> {
    let system_root = ctx.layout.system_root();
    let fstab = ctx.layout.target_path(FSTAB);
    let candidates = ctx
        .probe
        .candidates()
        .map_err(|e| MigrationError::SystemNotFound(format!("listing block devices: {e}")))?;

    for device in candidates {
        let probe = MountTable::from_records(vec![MountRecord::new(&device, "/", None, None)]);
        if let Err(e) = ctx.operator.apply(&probe, &system_root) {
            debug!("{} is not mountable: {e}", device.display());
            continue;
        }

        let found = if fstab.is_file() {
            Some(MountTable::read_file(&fstab))
        } else {
            None
        };
        let rollback = ctx.operator.rollback();
        if !rollback.is_clean() {
            return Err(MigrationError::SystemNotFound(format!(
                "probe mount of {} could not be released",
                device.display()
            )));
        }

        match found {
            Some(Ok(table)) => {
                info!("found system root on {}", device.display());
                return Ok((device, table));
            }
            Some(Err(e)) => warn!("unreadable fstab on {}: {e}", device.display()),
            None => debug!("no {FSTAB} on {}", device.display()),
        }
    }
    Err(MigrationError::SystemNotFound(
        "no partition with an etc/fstab found".to_owned(),
    ))
}

/// Locate the root filesystem of the system to migrate and persist its
/// mount plan as the source table.
pub(crate) fn discover_root(ctx: &mut StageContext<'_>) -> Result<(), MigrationError> {
    let system_root = ctx.layout.system_root();
    let already_mounted = ctx
        .operator
        .is_mounted(&system_root)
        .map_err(|e| MigrationError::SystemNotFound(e.to_string()))?;

    let plan = if already_mounted {
        info!("{} already mounted, reading fstab in place", system_root.display());
        let fstab = MountTable::read_file(&ctx.layout.target_path(FSTAB))
            .map_err(|e| MigrationError::SystemNotFound(e.to_string()))?;
        ensure_root_first(&fstab, None)?
    } else {
        let (device, fstab) = probe_candidates(ctx)?;
        ensure_root_first(&fstab, Some(device.as_path()))?
    };

    let source = ctx.layout.source_table();
    plan.export(&source)?;
    info!("{} mount entries planned in {}", plan.len(), source.display());
    Ok(())
}

/// Mount the planned tree and the kernel filesystems under the system root.
pub(crate) fn mount_system(ctx: &mut StageContext<'_>) -> Result<(), MigrationError> {
    let system_root = ctx.layout.system_root();
    if ctx
        .operator
        .is_mounted(&system_root)
        .map_err(MigrationError::SystemMount)?
    {
        ctx.skip(&format!("{} is already mounted", system_root.display()));
        return Ok(());
    }

    let source = ctx.layout.source_table();
    let plan = MountTable::read_file(&source).map_err(|e| {
        MigrationError::SystemNotFound(format!("reading {}: {e}", source.display()))
    })?;
    if plan.is_empty() {
        return Err(MigrationError::SystemNotFound(format!(
            "{} has no mountable entries",
            source.display()
        )));
    }

    let mut applied = ctx
        .operator
        .apply(&plan.sorted_by_depth(), &system_root)
        .map_err(MigrationError::SystemMount)?;

    let kernel_fs = MountTable::from_records(
        KERNEL_FILESYSTEMS
            .iter()
            .map(|&path| MountRecord::bind(path, path))
            .collect(),
    );
    let binds = ctx
        .operator
        .apply(&kernel_fs, &system_root)
        .map_err(MigrationError::SystemMount)?;
    applied.extend(binds);

    info!("mounted {} entries under {}", applied.len(), system_root.display());
    ctx.table = applied;
    Ok(())
}

/// Unmount every persisted entry, last mounted first. Entries that could not
/// be unmounted stay in the table.
pub(crate) fn unmount_system(ctx: &mut StageContext<'_>) -> Result<(), MigrationError> {
    let log = ctx.layout.log_file();
    let target_log = ctx.layout.target_log_file();
    if log.is_file() && target_log.parent().is_some_and(Path::is_dir) {
        match copy_path(ctx.layout.host_root(), &log, &target_log) {
            Ok(_) => debug!("copied migration log to {}", target_log.display()),
            Err(e) => warn!("copying migration log failed: {e}"),
        }
    }

    if ctx.table.is_empty() {
        ctx.skip("mount table is empty");
        return Ok(());
    }

    let report = ctx.operator.teardown(&ctx.table);
    info!(
        "unmounted {} entries, {} left mounted",
        report.unmounted.len(),
        report.soft_failures.len()
    );

    let remaining: Vec<MountRecord> = ctx
        .table
        .get_devices()
        .iter()
        .filter(|r| {
            report
                .soft_failures
                .iter()
                .any(|f| f.mountpoint == r.mountpoint())
        })
        .cloned()
        .collect();
    ctx.table = MountTable::from_records(remaining);
    ctx.record_soft_failures(report.soft_failures);
    Ok(())
}
