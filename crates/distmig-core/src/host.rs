use crate::fsops::{copy_path, entry_exists};
use crate::pipeline::StageContext;
use crate::MigrationError;
use distmig_runtime::{argv, RuntimeError};
use distmig_store::MountRecord;
use glob::Pattern;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const AUTHORIZED_KEYS: &str = "/root/.ssh/authorized_keys";
const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Bind `path` of the system onto the same path of the host and record the
/// mount in the table.
fn bind_from_system(ctx: &mut StageContext<'_>, path: &str) -> Result<bool, RuntimeError> {
    let source = ctx.layout.target_path(path);
    if !source.is_dir() {
        debug!("{} not present, not binding", source.display());
        return Ok(false);
    }
    let target = ctx.layout.host_path(path);
    if ctx.table.contains_mountpoint(&target) {
        debug!("{} already bound", target.display());
        return Ok(false);
    }
    let record = MountRecord::bind(source, target);
    ctx.operator.mount(&record)?;
    ctx.table.push(record);
    Ok(true)
}

/// Copy `path` of the system onto the same path of the host.
fn copy_from_system(ctx: &StageContext<'_>, path: &str) -> std::io::Result<usize> {
    let source = ctx.layout.target_path(path);
    if !entry_exists(&source) {
        debug!("{} not present, not copying", source.display());
        return Ok(0);
    }
    copy_path(&ctx.layout.system_root(), &source, &ctx.layout.host_path(path))
}

/// Run an optional configured command; an empty one is not run.
fn run_configured(
    ctx: &StageContext<'_>,
    what: &str,
    command: &[String],
) -> Result<(), RuntimeError> {
    if command.is_empty() {
        info!("no {what} configured, skipping");
        return Ok(());
    }
    ctx.runner.run(command, None, true)?;
    Ok(())
}

/// Make the system's package manager state available to the host package manager.
pub(crate) fn prepare(ctx: &mut StageContext<'_>) -> Result<(), MigrationError> {
    let setup_error = |e: &dyn std::fmt::Display| MigrationError::PackageManagerSetup(e.to_string());

    let metadata_paths = ctx.config.package_manager.metadata_paths.clone();
    for path in &metadata_paths {
        if bind_from_system(ctx, path).map_err(|e| setup_error(&e))? {
            info!("bound {path} from the system");
        }
    }

    for path in &ctx.config.package_manager.credential_paths {
        let copied = copy_from_system(ctx, path).map_err(|e| setup_error(&e))?;
        if copied > 0 {
            info!("copied {copied} credential file(s) from {path}");
        }
    }

    let mut certificates = 0;
    for path in &ctx.config.package_manager.certificate_paths {
        certificates += copy_from_system(ctx, path).map_err(|e| setup_error(&e))?;
    }
    if certificates > 0 {
        info!("copied {certificates} certificate(s), updating trust store");
        run_configured(
            ctx,
            "certificate update command",
            &ctx.config.package_manager.update_ca_command,
        )
        .map_err(|e| setup_error(&e))?;
    }

    match copy_from_system(ctx, AUTHORIZED_KEYS) {
        Ok(0) => {}
        Ok(_) => info!("copied ssh authorized keys from the system"),
        Err(e) => warn!("copying ssh authorized keys failed, continuing: {e}"),
    }
    Ok(())
}

/// Bring up the host network with the system's configuration.
pub(crate) fn setup_network(ctx: &mut StageContext<'_>) -> Result<(), MigrationError> {
    let network_error = |e: &dyn std::fmt::Display| MigrationError::HostNetwork(e.to_string());

    let config_paths = ctx.config.network.config_paths.clone();
    for path in &config_paths {
        if ctx.layout.target_path(path).is_dir() {
            if bind_from_system(ctx, path).map_err(|e| network_error(&e))? {
                info!("bound {path} from the system");
            }
        } else if copy_from_system(ctx, path).map_err(|e| network_error(&e))? > 0 {
            info!("copied {path} from the system");
        }
    }

    if copy_from_system(ctx, RESOLV_CONF).map_err(|e| network_error(&e))? > 0 {
        info!("copied {RESOLV_CONF} from the system");
    }

    run_configured(ctx, "reload command", &ctx.config.network.reload_command)
        .map_err(|e| network_error(&e))
}

/// Host paths matching `pattern` inside the system, paired with their
/// destination on the host.
fn preserved_files(
    ctx: &StageContext<'_>,
    pattern: &str,
) -> Result<Vec<(PathBuf, PathBuf)>, MigrationError> {
    let system_root = ctx.layout.system_root();
    let full = format!(
        "{}{pattern}",
        Pattern::escape(&system_root.to_string_lossy())
    );
    let paths = glob::glob(&full)
        .map_err(|e| MigrationError::PostMount(format!("invalid pattern '{pattern}': {e}")))?;

    let mut files = Vec::new();
    for entry in paths {
        let source = entry.map_err(|e| MigrationError::PostMount(e.to_string()))?;
        match std::fs::symlink_metadata(&source) {
            Ok(meta) if !meta.is_dir() => {}
            _ => continue,
        }
        let Ok(relative) = source.strip_prefix(&system_root) else {
            continue;
        };
        let dest = ctx.layout.host_path(Path::new("/").join(relative));
        files.push((source, dest));
    }
    Ok(files)
}

fn preserve(ctx: &StageContext<'_>, patterns: &[String]) -> Result<usize, MigrationError> {
    let system_root = ctx.layout.system_root();
    let mut copied = 0;
    for pattern in patterns {
        for (source, dest) in preserved_files(ctx, pattern)? {
            copy_path(&system_root, &source, &dest).map_err(|e| {
                MigrationError::PostMount(format!("preserving {}: {e}", source.display()))
            })?;
            debug!("preserved {}", dest.display());
            copied += 1;
        }
    }
    Ok(copied)
}

/// Carry rule and static files the live host should keep from the system.
pub(crate) fn post_mount(ctx: &mut StageContext<'_>) -> Result<(), MigrationError> {
    let rules = preserve(ctx, ctx.config.get_preserve_rules())?;
    let statics = preserve(ctx, ctx.config.get_preserve_static())?;
    info!("preserved {rules} rule file(s) and {statics} static file(s)");

    if rules > 0 {
        for command in [
            argv(&["udevadm", "control", "--reload"]),
            argv(&["udevadm", "trigger", "--action=add"]),
        ] {
            run_configured(ctx, "udev reload", &command)
                .map_err(|e| MigrationError::PostMount(e.to_string()))?;
        }
    }
    Ok(())
}
