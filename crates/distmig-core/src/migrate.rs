use crate::pipeline::StageContext;
use crate::MigrationError;
use distmig_runtime::argv;
use distmig_schema::MigrationTarget;
use tracing::{info, warn};

const BASE_PRODUCT: &str = "/etc/products.d/baseproduct";

/// Non-zero package manager exits that still mean the migration went through.
fn informational_exit(code: i32) -> Option<&'static str> {
    match code {
        100 => Some("updates are needed"),
        101 => Some("security updates are needed"),
        102 => Some("reboot required"),
        103 => Some("package manager restart required"),
        104 => Some("a requested capability was not found"),
        105 => Some("interrupted by signal after committing"),
        106 => Some("some repositories were skipped"),
        107 => Some("some package scripts failed"),
        _ => None,
    }
}

fn migration_args(ctx: &StageContext<'_>, target: &MigrationTarget) -> Vec<String> {
    let mut args = argv(&["--non-interactive", "--gpg-auto-import-keys", "--root"]);
    args.push(ctx.layout.system_root().to_string_lossy().into_owned());
    args.extend(argv(&[
        "migration",
        "--non-interactive",
        "--gpg-auto-import-keys",
        "--no-selfupdate",
        "--auto-agree-with-licenses",
        "--allow-vendor-change",
        "--strict-errors-dist-migration",
        "--replacefiles",
        "--product",
    ]));
    args.push(target.to_string());
    if ctx.config.is_verbose_migration_requested() {
        args.push("--verbose".to_owned());
    }
    args.extend(ctx.config.package_manager.extra_args.iter().cloned());
    args
}

/// Run the package manager migration of the mounted system to the target product.
pub(crate) fn migrate(ctx: &mut StageContext<'_>) -> Result<(), MigrationError> {
    let base_product = ctx.layout.target_path(BASE_PRODUCT);
    if !base_product.exists() {
        return Err(MigrationError::ProductNotFound(
            base_product.display().to_string(),
        ));
    }

    let target = MigrationTarget::detect(&ctx.config, &ctx.layout.migration_image_dir())
        .map_err(|e| MigrationError::ProductSetup(e.to_string()))?;
    info!("migrating to {target}");

    let out = ctx
        .package_manager
        .run(&migration_args(ctx, &target))
        .map_err(|e| MigrationError::PackageManagerMigration(e.to_string()))?;

    match out.returncode {
        0 => {
            info!("migration to {target} succeeded");
            Ok(())
        }
        code => match informational_exit(code) {
            Some(meaning) => {
                warn!("migration finished with {code}: {meaning}");
                Ok(())
            }
            None => Err(MigrationError::PackageManagerMigration(format!(
                "exited with {code}: {}",
                out.error.trim()
            ))),
        },
    }
}
