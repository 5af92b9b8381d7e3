use crate::pipeline::StageContext;
use crate::MigrationError;
use distmig_runtime::argv;
use tracing::{info, warn};

const KERNEL: &str = "/boot/vmlinuz";
const INITRD: &str = "/boot/initrd";

/// Regenerate the bootloader configuration from inside the migrated system.
pub(crate) fn update_bootloader(ctx: &mut StageContext<'_>) -> Result<(), MigrationError> {
    let mut command = argv(&["chroot"]);
    command.push(ctx.layout.system_root().to_string_lossy().into_owned());
    command.extend(ctx.config.bootloader.command.iter().cloned());

    ctx.runner
        .run(&command, None, true)
        .map_err(|e| MigrationError::Bootloader(e.to_string()))?;
    info!("bootloader configuration updated");
    Ok(())
}

/// Stage the migrated kernel for `kexec`, reusing the running kernel's command line.
pub(crate) fn load_kernel(ctx: &mut StageContext<'_>) -> Result<(), MigrationError> {
    if !ctx.config.is_soft_reboot_requested() {
        ctx.skip("soft reboot not requested");
        return Ok(());
    }

    let kernel = ctx.layout.target_path(KERNEL);
    let initrd = ctx.layout.target_path(INITRD);
    for image in [&kernel, &initrd] {
        if !image.exists() {
            return Err(MigrationError::KernelLoad(format!(
                "{} not found",
                image.display()
            )));
        }
    }

    let cmdline_path = ctx.layout.kernel_cmdline();
    let cmdline = std::fs::read_to_string(&cmdline_path).map_err(|e| {
        MigrationError::KernelLoad(format!("reading {}: {e}", cmdline_path.display()))
    })?;

    let mut command = argv(&["kexec", "--load"]);
    command.push(kernel.to_string_lossy().into_owned());
    command.push("--initrd".to_owned());
    command.push(initrd.to_string_lossy().into_owned());
    command.push("--kexec-file-syscall".to_owned());
    command.push("--command-line".to_owned());
    command.push(cmdline.trim().to_owned());

    ctx.runner
        .run(&command, None, true)
        .map_err(|e| MigrationError::KernelLoad(e.to_string()))?;
    info!("loaded {}", kernel.display());
    Ok(())
}

/// Restart into the migrated system, unless debugging asks to stay.
pub(crate) fn reboot(ctx: &mut StageContext<'_>) -> Result<(), MigrationError> {
    if ctx.config.is_debug_requested() {
        ctx.skip("debug requested, leaving the host running for inspection");
        return Ok(());
    }

    let reboot = argv(&["systemctl", "reboot"]);
    if ctx.config.is_soft_reboot_requested() {
        match ctx.runner.run(&argv(&["systemctl", "kexec"]), None, true) {
            Ok(_) => {
                info!("soft reboot started");
                return Ok(());
            }
            Err(e) => warn!("soft reboot failed, falling back to hard reboot: {e}"),
        }
    }

    ctx.runner
        .run(&reboot, None, true)
        .map_err(|e| MigrationError::Reboot(e.to_string()))?;
    info!("reboot started");
    Ok(())
}
