pub mod completions;
pub mod man_pages;
pub mod show_table;
pub mod stage;
pub mod stages;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_MOUNT_ERROR: u8 = 3;

const SKIP_ROOT_CHECK: &str = "DISTMIG_SKIP_ROOT_CHECK";

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Stages mount filesystems and rewrite system files; refuse to run them
/// unprivileged.
pub fn require_root() -> Result<(), String> {
    if std::env::var(SKIP_ROOT_CHECK).as_deref() == Ok("1") {
        return Ok(());
    }
    // SAFETY: geteuid has no preconditions and cannot fail.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        Ok(())
    } else {
        Err(format!(
            "migration stages must run as root (set {SKIP_ROOT_CHECK}=1 to override)"
        ))
    }
}
