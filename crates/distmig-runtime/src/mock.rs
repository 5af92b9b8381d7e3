use crate::command::{check_output, CommandExecutor, CommandOutput};
use crate::mount::MountBackend;
use crate::probe::DeviceProbe;
use crate::RuntimeError;
use distmig_store::MountRecord;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

fn poisoned<T>(e: &std::sync::PoisonError<T>) -> RuntimeError {
    RuntimeError::Internal(format!("mutex poisoned: {e}"))
}

#[derive(Debug, Clone)]
enum Reply {
    Exit(i32),
    Stdout(String),
    Missing,
}

/// Records every command line and answers from canned replies.
///
/// Replies are keyed by a leading token sequence: `"systemctl kexec"` matches
/// `systemctl kexec` but not `systemctl reboot`, while `"mount"` matches every
/// mount invocation. The most recently registered matching key wins.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct MockCommandRunner {
    replies: Vec<(Vec<String>, Reply)>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_exit_code(mut self, command: &str, code: i32) -> Self {
        self.replies.push((tokens(command), Reply::Exit(code)));
        self
    }

    #[must_use]
    pub fn with_output(mut self, command: &str, stdout: &str) -> Self {
        self.replies
            .push((tokens(command), Reply::Stdout(stdout.to_owned())));
        self
    }

    /// Pretend `command` cannot be located.
    #[must_use]
    pub fn with_missing(mut self, command: &str) -> Self {
        self.replies.push((tokens(command), Reply::Missing));
        self
    }

    /// Every command line run so far, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Command lines whose first token is `program`.
    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.first().is_some_and(|p| p == program))
            .collect()
    }

    fn reply_for(&self, argv: &[String]) -> Option<&Reply> {
        self.replies
            .iter()
            .rev()
            .find(|(key, _)| argv.starts_with(key))
            .map(|(_, reply)| reply)
    }
}

fn tokens(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_owned).collect()
}

impl CommandExecutor for MockCommandRunner {
    fn run(
        &self,
        argv: &[String],
        _env: Option<&HashMap<String, String>>,
        raise_on_error: bool,
    ) -> Result<CommandOutput, RuntimeError> {
        let program = argv.first().ok_or(RuntimeError::EmptyCommand)?;
        let reply = self.reply_for(argv).cloned();
        if matches!(reply, Some(Reply::Missing)) {
            return Err(RuntimeError::CommandNotFound(program.clone()));
        }

        self.calls
            .lock()
            .map_err(|e| poisoned(&e))?
            .push(argv.to_vec());

        let output = match reply {
            Some(Reply::Exit(code)) => CommandOutput {
                returncode: code,
                ..CommandOutput::default()
            },
            Some(Reply::Stdout(stdout)) => CommandOutput {
                output: stdout,
                ..CommandOutput::default()
            },
            Some(Reply::Missing) | None => CommandOutput::default(),
        };
        check_output(&argv.join(" "), output, raise_on_error)
    }
}

/// One observed [`MountBackend`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount {
        device: PathBuf,
        target: PathBuf,
        fstype: String,
        options: String,
    },
    Unmount {
        target: PathBuf,
        lazy: bool,
    },
}

#[derive(Default)]
struct MockMountState {
    calls: Vec<MountCall>,
    mounted: Vec<PathBuf>,
}

/// In-memory mount backend.
///
/// Tracks the mount stack, can be told to fail at specific targets, and can
/// materialize files when a given device is mounted so that callers probing
/// for content (an `etc/fstab`, a kernel image) find it on disk.
#[derive(Default)]
pub struct MockMountBackend {
    state: Mutex<MockMountState>,
    fail_mount: HashSet<PathBuf>,
    fail_unmount: HashSet<PathBuf>,
    device_files: HashMap<PathBuf, Vec<(PathBuf, String)>>,
}

impl MockMountBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing_mount_at(mut self, target: impl Into<PathBuf>) -> Self {
        self.fail_mount.insert(target.into());
        self
    }

    #[must_use]
    pub fn failing_unmount_at(mut self, target: impl Into<PathBuf>) -> Self {
        self.fail_unmount.insert(target.into());
        self
    }

    /// Start with `target` already mounted.
    #[must_use]
    pub fn with_mounted(mut self, target: impl Into<PathBuf>) -> Self {
        if let Ok(state) = self.state.get_mut() {
            state.mounted.push(target.into());
        }
        self
    }

    /// Write `content` to `relative` below the target whenever `device` is mounted.
    #[must_use]
    pub fn with_device_file(
        mut self,
        device: impl Into<PathBuf>,
        relative: impl Into<PathBuf>,
        content: &str,
    ) -> Self {
        self.device_files
            .entry(device.into())
            .or_default()
            .push((relative.into(), content.to_owned()));
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockMountState>, RuntimeError> {
        self.state.lock().map_err(|e| poisoned(&e))
    }

    pub fn calls(&self) -> Vec<MountCall> {
        self.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn mount_targets(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MountCall::Mount { target, .. } => Some(target),
                MountCall::Unmount { .. } => None,
            })
            .collect()
    }

    pub fn unmount_targets(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MountCall::Unmount { target, .. } => Some(target),
                MountCall::Mount { .. } => None,
            })
            .collect()
    }

    /// Current mount stack, bottom first.
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.lock().map(|s| s.mounted.clone()).unwrap_or_default()
    }
}

impl MountBackend for MockMountBackend {
    fn mount(&self, record: &MountRecord, target: &Path) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.calls.push(MountCall::Mount {
            device: record.device().to_path_buf(),
            target: target.to_path_buf(),
            fstype: record.filesystem_type().to_owned(),
            options: record.options().to_owned(),
        });
        if self.fail_mount.contains(target) {
            return Err(RuntimeError::MountFailed {
                mountpoint: target.to_path_buf(),
                reason: "mock mount failure".to_owned(),
            });
        }
        state.mounted.push(target.to_path_buf());

        for (relative, content) in self.device_files.get(record.device()).into_iter().flatten() {
            let path = target.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, content)?;
        }
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path, lazy: bool) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.calls.push(MountCall::Unmount {
            target: mountpoint.to_path_buf(),
            lazy,
        });
        if self.fail_unmount.contains(mountpoint) {
            return Err(RuntimeError::MountFailed {
                mountpoint: mountpoint.to_path_buf(),
                reason: "target is busy".to_owned(),
            });
        }
        let Some(pos) = state.mounted.iter().rposition(|m| m == mountpoint) else {
            return Err(RuntimeError::MountFailed {
                mountpoint: mountpoint.to_path_buf(),
                reason: "not mounted".to_owned(),
            });
        };
        state.mounted.remove(pos);
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> Result<bool, RuntimeError> {
        Ok(self.lock()?.mounted.iter().any(|m| m == path))
    }
}

/// Probe returning a fixed candidate list.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe(pub Vec<PathBuf>);

impl DeviceProbe for StaticProbe {
    fn candidates(&self) -> Result<Vec<PathBuf>, RuntimeError> {
        Ok(self.0.clone())
    }
}
