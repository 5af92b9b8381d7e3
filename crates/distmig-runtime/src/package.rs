use crate::command::{CommandExecutor, CommandOutput};
use crate::RuntimeError;
use std::sync::Arc;
use tracing::info;

/// The distribution package manager.
///
/// Runs never raise on a non-zero exit: the package manager's return codes
/// carry meaning the caller interprets.
pub trait PackageManager: Send + Sync {
    fn run(&self, args: &[String]) -> Result<CommandOutput, RuntimeError>;
}

/// Invokes a package manager program through a [`CommandExecutor`].
pub struct CommandPackageManager {
    program: String,
    runner: Arc<dyn CommandExecutor>,
}

impl CommandPackageManager {
    pub fn new(program: impl Into<String>, runner: Arc<dyn CommandExecutor>) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }
}

impl PackageManager for CommandPackageManager {
    fn run(&self, args: &[String]) -> Result<CommandOutput, RuntimeError> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.program.clone());
        argv.extend_from_slice(args);
        let out = self.runner.run(&argv, None, false)?;
        info!("{} finished with {}", self.program, out.returncode);
        Ok(out)
    }
}
