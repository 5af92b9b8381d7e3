use crate::RuntimeError;
use serde::Serialize;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn, Span};

const NO_STDOUT: &str = "(no output on stdout)";
const NO_STDERR: &str = "(no output on stderr)";

/// Captured result of one external program run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub output: String,
    pub error: String,
    pub returncode: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// Runs external programs on behalf of pipeline stages.
pub trait CommandExecutor: Send + Sync {
    /// Run `argv`. With `env`, the child sees exactly that environment and
    /// `argv[0]` is looked up in its `PATH`.
    ///
    /// A non-zero exit is an error only when `raise_on_error` is set;
    /// otherwise the output is returned and the caller decides.
    fn run(
        &self,
        argv: &[String],
        env: Option<&HashMap<String, String>>,
        raise_on_error: bool,
    ) -> Result<CommandOutput, RuntimeError>;
}

/// Owned argument vector from string slices.
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_owned()).collect()
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Locate `program`: the given `PATH` (or the process `PATH`) first, then
/// `extra` directories. Names containing `/` are checked as-is.
pub fn which(program: &str, path_var: Option<&str>, extra: &[PathBuf]) -> Option<PathBuf> {
    if program.contains('/') {
        let candidate = PathBuf::from(program);
        return is_executable(&candidate).then_some(candidate);
    }

    let process_path = std::env::var("PATH").unwrap_or_default();
    let search = path_var.unwrap_or(&process_path);
    search
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .chain(extra.iter().cloned())
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

/// Turn a finished run into the caller-facing result, logging failures.
pub(crate) fn check_output(
    command_line: &str,
    output: CommandOutput,
    raise_on_error: bool,
) -> Result<CommandOutput, RuntimeError> {
    if output.success() {
        return Ok(output);
    }

    let stdout = if output.output.trim().is_empty() {
        NO_STDOUT.to_owned()
    } else {
        output.output.clone()
    };
    let stderr = if output.error.trim().is_empty() {
        NO_STDERR.to_owned()
    } else {
        output.error.clone()
    };
    warn!(
        "EXEC failed: [{command_line}] exited with {}\nstdout: {stdout}\nstderr: {stderr}",
        output.returncode
    );

    if raise_on_error {
        Err(RuntimeError::CommandFailed {
            command: command_line.to_owned(),
            code: output.returncode,
            stdout,
            stderr,
        })
    } else {
        Ok(output)
    }
}

/// Executes programs with `std::process::Command`, blocking until they exit.
pub struct SystemCommandRunner {
    search_paths: Vec<PathBuf>,
    span: Span,
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self {
            search_paths: vec![PathBuf::from("/usr/sbin"), PathBuf::from("/sbin")],
            span: Span::current(),
        }
    }

    /// Attribute every log line of this runner to `span`.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

impl CommandExecutor for SystemCommandRunner {
    fn run(
        &self,
        argv: &[String],
        env: Option<&HashMap<String, String>>,
        raise_on_error: bool,
    ) -> Result<CommandOutput, RuntimeError> {
        let _enter = self.span.enter();
        let (program, args) = argv.split_first().ok_or(RuntimeError::EmptyCommand)?;
        let command_line = argv.join(" ");

        let path_var = env.and_then(|e| e.get("PATH")).map(String::as_str);
        let Some(resolved) = which(program, path_var, &self.search_paths) else {
            warn!("EXEC: command not found: {program}");
            return Err(RuntimeError::CommandNotFound(program.clone()));
        };

        debug!("EXEC: [{command_line}]");
        let mut cmd = Command::new(&resolved);
        cmd.args(args);
        if let Some(env) = env {
            cmd.env_clear().envs(env);
        }

        let out = cmd.output().map_err(|source| {
            warn!("EXEC: failed to start [{command_line}]: {source}");
            RuntimeError::Spawn {
                command: command_line.clone(),
                source,
            }
        })?;

        let output = CommandOutput {
            output: String::from_utf8_lossy(&out.stdout).into_owned(),
            error: String::from_utf8_lossy(&out.stderr).into_owned(),
            returncode: out.status.code().unwrap_or(-1),
        };
        check_output(&command_line, output, raise_on_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sh(script: &str) -> Vec<String> {
        argv(&["sh", "-c", script])
    }

    #[test]
    fn run_captures_stdout_and_code() {
        let runner = SystemCommandRunner::new();
        let out = runner.run(&sh("echo hello"), None, true).unwrap();
        assert_eq!(out.output.trim(), "hello");
        assert_eq!(out.returncode, 0);
    }

    #[test]
    fn nonzero_exit_raises_with_placeholder_streams() {
        let runner = SystemCommandRunner::new();
        let err = runner.run(&sh("exit 3"), None, true).unwrap_err();
        match err {
            RuntimeError::CommandFailed {
                code,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(code, 3);
                assert_eq!(stdout, NO_STDOUT);
                assert_eq!(stderr, NO_STDERR);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn nonzero_exit_without_raise_returns_real_streams() {
        let runner = SystemCommandRunner::new();
        let out = runner
            .run(&sh("echo oops >&2; exit 4"), None, false)
            .unwrap();
        assert_eq!(out.returncode, 4);
        assert_eq!(out.output, "");
        assert_eq!(out.error.trim(), "oops");
    }

    #[test]
    fn missing_program_is_command_not_found() {
        let runner = SystemCommandRunner::new();
        let err = runner
            .run(&argv(&["distmig-no-such-program"]), None, true)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CommandNotFound(p) if p == "distmig-no-such-program"));
    }

    #[test]
    fn empty_argv_is_rejected() {
        let runner = SystemCommandRunner::new();
        assert!(matches!(
            runner.run(&[], None, true),
            Err(RuntimeError::EmptyCommand)
        ));
    }

    #[test]
    fn supplied_environment_path_is_searched() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("distmig-fake-tool");
        fs::write(&tool, "#!/bin/sh\necho \"fake $GREETING\"\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let mut env = HashMap::new();
        env.insert(
            "PATH".to_owned(),
            format!("{}:/usr/bin:/bin", dir.path().display()),
        );
        env.insert("GREETING".to_owned(), "hi".to_owned());

        let runner = SystemCommandRunner::new();
        let out = runner
            .run(&argv(&["distmig-fake-tool"]), Some(&env), true)
            .unwrap();
        assert_eq!(out.output.trim(), "fake hi");
    }

    #[test]
    fn which_skips_non_executable_files() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("tool");
        fs::write(&plain, "").unwrap();
        fs::set_permissions(&plain, fs::Permissions::from_mode(0o644)).unwrap();
        let path_var = dir.path().display().to_string();
        assert!(which("tool", Some(path_var.as_str()), &[]).is_none());

        fs::set_permissions(&plain, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(which("tool", Some(path_var.as_str()), &[]), Some(plain));
    }

    #[test]
    fn which_falls_back_to_extra_paths() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("sbin-tool");
        fs::write(&tool, "").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(
            which("sbin-tool", Some(""), &[dir.path().to_path_buf()]),
            Some(tool)
        );
    }
}
