//! Subprocess execution behind the [`CommandRunner`] seam.
//!
//! Every external tool (git, the grabber, the container orchestrator) is run
//! through a runner so pipeline stages can be exercised with scripted
//! responses instead of real processes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::debug;

use epgsync_shared::{EpgSyncError, Result};

/// How a subprocess' standard streams are wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioMode {
    /// Capture stdout/stderr for inspection.
    #[default]
    Capture,
    /// Attach to the parent's terminal (foreground tools).
    Inherit,
}

/// A fully described subprocess invocation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    pub stdio: StdioMode,
}

// Env values can hold credentials; only their names are printed.
impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_names: Vec<&str> = self.envs.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("envs", &env_names)
            .field("stdio", &self.stdio)
            .finish()
    }
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn inherit_stdio(mut self) -> Self {
        self.stdio = StdioMode::Inherit;
        self
    }

    /// Program and arguments joined for log lines and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Prefers stderr, falls back to stdout if stderr is empty.
    pub fn error_text(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }

    /// Human-readable failure description for a non-zero exit.
    pub fn failure_message(&self, spec: &CommandSpec) -> String {
        let status = match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        let detail = self.error_text();
        if detail.is_empty() {
            format!("`{}` failed with {status}", spec.display())
        } else {
            format!("`{}` failed with {status}: {detail}", spec.display())
        }
    }
}

/// Executes subprocesses. Implemented by [`SystemRunner`] for real runs.
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion. Spawn failures are errors; a non-zero exit
    /// is reported through [`CommandOutput::code`].
    fn run(&self, spec: &CommandSpec) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Runs commands as real child processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), cwd = ?spec.cwd, "running command");

        let mut command = tokio::process::Command::new(&spec.program);
        command.args(&spec.args).kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        let spawn_error = |e: std::io::Error| EpgSyncError::Command {
            program: spec.program.clone(),
            message: e.to_string(),
        };

        match spec.stdio {
            StdioMode::Capture => {
                let output = command
                    .stdin(Stdio::null())
                    .output()
                    .await
                    .map_err(spawn_error)?;
                Ok(CommandOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            StdioMode::Inherit => {
                let status = command
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .status()
                    .await
                    .map_err(spawn_error)?;
                Ok(CommandOutput {
                    code: status.code(),
                    ..CommandOutput::default()
                })
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("git").args(["push", "origin", "main"]);
        assert_eq!(spec.display(), "git push origin main");
    }

    #[test]
    fn debug_hides_env_values() {
        let spec = CommandSpec::new("git").env("EPGSYNC_GIT_PASSWORD", "hunter2");
        let shown = format!("{spec:?}");
        assert!(shown.contains("EPGSYNC_GIT_PASSWORD"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn error_text_prefers_stderr() {
        let output = CommandOutput {
            code: Some(1),
            stdout: "stdout content".into(),
            stderr: "stderr content\n".into(),
        };
        assert_eq!(output.error_text(), "stderr content");

        let output = CommandOutput {
            code: Some(1),
            stdout: "stdout content".into(),
            stderr: "  ".into(),
        };
        assert_eq!(output.error_text(), "stdout content");
    }

    #[test]
    fn failure_message_names_command_and_status() {
        let spec = CommandSpec::new("npm").args(["run", "grab"]);
        let output = CommandOutput {
            code: Some(2),
            stdout: String::new(),
            stderr: "boom".into(),
        };
        assert_eq!(
            output.failure_message(&spec),
            "`npm run grab` failed with exit status 2: boom"
        );
    }

    #[tokio::test]
    async fn system_runner_captures_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let output = SystemRunner.run(&spec).await.expect("spawn sh");
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn system_runner_reports_missing_program() {
        let spec = CommandSpec::new("epgsync-definitely-not-a-program");
        let err = SystemRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, EpgSyncError::Command { .. }));
    }

    #[tokio::test]
    async fn system_runner_passes_env_and_cwd() {
        let dir = std::env::temp_dir();
        let spec = CommandSpec::new("sh")
            .args(["-c", "printf '%s' \"$EPGSYNC_TEST_VALUE\"; pwd"])
            .env("EPGSYNC_TEST_VALUE", "42")
            .current_dir(&dir);
        let output = SystemRunner.run(&spec).await.expect("spawn sh");
        assert!(output.success());
        assert!(output.stdout.starts_with("42"));
    }
}
