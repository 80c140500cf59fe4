//! Privileged local command execution
//!
//! Commands are built as explicit argument vectors and executed directly,
//! never through a shell, so route strings taken from the remote host cannot
//! inject anything.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use ap_core::{CommandKind, LocalError, RunJournal};

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCommand {
    program: String,
    args: Vec<String>,
}

impl LocalCommand {
    /// Start building a command for `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Shorthand for `ip <args...>`
    pub fn ip<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("ip").args(args)
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for LocalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs local commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` and return its stdout lines
    ///
    /// A non-zero exit fails with [`LocalError::CommandFailed`] unless
    /// `tolerate_failure` is set, in which case it is logged and the (possibly
    /// empty) output is returned. Only successful commands are journaled.
    async fn run(&self, command: &LocalCommand, tolerate_failure: bool)
        -> Result<Vec<String>, LocalError>;
}

/// [`CommandRunner`] backed by real processes
pub struct ProcessRunner {
    journal: RunJournal,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    /// Create a runner that journals into `journal`
    pub fn new(journal: RunJournal) -> Self {
        Self {
            journal,
            timeout: None,
        }
    }

    /// Kill and fail commands that run longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        command: &LocalCommand,
        tolerate_failure: bool,
    ) -> Result<Vec<String>, LocalError> {
        let line = command.to_string();
        tracing::debug!("Running local command {}", line);

        let child = Command::new(command.program())
            .args(command.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child)
                .await
                .map_err(|_| LocalError::Timeout {
                    command: line.clone(),
                    seconds: limit.as_secs(),
                })?,
            None => child.await,
        }
        .map_err(|e| LocalError::Spawn {
            command: line.clone(),
            reason: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let lines = stdout.lines().map(str::to_string).collect();

        if !output.status.success() {
            if tolerate_failure {
                tracing::warn!("Ignoring failure of {}: {}", line, stderr);
                return Ok(lines);
            }
            tracing::error!("Error happened in command {}: {}", line, stderr);
            return Err(LocalError::CommandFailed {
                command: line,
                status: output.status.to_string(),
                stderr,
            });
        }

        self.journal.record(CommandKind::Local, line.as_str());
        tracing::debug!("{}:\n{}\nErr:\n{}", line, stdout, stderr);
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_joins_argv() {
        let cmd = LocalCommand::ip(["route", "add", "10.0.0.0/24", "dev", "ligolo1"]);
        assert_eq!(cmd.to_string(), "ip route add 10.0.0.0/24 dev ligolo1");
        assert_eq!(cmd.arguments().len(), 5);
    }

    #[tokio::test]
    async fn test_success_is_journaled() {
        let journal = RunJournal::new();
        let runner = ProcessRunner::new(journal.clone());
        let lines = runner
            .run(&LocalCommand::new("echo").args(["hello", "world"]), false)
            .await
            .unwrap();
        assert_eq!(lines, vec!["hello world"]);
        assert_eq!(journal.commands(CommandKind::Local), vec!["echo hello world"]);
    }

    #[tokio::test]
    async fn test_failure_raises_and_is_not_journaled() {
        let journal = RunJournal::new();
        let runner = ProcessRunner::new(journal.clone());
        let cmd = LocalCommand::new("sh").args(["-c", "echo boom >&2; exit 3"]);

        let err = runner.run(&cmd, false).await.unwrap_err();
        assert!(matches!(err, LocalError::CommandFailed { .. }));
        assert_eq!(err.stderr(), Some("boom"));
        assert!(journal.commands(CommandKind::Local).is_empty());
    }

    #[tokio::test]
    async fn test_tolerated_failure_returns_ok() {
        let journal = RunJournal::new();
        let runner = ProcessRunner::new(journal.clone());
        let cmd = LocalCommand::new("sh").args(["-c", "exit 1"]);

        assert!(runner.run(&cmd, true).await.unwrap().is_empty());
        assert!(journal.commands(CommandKind::Local).is_empty());
    }

    #[tokio::test]
    async fn test_arguments_are_not_shell_expanded() {
        let runner = ProcessRunner::new(RunJournal::new());
        let lines = runner
            .run(&LocalCommand::new("echo").arg("$(id -u); ls"), false)
            .await
            .unwrap();
        assert_eq!(lines, vec!["$(id -u); ls"]);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = ProcessRunner::new(RunJournal::new());
        let err = runner
            .run(&LocalCommand::new("/nonexistent/autopivot-test-binary"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, LocalError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner = ProcessRunner::new(RunJournal::new()).with_timeout(Duration::from_millis(100));
        let err = runner
            .run(&LocalCommand::new("sleep").arg("5"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LocalError::Timeout { .. }));
    }
}
