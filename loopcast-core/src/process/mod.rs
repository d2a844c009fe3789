pub mod handle;
pub mod system;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Output};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

pub use handle::{ProcessHandle, ProcessState, StopOutcome};
pub use system::{SystemCommandExecutor, SystemLauncher};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {label} ({program}): {source}")]
    Spawn {
        label: String,
        program: PathBuf,
        source: io::Error,
    },
    #[error("io error on {label}: {source}")]
    Io { label: String, source: io::Error },
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

/// Runs a command to completion and returns its captured output.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> io::Result<Output>;
}

/// Runs `command` through `executor`, giving up after `limit`.
///
/// The child is killed when the deadline drops the pending future.
pub async fn run_bounded(
    executor: &dyn CommandExecutor,
    command: &mut Command,
    limit: Duration,
) -> Result<Output, ProcessError> {
    command.kill_on_drop(true);
    let label = command.as_std().get_program().to_string_lossy().to_string();
    match timeout(limit, executor.run(command)).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(ProcessError::Io { label, source }),
        Err(_) => Err(ProcessError::TimedOut(limit)),
    }
}

/// Renders a command line for logs and error messages.
pub fn describe(command: &Command) -> String {
    let std = command.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().to_string()];
    parts.extend(std.get_args().map(|arg| arg.to_string_lossy().to_string()));
    parts.join(" ")
}

/// A long-running process recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log_path: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            log_path: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A spawned process that keeps running until told otherwise.
#[async_trait::async_trait]
pub trait ChildProcess: Send {
    fn pid(&self) -> Option<u32>;
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;
    /// Requests a graceful shutdown (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;
    fn kill(&mut self) -> io::Result<()>;
    async fn wait(&mut self) -> io::Result<ExitStatus>;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &CommandSpec) -> io::Result<Box<dyn ChildProcess>>;
}
