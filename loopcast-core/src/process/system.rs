use std::fs::{self, OpenOptions};
use std::io;
use std::process::{ExitStatus, Output, Stdio};

use tokio::process::{Child, Command};

use super::{ChildProcess, CommandExecutor, CommandSpec, ProcessLauncher};

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        command.stdin(Stdio::null()).output().await
    }
}

/// Spawns real processes with stdout/stderr appended to the command's log file.
#[derive(Debug, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &CommandSpec) -> io::Result<Box<dyn ChildProcess>> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match &spec.log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let log = OpenOptions::new().create(true).append(true).open(path)?;
                let stderr = log.try_clone()?;
                command.stdout(Stdio::from(log)).stderr(Stdio::from(stderr));
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        let child = command.spawn()?;
        Ok(Box::new(SystemChild { child }))
    }
}

struct SystemChild {
    child: Child,
}

#[async_trait::async_trait]
impl ChildProcess for SystemChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::process::{run_bounded, ProcessError, ProcessHandle, StopOutcome};

    #[tokio::test]
    async fn run_bounded_times_out_slow_commands() {
        let mut command = Command::new("sleep");
        command.arg("5");
        let err = run_bounded(&SystemCommandExecutor, &mut command, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut(_)));
    }

    #[tokio::test]
    async fn sleeping_process_stops_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("sleeper", "sleep")
            .args(["30"])
            .log_to(dir.path().join("logs/sleeper.log"));
        let mut handle = ProcessHandle::start(&SystemLauncher, &spec).unwrap();
        assert!(handle.is_alive());
        let outcome = handle.stop(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, StopOutcome::Terminated(_)));
        assert!(!handle.is_alive());
        assert!(dir.path().join("logs/sleeper.log").exists());
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let spec = CommandSpec::new("ghost", "/nonexistent/loopcast-tool");
        let err = ProcessHandle::start(&SystemLauncher, &spec).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
