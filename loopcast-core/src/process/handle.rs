use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{ChildProcess, CommandSpec, ProcessError, ProcessLauncher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited before the stop request.
    AlreadyExited(Option<ExitStatus>),
    /// The process honoured the terminate request within the grace period.
    Terminated(ExitStatus),
    /// The grace period elapsed and the process was killed.
    Killed(ExitStatus),
}

/// One supervised external process.
pub struct ProcessHandle {
    label: String,
    child: Box<dyn ChildProcess>,
    state: ProcessState,
    started_at: DateTime<Utc>,
    exit: Option<ExitStatus>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.label)
            .field("pid", &self.child.pid())
            .field("state", &self.state)
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl ProcessHandle {
    pub fn start(launcher: &dyn ProcessLauncher, spec: &CommandSpec) -> Result<Self, ProcessError> {
        let child = launcher
            .launch(spec)
            .map_err(|source| ProcessError::Spawn {
                label: spec.label.clone(),
                program: spec.program.clone(),
                source,
            })?;
        let mut handle = Self {
            label: spec.label.clone(),
            child,
            state: ProcessState::Starting,
            started_at: Utc::now(),
            exit: None,
        };
        handle.is_alive();
        debug!(label = %handle.label, pid = ?handle.pid(), state = ?handle.state, "process launched");
        Ok(handle)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.pid()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Polls the child without blocking; a reaped child moves to `Dead`.
    pub fn is_alive(&mut self) -> bool {
        if self.state == ProcessState::Dead {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => {
                if self.state == ProcessState::Starting {
                    self.state = ProcessState::Running;
                }
                true
            }
            Ok(Some(status)) => {
                self.mark_dead(Some(status));
                false
            }
            Err(error) => {
                warn!(label = %self.label, %error, "failed to poll process, killing it");
                if let Err(error) = self.child.kill() {
                    debug!(label = %self.label, %error, "kill after poll failure failed");
                }
                self.mark_dead(None);
                false
            }
        }
    }

    /// Terminates the process, escalating to kill once `grace` elapses.
    pub async fn stop(&mut self, grace: Duration) -> Result<StopOutcome, ProcessError> {
        if !self.is_alive() {
            return Ok(StopOutcome::AlreadyExited(self.exit));
        }
        self.state = ProcessState::Stopping;
        if let Err(error) = self.child.terminate() {
            debug!(label = %self.label, %error, "terminate request failed");
        }
        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.mark_dead(Some(status));
                Ok(StopOutcome::Terminated(status))
            }
            Ok(Err(source)) => {
                let _ = self.child.kill();
                self.mark_dead(None);
                Err(self.io_error(source))
            }
            Err(_) => {
                warn!(
                    label = %self.label,
                    grace_ms = grace.as_millis() as u64,
                    "process ignored terminate, killing"
                );
                self.child.kill().map_err(|source| self.io_error(source))?;
                let status = self
                    .child
                    .wait()
                    .await
                    .map_err(|source| self.io_error(source))?;
                self.mark_dead(Some(status));
                Ok(StopOutcome::Killed(status))
            }
        }
    }

    fn mark_dead(&mut self, status: Option<ExitStatus>) {
        self.state = ProcessState::Dead;
        if status.is_some() {
            self.exit = status;
        }
    }

    fn io_error(&self, source: std::io::Error) -> ProcessError {
        ProcessError::Io {
            label: self.label.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{FakeLauncher, LaunchEvent};

    #[tokio::test(start_paused = true)]
    async fn start_moves_to_running() {
        let launcher = FakeLauncher::default();
        let handle =
            ProcessHandle::start(&launcher, &CommandSpec::new("feeder:live", "ffmpeg")).unwrap();
        assert_eq!(handle.state(), ProcessState::Running);
        assert_eq!(
            launcher.events(),
            vec![LaunchEvent::Started("feeder:live".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_terminates_within_grace() {
        let launcher = FakeLauncher::default();
        let mut handle =
            ProcessHandle::start(&launcher, &CommandSpec::new("feeder:live", "ffmpeg")).unwrap();
        let outcome = handle.stop(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(outcome, StopOutcome::Terminated(_)));
        assert_eq!(handle.state(), ProcessState::Dead);
        assert_eq!(
            launcher.events(),
            vec![
                LaunchEvent::Started("feeder:live".into()),
                LaunchEvent::Terminated("feeder:live".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_process_is_killed_after_grace() {
        let launcher = FakeLauncher::default();
        launcher.ignore_terminate(true);
        let mut handle =
            ProcessHandle::start(&launcher, &CommandSpec::new("feeder:live", "ffmpeg")).unwrap();
        let started = tokio::time::Instant::now();
        let outcome = handle.stop(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(outcome, StopOutcome::Killed(_)));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(launcher
            .events()
            .contains(&LaunchEvent::Killed("feeder:live".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn exited_process_reports_dead_without_stop() {
        let launcher = FakeLauncher::default();
        let mut handle =
            ProcessHandle::start(&launcher, &CommandSpec::new("feeder:live", "ffmpeg")).unwrap();
        launcher.crash("feeder:live");
        assert!(!handle.is_alive());
        let outcome = handle.stop(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(outcome, StopOutcome::AlreadyExited(Some(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_surfaces_spawn_error() {
        let launcher = FakeLauncher::default();
        launcher.fail_label("feeder:live");
        let err = ProcessHandle::start(&launcher, &CommandSpec::new("feeder:live", "ffmpeg"))
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(launcher.events().is_empty());
    }
}
