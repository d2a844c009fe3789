//! In-memory process doubles shared by the unit tests.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Output};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;
#[cfg(windows)]
use std::os::windows::process::ExitStatusExt;

use tokio::process::Command;

use super::{ChildProcess, CommandExecutor, CommandSpec, ProcessLauncher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEvent {
    Started(String),
    Terminated(String),
    Killed(String),
    /// The process exited on its own.
    Exited(String),
}

#[derive(Default)]
struct LauncherState {
    events: Vec<LaunchEvent>,
    specs: Vec<CommandSpec>,
    failing: Vec<String>,
    children: Vec<(String, Arc<FakeChildState>)>,
    ignore_terminate: bool,
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
    next_pid: Arc<AtomicU32>,
}

impl FakeLauncher {
    pub fn events(&self) -> Vec<LaunchEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    pub fn started_labels(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                LaunchEvent::Started(label) => Some(label),
                _ => None,
            })
            .collect()
    }

    pub fn fail_label(&self, label: &str) {
        self.state.lock().unwrap().failing.push(label.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    pub fn ignore_terminate(&self, ignore: bool) {
        self.state.lock().unwrap().ignore_terminate = ignore;
    }

    /// Simulates the most recent process with `label` exiting on its own.
    pub fn crash(&self, label: &str) {
        let mut guard = self.state.lock().unwrap();
        let crashed = guard
            .children
            .iter()
            .rev()
            .find(|(l, child)| l == label && child.alive.load(Ordering::SeqCst))
            .map(|(_, child)| Arc::clone(child));
        if let Some(child) = crashed {
            child.alive.store(false, Ordering::SeqCst);
            guard.events.push(LaunchEvent::Exited(label.to_string()));
        }
    }

    pub fn alive_with_prefix(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .children
            .iter()
            .filter(|(label, child)| label.starts_with(prefix) && child.alive.load(Ordering::SeqCst))
            .count()
    }

    /// Panics if two processes whose label starts with `prefix` ever overlapped.
    pub fn assert_single_writer(&self, prefix: &str) {
        let mut running = 0usize;
        for event in self.events() {
            match event {
                LaunchEvent::Started(label) if label.starts_with(prefix) => {
                    running += 1;
                    assert!(running <= 1, "overlapping writers at {label}");
                }
                LaunchEvent::Terminated(label)
                | LaunchEvent::Killed(label)
                | LaunchEvent::Exited(label)
                    if label.starts_with(prefix) =>
                {
                    running = running.saturating_sub(1);
                }
                _ => {}
            }
        }
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &CommandSpec) -> io::Result<Box<dyn ChildProcess>> {
        let mut guard = self.state.lock().unwrap();
        guard.specs.push(spec.clone());
        if guard.failing.iter().any(|label| label == &spec.label) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} unavailable", spec.program.display()),
            ));
        }
        let child = Arc::new(FakeChildState {
            alive: AtomicBool::new(true),
            pid: 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
        });
        guard.children.push((spec.label.clone(), Arc::clone(&child)));
        guard.events.push(LaunchEvent::Started(spec.label.clone()));
        Ok(Box::new(FakeChild {
            label: spec.label.clone(),
            state: child,
            launcher: Arc::clone(&self.state),
        }))
    }
}

struct FakeChildState {
    alive: AtomicBool,
    pid: u32,
}

struct FakeChild {
    label: String,
    state: Arc<FakeChildState>,
    launcher: Arc<Mutex<LauncherState>>,
}

impl FakeChild {
    fn record(&self, event: LaunchEvent) {
        self.launcher.lock().unwrap().events.push(event);
    }
}

#[async_trait::async_trait]
impl ChildProcess for FakeChild {
    fn pid(&self) -> Option<u32> {
        self.state
            .alive
            .load(Ordering::SeqCst)
            .then_some(self.state.pid)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.state.alive.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            Ok(Some(ExitStatus::from_raw(0)))
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        let ignore = self.launcher.lock().unwrap().ignore_terminate;
        if !ignore {
            self.state.alive.store(false, Ordering::SeqCst);
            self.record(LaunchEvent::Terminated(self.label.clone()));
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.state.alive.store(false, Ordering::SeqCst);
        self.record(LaunchEvent::Killed(self.label.clone()));
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        while self.state.alive.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(ExitStatus::from_raw(0))
    }
}

type Responder = dyn Fn(&str, &[String]) -> io::Result<Output> + Send + Sync;

/// Executor that records invocations and answers through a closure.
#[derive(Clone)]
pub struct ScriptedExecutor {
    calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    responder: Arc<Responder>,
}

impl ScriptedExecutor {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &[String]) -> io::Result<Output> + Send + Sync + 'static,
    {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(responder),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        let std = command.as_std();
        let program = Path::new(std.get_program())
            .to_string_lossy()
            .to_string();
        let args: Vec<String> = std
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        self.calls
            .lock()
            .unwrap()
            .push((program.clone(), args.clone()));
        (self.responder)(&program, &args)
    }
}

pub fn output(code: i32, stdout: &str, stderr: &str) -> Output {
    #[cfg(unix)]
    let status = ExitStatus::from_raw(code << 8);
    #[cfg(windows)]
    let status = ExitStatus::from_raw(code as u32);
    Output {
        status,
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}
