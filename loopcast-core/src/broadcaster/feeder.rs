use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{FillerPolicy, TransitionSection};
use crate::live::{LiveProbe, ProbeFailure};
use crate::process::{CommandSpec, ProcessError, ProcessHandle, ProcessLauncher, StopOutcome};
use crate::settings::ChannelSettings;
use crate::source::{Source, SourceKind};

use super::ffmpeg::{FfmpegCommands, FILLER_LABEL, TEST_PATTERN_LABEL};

#[derive(Debug, Error)]
pub enum FeederError {
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
    #[error("failed to prepare feeder input: {0}")]
    Io(#[from] std::io::Error),
    #[error("media file missing: {0}")]
    MissingMedia(PathBuf),
    #[error("live channel {channel} unavailable: {failure}")]
    LiveUnavailable {
        channel: String,
        failure: ProbeFailure,
    },
}

/// The single process currently writing into the conduit.
pub struct ActiveFeeder {
    id: Uuid,
    source: Source,
    handle: ProcessHandle,
    started_at: DateTime<Utc>,
}

impl fmt::Debug for ActiveFeeder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveFeeder")
            .field("id", &self.id)
            .field("source", &self.source.to_string())
            .field("pid", &self.handle.pid())
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl ActiveFeeder {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// What the channel is announced as showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentProgram {
    pub label: String,
    pub kind: SourceKind,
    pub started_at: DateTime<Utc>,
    /// Known length, for on-demand items.
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The requested source was already playing.
    Unchanged,
    Started {
        source: Source,
        filler: bool,
        program_changed: bool,
    },
    /// The requested source failed to start; the test pattern took over.
    FellBack {
        wanted: SourceKind,
        program_changed: bool,
    },
}

impl TransitionOutcome {
    pub fn program_changed(&self) -> bool {
        match self {
            TransitionOutcome::Unchanged => false,
            TransitionOutcome::Started {
                program_changed, ..
            }
            | TransitionOutcome::FellBack {
                program_changed, ..
            } => *program_changed,
        }
    }
}

/// Owns the conduit's writer and performs every hand-over.
///
/// Transitions take `&mut self`, so two of them can never interleave.
pub struct FeederController {
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn LiveProbe>,
    commands: FfmpegCommands,
    transition: TransitionSection,
    active: Option<ActiveFeeder>,
    program: Option<CurrentProgram>,
}

impl fmt::Debug for FeederController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeederController")
            .field("transition", &self.transition)
            .field("active", &self.active)
            .field("program", &self.program)
            .finish()
    }
}

impl FeederController {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn LiveProbe>,
        commands: FfmpegCommands,
        transition: TransitionSection,
    ) -> Self {
        Self {
            launcher,
            probe,
            commands,
            transition,
            active: None,
            program: None,
        }
    }

    pub fn active(&self) -> Option<&ActiveFeeder> {
        self.active.as_ref()
    }

    pub fn active_source(&self) -> Option<&Source> {
        self.active.as_ref().map(|feeder| &feeder.source)
    }

    pub fn program(&self) -> Option<&CurrentProgram> {
        self.program.as_ref()
    }

    pub fn is_alive(&mut self) -> bool {
        self.active
            .as_mut()
            .map(|feeder| feeder.handle.is_alive())
            .unwrap_or(false)
    }

    pub async fn transition_to(
        &mut self,
        target: &Source,
        settings: &ChannelSettings,
    ) -> Result<TransitionOutcome, FeederError> {
        if let Some(active) = self.active.as_mut() {
            if target.satisfied_by(&active.source) && active.handle.is_alive() {
                return Ok(TransitionOutcome::Unchanged);
            }
        }

        let previous_kind = self.stop().await;

        let filler = self.needs_filler(previous_kind, target.kind());
        if filler {
            self.play_filler().await;
        }

        match self.launch(target, settings).await {
            Ok(handle) => {
                let program_changed = self.record(target.clone(), handle);
                Ok(TransitionOutcome::Started {
                    source: target.clone(),
                    filler,
                    program_changed,
                })
            }
            Err(error) if target.kind() != SourceKind::TestPattern => {
                warn!(source = %target, %error, "feeder failed to start, falling back to test pattern");
                let handle = self.launch(&Source::TestPattern, settings).await?;
                let program_changed = self.record(Source::TestPattern, handle);
                Ok(TransitionOutcome::FellBack {
                    wanted: target.kind(),
                    program_changed,
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Stops the active feeder, returning the kind it was playing.
    pub async fn stop(&mut self) -> Option<SourceKind> {
        let mut feeder = self.active.take()?;
        let kind = feeder.source.kind();
        let uptime_ms = (Utc::now() - feeder.started_at).num_milliseconds();
        match feeder.handle.stop(self.transition.stop_grace()).await {
            Ok(StopOutcome::AlreadyExited(status)) => {
                info!(source = %feeder.source, ?status, uptime_ms, "feeder had already exited");
            }
            Ok(outcome) => {
                debug!(source = %feeder.source, ?outcome, uptime_ms, "feeder stopped");
            }
            Err(error) => {
                warn!(source = %feeder.source, %error, "feeder stop failed");
            }
        }
        Some(kind)
    }

    fn needs_filler(&self, previous: Option<SourceKind>, next: SourceKind) -> bool {
        if next == SourceKind::TestPattern || previous == Some(SourceKind::TestPattern) {
            return false;
        }
        match self.transition.filler {
            FillerPolicy::Always => previous.is_some(),
            FillerPolicy::OnKindChange => previous.map(|kind| kind != next).unwrap_or(false),
            FillerPolicy::Never => false,
        }
    }

    async fn play_filler(&mut self) {
        let spec = self.commands.test_pattern(FILLER_LABEL);
        let mut handle = match ProcessHandle::start(self.launcher.as_ref(), &spec) {
            Ok(handle) => handle,
            Err(error) => {
                warn!(%error, "filler failed to start, skipping it");
                return;
            }
        };
        sleep(self.transition.filler_duration()).await;
        if let Err(error) = handle.stop(self.transition.stop_grace()).await {
            warn!(%error, "filler stop failed");
        }
    }

    async fn launch(
        &self,
        source: &Source,
        settings: &ChannelSettings,
    ) -> Result<ProcessHandle, FeederError> {
        let spec = self.command_for(source, settings).await?;
        let handle = ProcessHandle::start(self.launcher.as_ref(), &spec)?;
        Ok(handle)
    }

    async fn command_for(
        &self,
        source: &Source,
        settings: &ChannelSettings,
    ) -> Result<CommandSpec, FeederError> {
        match source {
            Source::Live(channel) => {
                // The URL from the arbitration probe may already be stale.
                let url = self.probe.resolve(channel).await.map_err(|failure| {
                    FeederError::LiveUnavailable {
                        channel: channel.clone(),
                        failure,
                    }
                })?;
                Ok(self.commands.live(&url))
            }
            Source::OnDemand(item) => {
                if !item.local_path.exists() {
                    return Err(FeederError::MissingMedia(item.local_path.clone()));
                }
                let quality = settings
                    .transcode_on_demand
                    .then_some(&settings.quality_params);
                Ok(self.commands.on_demand(item, quality).await?)
            }
            Source::TestPattern => Ok(self.commands.test_pattern(TEST_PATTERN_LABEL)),
        }
    }

    fn record(&mut self, source: Source, handle: ProcessHandle) -> bool {
        let started_at = handle.started_at();
        info!(source = %source, pid = ?handle.pid(), "feeder started");
        let label = source.program_label();
        let changed = self
            .program
            .as_ref()
            .map(|program| program.label != label)
            .unwrap_or(true);
        if changed {
            let duration_seconds = match &source {
                Source::OnDemand(item) if item.duration_seconds > 0 => Some(item.duration_seconds),
                _ => None,
            };
            info!(program = %label, "program changed");
            self.program = Some(CurrentProgram {
                label,
                kind: source.kind(),
                started_at,
                duration_seconds,
            });
        }
        self.active = Some(ActiveFeeder {
            id: Uuid::new_v4(),
            source,
            handle,
            started_at,
        });
        changed
    }
}
