pub mod feeder;
pub mod ffmpeg;
pub mod resolver;
pub mod segmenter;

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogCache, CatalogSnapshot};
use crate::conduit::{Conduit, ConduitError};
use crate::config::{ArbitrationSection, LoopcastConfig};
use crate::guide::{GuideError, ProgramGuide};
use crate::live::LiveProbe;
use crate::process::{ProcessLauncher, SystemLauncher};
use crate::settings::{ChannelSettings, SettingsError, SettingsStore};
use crate::source::{Source, SourceKind};
use crate::status::{StatusError, StatusReport};

pub use feeder::{ActiveFeeder, CurrentProgram, FeederController, FeederError, TransitionOutcome};
pub use ffmpeg::FfmpegCommands;
pub use resolver::{PlaybackCursor, SourceResolver};
pub use segmenter::{SegmenterError, SegmenterState, SegmenterSupervisor};

#[derive(Debug, Error)]
pub enum BroadcasterError {
    #[error("conduit error: {0}")]
    Conduit(#[from] ConduitError),
    #[error("segmenter error: {0}")]
    Segmenter(#[from] SegmenterError),
    #[error("feeder error: {0}")]
    Feeder(#[from] FeederError),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("guide error: {0}")]
    Guide(#[from] GuideError),
    #[error("status error: {0}")]
    Status(#[from] StatusError),
    #[error("failed to create {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Why the loop woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Interval,
    FeederExited,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub desired: SourceKind,
    pub outcome: TransitionOutcome,
    pub segmenter_restarted: bool,
}

/// The arbitration loop: owns the conduit, the segmenter and the feeder.
pub struct Broadcaster {
    arbitration: ArbitrationSection,
    stop_grace: Duration,
    ready_timeout: Duration,
    conduit_path: PathBuf,
    scratch_dirs: Vec<PathBuf>,
    status_path: PathBuf,
    settings: SettingsStore,
    last_settings: ChannelSettings,
    catalog: Arc<CatalogCache>,
    resolver: SourceResolver,
    feeder: FeederController,
    segmenter: SegmenterSupervisor,
    guide: ProgramGuide,
    conduit: Option<Conduit>,
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("arbitration", &self.arbitration)
            .field("conduit_path", &self.conduit_path)
            .field("feeder", &self.feeder)
            .field("segmenter", &self.segmenter)
            .finish()
    }
}

impl Broadcaster {
    pub fn new(
        config: &LoopcastConfig,
        catalog: Arc<CatalogCache>,
        probe: Arc<dyn LiveProbe>,
        launcher: Option<Arc<dyn ProcessLauncher>>,
    ) -> Self {
        let launcher = launcher.unwrap_or_else(|| Arc::new(SystemLauncher));
        let commands = FfmpegCommands::from_config(config);
        Self {
            arbitration: config.arbitration.clone(),
            stop_grace: config.transition.stop_grace(),
            ready_timeout: Duration::from_secs(config.segmenter.ready_timeout_seconds),
            conduit_path: config.conduit_path(),
            scratch_dirs: vec![config.work_dir(), config.logs_dir(), config.cache_dir()],
            status_path: config.status_path(),
            settings: SettingsStore::new(config.settings_path()),
            last_settings: ChannelSettings::default(),
            catalog,
            resolver: SourceResolver::new(Arc::clone(&probe), PlaybackCursor::new()),
            feeder: FeederController::new(
                Arc::clone(&launcher),
                probe,
                commands.clone(),
                config.transition.clone(),
            ),
            segmenter: SegmenterSupervisor::new(
                launcher,
                commands,
                config.segmenter.clone(),
                config.hls_dir(),
            ),
            guide: ProgramGuide::from_config(config),
            conduit: None,
        }
    }

    /// Replaces the rotation cursor, e.g. with a seeded one.
    pub fn with_cursor(mut self, cursor: PlaybackCursor) -> Self {
        self.resolver.replace_cursor(cursor);
        self
    }

    pub fn feeder(&self) -> &FeederController {
        &self.feeder
    }

    pub fn segmenter(&self) -> &SegmenterSupervisor {
        &self.segmenter
    }

    /// Brings up the conduit and segmenter with the test pattern flowing.
    pub async fn boot(&mut self) -> Result<(), BroadcasterError> {
        for dir in &self.scratch_dirs {
            fs::create_dir_all(dir).map_err(|source| BroadcasterError::Io {
                source,
                path: dir.clone(),
            })?;
        }
        let mut conduit = Conduit::create(&self.conduit_path)?;
        conduit.hold_open()?;
        self.conduit = Some(conduit);

        self.segmenter.prepare_output()?;
        self.segmenter.start()?;

        self.last_settings = self.load_settings();
        self.feeder
            .transition_to(&Source::TestPattern, &self.last_settings)
            .await?;

        if let Err(error) = self.segmenter.wait_for_output(self.ready_timeout).await {
            warn!(%error, "segmenter output not ready yet, continuing");
        }
        self.guide.write_playlist(&self.last_settings)?;
        self.guide
            .write_guide(&self.last_settings, self.feeder.program())?;
        info!(conduit = %self.conduit_path.display(), "broadcaster booted");
        Ok(())
    }

    /// One arbitration pass.
    pub async fn tick(&mut self) -> Result<TickReport, BroadcasterError> {
        let segmenter_restarted = match self.segmenter.ensure_running() {
            Ok(restarted) => restarted,
            Err(error) => {
                error!(%error, "segmenter restart failed");
                false
            }
        };

        let settings = self.load_settings();
        if settings.display_name != self.last_settings.display_name
            || settings.logo != self.last_settings.logo
        {
            if let Err(error) = self.guide.write_playlist(&settings) {
                warn!(%error, "failed to rewrite playlist");
            }
        }
        self.last_settings = settings.clone();

        let snapshot = self.catalog.snapshot();
        let desired = self.resolver.resolve(&settings, &snapshot).await;
        debug!(desired = %desired, "source resolved");

        let outcome = match self.feeder.transition_to(&desired, &settings).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.publish_status(&snapshot);
                return Err(error.into());
            }
        };
        match (&desired, &outcome) {
            (
                _,
                TransitionOutcome::Started {
                    source: Source::OnDemand(item),
                    ..
                },
            ) => self.resolver.commit(item),
            // An unplayable head would otherwise be picked again every tick.
            (Source::OnDemand(item), TransitionOutcome::FellBack { .. }) => {
                warn!(id = %item.id, "skipping unplayable item in rotation");
                self.resolver.commit(item);
            }
            _ => {}
        }
        if outcome.program_changed() {
            if let Err(error) = self.guide.write_guide(&settings, self.feeder.program()) {
                warn!(%error, "failed to write guide");
            }
        }
        self.publish_status(&snapshot);
        Ok(TickReport {
            desired: desired.kind(),
            outcome,
            segmenter_restarted,
        })
    }

    /// Sleeps one arbitration interval, waking early when the feeder exits or
    /// shutdown is requested.
    pub async fn wait_for_next_tick(&mut self, shutdown: &mut watch::Receiver<bool>) -> Wake {
        let deadline = Instant::now() + self.arbitration.interval();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Wake::Interval;
            }
            let step = self.arbitration.liveness_poll().min(deadline - now);
            tokio::select! {
                _ = sleep(step) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Wake::Shutdown;
                    }
                }
            }
            if !self.feeder.is_alive() {
                info!("feeder exited, arbitrating early");
                return Wake::FeederExited;
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BroadcasterError> {
        self.boot().await?;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(error) = self.tick().await {
                error!(%error, "arbitration tick failed");
            }
            if self.wait_for_next_tick(&mut shutdown).await == Wake::Shutdown {
                break;
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Stops the feeder, then the segmenter.
    pub async fn shutdown(&mut self) {
        self.feeder.stop().await;
        self.segmenter.stop(self.stop_grace).await;
        self.conduit = None;
        info!("broadcaster stopped");
    }

    pub fn status(&self, snapshot: &CatalogSnapshot) -> StatusReport {
        let active = self.feeder.active();
        StatusReport {
            active_source_kind: active.map(|feeder| feeder.source().kind()),
            since: active.map(|feeder| feeder.started_at()),
            program: self.feeder.program().map(|program| program.label.clone()),
            feeder_pid: active.and_then(|feeder| feeder.pid()),
            segmenter_pid: self.segmenter.pid(),
            segmenter_restarts: self.segmenter.restarts(),
            catalog_items: snapshot.len(),
            catalog_generation: snapshot.generation(),
            updated_at: Utc::now(),
        }
    }

    fn publish_status(&self, snapshot: &CatalogSnapshot) {
        let report = self.status(snapshot);
        if let Err(error) = report.write_to(&self.status_path) {
            warn!(%error, "failed to write status");
        }
    }

    /// Falls back to the last good settings when the document is unreadable.
    fn load_settings(&self) -> ChannelSettings {
        match self.settings.load() {
            Ok(settings) => settings,
            Err(error) => {
                warn!(%error, "failed to load settings, keeping previous");
                self.last_settings.clone()
            }
        }
    }
}
