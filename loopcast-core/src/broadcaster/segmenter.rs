use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::config::SegmenterSection;
use crate::process::{ProcessError, ProcessHandle, ProcessLauncher};

use super::ffmpeg::FfmpegCommands;

const OUTPUT_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SegmenterError {
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
    #[error("io error on {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("segmenter output {path} did not appear within {waited:?}")]
    OutputTimeout { path: PathBuf, waited: Duration },
}

pub struct SegmenterState {
    handle: ProcessHandle,
    started_at: DateTime<Utc>,
    last_restart_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for SegmenterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmenterState")
            .field("pid", &self.handle.pid())
            .field("started_at", &self.started_at)
            .field("last_restart_at", &self.last_restart_at)
            .finish()
    }
}

/// Keeps the one HLS segmenter running for the life of the daemon.
pub struct SegmenterSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    commands: FfmpegCommands,
    config: SegmenterSection,
    hls_dir: PathBuf,
    output: PathBuf,
    state: Option<SegmenterState>,
    restart_history: VecDeque<DateTime<Utc>>,
    restarts: u32,
}

impl fmt::Debug for SegmenterSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmenterSupervisor")
            .field("output", &self.output)
            .field("state", &self.state)
            .field("restarts", &self.restarts)
            .finish()
    }
}

impl SegmenterSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        commands: FfmpegCommands,
        config: SegmenterSection,
        hls_dir: PathBuf,
    ) -> Self {
        let output = hls_dir.join(&config.output_name);
        Self {
            launcher,
            commands,
            config,
            hls_dir,
            output,
            state: None,
            restart_history: VecDeque::new(),
            restarts: 0,
        }
    }

    pub fn output(&self) -> &PathBuf {
        &self.output
    }

    /// Total restarts since boot.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn state(&self) -> Option<&SegmenterState> {
        self.state.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.as_ref().and_then(|state| state.handle.pid())
    }

    /// Creates the HLS directory and removes playlists and segments left by a
    /// previous run.
    pub fn prepare_output(&self) -> Result<usize, SegmenterError> {
        fs::create_dir_all(&self.hls_dir).map_err(|source| SegmenterError::Io {
            source,
            path: self.hls_dir.clone(),
        })?;
        let entries = fs::read_dir(&self.hls_dir).map_err(|source| SegmenterError::Io {
            source,
            path: self.hls_dir.clone(),
        })?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let stale = path
                .extension()
                .map(|ext| ext == "ts" || ext == "m3u8")
                .unwrap_or(false);
            if stale && path.is_file() {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(error) => warn!(path = %path.display(), %error, "failed to remove stale segment"),
                }
            }
        }
        if removed > 0 {
            info!(removed, dir = %self.hls_dir.display(), "cleared stale hls output");
        }
        Ok(removed)
    }

    pub fn start(&mut self) -> Result<(), SegmenterError> {
        if self.is_alive() {
            return Ok(());
        }
        let handle = ProcessHandle::start(self.launcher.as_ref(), &self.commands.segmenter())?;
        info!(pid = ?handle.pid(), "segmenter started");
        let last_restart_at = self.state.as_ref().and_then(|state| state.last_restart_at);
        self.state = Some(SegmenterState {
            started_at: handle.started_at(),
            handle,
            last_restart_at,
        });
        Ok(())
    }

    pub fn is_alive(&mut self) -> bool {
        self.state
            .as_mut()
            .map(|state| state.handle.is_alive())
            .unwrap_or(false)
    }

    /// Restarts the segmenter only when it has exited. Returns whether a
    /// restart happened.
    pub fn ensure_running(&mut self) -> Result<bool, SegmenterError> {
        if self.is_alive() {
            return Ok(false);
        }
        let status = self
            .state
            .as_ref()
            .and_then(|state| state.handle.exit_status());
        warn!(?status, "segmenter not running, restarting");
        self.record_restart();
        self.start()?;
        Ok(true)
    }

    fn record_restart(&mut self) {
        let now = Utc::now();
        self.restarts += 1;
        if let Some(state) = self.state.as_mut() {
            state.last_restart_at = Some(now);
        }
        self.restart_history.push_back(now);
        let window = chrono::Duration::minutes(self.config.restart_window_minutes);
        while self
            .restart_history
            .front()
            .map(|timestamp| *timestamp < now - window)
            .unwrap_or(false)
        {
            self.restart_history.pop_front();
        }
        if self.restart_history.len() as u32 > self.config.restart_max_attempts {
            error!(
                restarts = self.restart_history.len(),
                window_minutes = self.config.restart_window_minutes,
                "segmenter restart limit exceeded"
            );
        }
    }

    /// Waits until the playlist exists and is non-empty.
    pub async fn wait_for_output(&self, limit: Duration) -> Result<(), SegmenterError> {
        let started = Instant::now();
        loop {
            if fs::metadata(&self.output)
                .map(|meta| meta.len() > 0)
                .unwrap_or(false)
            {
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "segmenter output ready"
                );
                return Ok(());
            }
            if started.elapsed() >= limit {
                return Err(SegmenterError::OutputTimeout {
                    path: self.output.clone(),
                    waited: limit,
                });
            }
            sleep(OUTPUT_POLL).await;
        }
    }

    pub async fn stop(&mut self, grace: Duration) {
        if let Some(mut state) = self.state.take() {
            match state.handle.stop(grace).await {
                Ok(outcome) => info!(?outcome, "segmenter stopped"),
                Err(error) => warn!(%error, "segmenter stop failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::ffmpeg::SEGMENTER_LABEL;
    use crate::config::tests::fixture_in;
    use crate::process::testing::{FakeLauncher, LaunchEvent};
    use tempfile::tempdir;

    fn supervisor(root: &std::path::Path, launcher: &FakeLauncher) -> SegmenterSupervisor {
        let config = fixture_in(root);
        SegmenterSupervisor::new(
            Arc::new(launcher.clone()),
            FfmpegCommands::from_config(&config),
            config.segmenter.clone(),
            config.hls_dir(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_only_after_crash() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let mut segmenter = supervisor(dir.path(), &launcher);
        segmenter.start().unwrap();
        assert!(!segmenter.ensure_running().unwrap());
        assert!(!segmenter.ensure_running().unwrap());
        assert_eq!(launcher.started_labels().len(), 1);

        launcher.crash(SEGMENTER_LABEL);
        assert!(segmenter.ensure_running().unwrap());
        assert_eq!(segmenter.restarts(), 1);
        assert!(segmenter.state().unwrap().last_restart_at.is_some());
        assert_eq!(
            launcher.events(),
            vec![
                LaunchEvent::Started(SEGMENTER_LABEL.into()),
                LaunchEvent::Exited(SEGMENTER_LABEL.into()),
                LaunchEvent::Started(SEGMENTER_LABEL.into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_restarting_past_the_limit() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let mut segmenter = supervisor(dir.path(), &launcher);
        segmenter.start().unwrap();
        for _ in 0..7 {
            launcher.crash(SEGMENTER_LABEL);
            assert!(segmenter.ensure_running().unwrap());
        }
        assert_eq!(segmenter.restarts(), 7);
        assert!(segmenter.is_alive());
    }

    #[test]
    fn prepare_output_clears_stale_segments() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let segmenter = supervisor(dir.path(), &launcher);
        let hls = dir.path().join("hls");
        fs::create_dir_all(&hls).unwrap();
        fs::write(hls.join("stream0.ts"), b"old").unwrap();
        fs::write(hls.join("stream.m3u8"), b"#EXTM3U").unwrap();
        fs::write(hls.join("keep.txt"), b"note").unwrap();
        assert_eq!(segmenter.prepare_output().unwrap(), 2);
        assert!(hls.join("keep.txt").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_output_times_out_on_empty_playlist() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let segmenter = supervisor(dir.path(), &launcher);
        segmenter.prepare_output().unwrap();
        fs::write(segmenter.output(), b"").unwrap();
        let err = segmenter
            .wait_for_output(Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SegmenterError::OutputTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_output_returns_once_playlist_has_content() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let segmenter = supervisor(dir.path(), &launcher);
        segmenter.prepare_output().unwrap();
        let output = segmenter.output().clone();
        let writer = tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            fs::write(output, b"#EXTM3U\n").unwrap();
        });
        segmenter
            .wait_for_output(Duration::from_secs(10))
            .await
            .unwrap();
        writer.await.unwrap();
    }
}
