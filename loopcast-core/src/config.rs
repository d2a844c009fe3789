use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoopcastConfig {
    pub paths: PathsSection,
    pub tools: ToolsSection,
    pub arbitration: ArbitrationSection,
    pub transition: TransitionSection,
    pub live: LiveSection,
    pub segmenter: SegmenterSection,
    pub test_pattern: TestPatternSection,
    pub catalog: CatalogSection,
    pub publish: PublishSection,
    pub ffmpeg: FfmpegSection,
}

impl LoopcastConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn hls_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.hls_dir)
    }

    pub fn conduit_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.conduit)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.cache_dir)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.work_dir)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.logs_dir)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.settings_file)
    }

    pub fn status_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.status_file)
    }

    pub fn guide_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.guide_file)
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.playlist_file)
    }

    /// The HLS playlist the segmenter keeps rewriting.
    pub fn segmenter_output(&self) -> PathBuf {
        self.hls_dir().join(&self.segmenter.output_name)
    }

    pub fn cookies_path(&self) -> Option<PathBuf> {
        self.catalog
            .cookies_file
            .as_ref()
            .map(|file| self.resolve_path(file))
    }

    fn validate(&self) -> Result<()> {
        if self.arbitration.interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "arbitration.interval_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if self.arbitration.liveness_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "arbitration.liveness_poll_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.catalog.min_duration_seconds > self.catalog.max_duration_seconds {
            return Err(ConfigError::Invalid {
                field: "catalog.min_duration_seconds",
                reason: format!(
                    "{} exceeds max_duration_seconds {}",
                    self.catalog.min_duration_seconds, self.catalog.max_duration_seconds
                ),
            });
        }
        if !self.live.url_template.contains("{channel}") {
            return Err(ConfigError::Invalid {
                field: "live.url_template",
                reason: "missing {channel} placeholder".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub hls_dir: String,
    pub conduit: String,
    pub cache_dir: String,
    pub work_dir: String,
    pub logs_dir: String,
    pub settings_file: String,
    pub status_file: String,
    pub guide_file: String,
    pub playlist_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    pub ffmpeg: String,
    pub streamlink: String,
    pub yt_dlp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArbitrationSection {
    pub interval_seconds: u64,
    pub liveness_poll_ms: u64,
}

impl ArbitrationSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillerPolicy {
    Always,
    OnKindChange,
    Never,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionSection {
    pub filler: FillerPolicy,
    pub filler_seconds: u64,
    pub stop_grace_seconds: u64,
}

impl TransitionSection {
    pub fn filler_duration(&self) -> Duration {
        Duration::from_secs(self.filler_seconds)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveSection {
    pub url_template: String,
    pub stream_quality: String,
    pub probe_timeout_seconds: u64,
}

impl LiveSection {
    pub fn channel_url(&self, channel: &str) -> String {
        self.url_template.replace("{channel}", channel.trim())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmenterSection {
    pub output_name: String,
    pub segment_pattern: String,
    pub segment_duration: u32,
    pub playlist_length: u32,
    pub flags: Vec<String>,
    pub video_codec: String,
    pub preset: String,
    pub audio_codec: String,
    pub ready_timeout_seconds: u64,
    pub restart_max_attempts: u32,
    pub restart_window_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestPatternSection {
    pub video: String,
    pub audio: String,
    pub video_codec: String,
    pub preset: String,
    pub audio_codec: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSection {
    pub refresh_interval_seconds: u64,
    pub max_items_per_source: usize,
    pub min_duration_seconds: u64,
    pub max_duration_seconds: u64,
    pub download_pause_seconds: u64,
    pub list_timeout_seconds: u64,
    pub download_timeout_seconds: u64,
    pub format: String,
    pub cookies_file: Option<String>,
}

impl CatalogSection {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn accepts_duration(&self, seconds: u64) -> bool {
        (self.min_duration_seconds..=self.max_duration_seconds).contains(&seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishSection {
    pub channel_id: String,
    pub stream_url: String,
    pub group_title: String,
    pub programme_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FfmpegSection {
    pub log_level: String,
    pub stats_period: String,
    pub thread_queue_size: u32,
}

pub fn load_loopcast_config<P: AsRef<Path>>(path: P) -> Result<LoopcastConfig> {
    let config: LoopcastConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
