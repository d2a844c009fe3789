//! Channel settings document.
//!
//! The control CLI owns writes; the arbitration loop re-reads the document on
//! every tick so edits apply within one polling interval.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSettings {
    pub live_channel: Option<String>,
    #[serde(alias = "youtube_channels")]
    pub on_demand_sources: Vec<String>,
    pub display_name: String,
    pub logo: Option<String>,
    pub transcode_on_demand: bool,
    pub quality_params: QualityParams,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            live_channel: None,
            on_demand_sources: Vec::new(),
            display_name: "Loopcast".to_string(),
            logo: None,
            transcode_on_demand: false,
            quality_params: QualityParams::default(),
        }
    }
}

impl ChannelSettings {
    /// Configured live channel, ignoring blank entries.
    pub fn live_channel(&self) -> Option<&str> {
        self.live_channel
            .as_deref()
            .map(str::trim)
            .filter(|channel| !channel.is_empty())
    }

    /// Adds a source; returns false when it was already present.
    pub fn add_source(&mut self, source: &str) -> bool {
        let source = source.trim();
        if source.is_empty() || self.on_demand_sources.iter().any(|s| s == source) {
            return false;
        }
        self.on_demand_sources.push(source.to_string());
        true
    }

    pub fn remove_source(&mut self, source: &str) -> bool {
        let before = self.on_demand_sources.len();
        self.on_demand_sources.retain(|s| s != source.trim());
        before != self.on_demand_sources.len()
    }
}

/// Encoder knobs applied when on-demand items are re-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityParams {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub max_height: Option<u32>,
}

impl Default for QualityParams {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            crf: 23,
            audio_codec: "aac".to_string(),
            audio_bitrate: "160k".to_string(),
            max_height: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing documents load as defaults.
    pub fn load(&self) -> SettingsResult<ChannelSettings> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(ChannelSettings::default())
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    source,
                    path: self.path.clone(),
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            source,
            path: self.path.clone(),
        })
    }

    /// Writes through a sibling temp file and renames it into place so readers
    /// never observe a half-written document.
    pub fn save(&self, settings: &ChannelSettings) -> SettingsResult<()> {
        let json = serde_json::to_vec_pretty(settings)?;
        write_atomically(&self.path, &json).map_err(|source| self.io_error(source))
    }

    pub fn update<F, T>(&self, apply: F) -> SettingsResult<T>
    where
        F: FnOnce(&mut ChannelSettings) -> T,
    {
        let mut settings = self.load()?;
        let outcome = apply(&mut settings);
        self.save(&settings)?;
        Ok(outcome)
    }

    fn io_error(&self, source: io::Error) -> SettingsError {
        SettingsError::Io {
            source,
            path: self.path.clone(),
        }
    }
}

/// Replaces `path` with `bytes` through a sibling temp file and a rename.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_document_yields_defaults() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("config.json"));
        let settings = store.load().unwrap();
        assert_eq!(settings, ChannelSettings::default());
        assert!(settings.live_channel().is_none());
    }

    #[test]
    fn save_then_load_preserves_document() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("nested/config.json"));
        let mut settings = ChannelSettings::default();
        settings.live_channel = Some("somecreator".into());
        settings.add_source("@handle");
        settings.transcode_on_demand = true;
        store.save(&settings).unwrap();
        assert_eq!(store.load().unwrap(), settings);
    }

    #[test]
    fn parses_camel_case_keys_and_legacy_alias() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"liveChannel":"creator","youtube_channels":["UCabc"],"qualityParams":{"crf":20}}"#,
        )
        .unwrap();
        let settings = SettingsStore::new(&path).load().unwrap();
        assert_eq!(settings.live_channel(), Some("creator"));
        assert_eq!(settings.on_demand_sources, vec!["UCabc".to_string()]);
        assert_eq!(settings.quality_params.crf, 20);
        assert_eq!(settings.quality_params.preset, "veryfast");
        assert_eq!(settings.display_name, "Loopcast");
    }

    #[test]
    fn blank_live_channel_is_ignored() {
        let settings = ChannelSettings {
            live_channel: Some("   ".into()),
            ..ChannelSettings::default()
        };
        assert!(settings.live_channel().is_none());
    }

    #[test]
    fn sources_are_deduplicated() {
        let mut settings = ChannelSettings::default();
        assert!(settings.add_source("@a"));
        assert!(!settings.add_source(" @a "));
        assert!(!settings.add_source(""));
        assert!(settings.remove_source("@a"));
        assert!(!settings.remove_source("@a"));
    }

    #[test]
    fn corrupt_document_reports_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let err = SettingsStore::new(&path).load().unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
    }
}
