//! M3U playlist and XMLTV guide describing the channel.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::broadcaster::CurrentProgram;
use crate::config::{LoopcastConfig, PublishSection};
use crate::settings::{write_atomically, ChannelSettings};

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
const XMLTV_TIME: &str = "%Y%m%d%H%M%S %z";

#[derive(Debug, Error)]
pub enum GuideError {
    #[error("failed to write {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to render guide: {0}")]
    Render(String),
}

#[derive(Serialize)]
#[serde(rename = "tv")]
struct Tv<'a> {
    #[serde(rename = "@generator-info-name")]
    generator: &'a str,
    channel: XmlChannel<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    programme: Option<XmlProgramme<'a>>,
}

#[derive(Serialize)]
struct XmlChannel<'a> {
    #[serde(rename = "@id")]
    id: &'a str,
    #[serde(rename = "display-name")]
    display_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<XmlIcon<'a>>,
}

#[derive(Serialize)]
struct XmlIcon<'a> {
    #[serde(rename = "@src")]
    src: &'a str,
}

#[derive(Serialize)]
struct XmlProgramme<'a> {
    #[serde(rename = "@start")]
    start: String,
    #[serde(rename = "@stop")]
    stop: String,
    #[serde(rename = "@channel")]
    channel: &'a str,
    title: &'a str,
}

/// Writes the channel descriptions consumed by IPTV players.
#[derive(Debug, Clone)]
pub struct ProgramGuide {
    publish: PublishSection,
    guide_path: PathBuf,
    playlist_path: PathBuf,
}

impl ProgramGuide {
    pub fn from_config(config: &LoopcastConfig) -> Self {
        Self {
            publish: config.publish.clone(),
            guide_path: config.guide_path(),
            playlist_path: config.playlist_path(),
        }
    }

    pub fn guide_path(&self) -> &Path {
        &self.guide_path
    }

    pub fn playlist_path(&self) -> &Path {
        &self.playlist_path
    }

    pub fn write_playlist(&self, settings: &ChannelSettings) -> Result<(), GuideError> {
        let body = render_m3u(&self.publish, settings);
        write(&self.playlist_path, body.as_bytes())?;
        debug!(path = %self.playlist_path.display(), "playlist written");
        Ok(())
    }

    pub fn write_guide(
        &self,
        settings: &ChannelSettings,
        program: Option<&CurrentProgram>,
    ) -> Result<(), GuideError> {
        let body = render_xmltv(&self.publish, settings, program)?;
        write(&self.guide_path, body.as_bytes())?;
        debug!(path = %self.guide_path.display(), program = ?program.map(|p| &p.label), "guide written");
        Ok(())
    }
}

fn write(path: &Path, bytes: &[u8]) -> Result<(), GuideError> {
    write_atomically(path, bytes).map_err(|source| GuideError::Io {
        source,
        path: path.to_path_buf(),
    })
}

pub fn render_m3u(publish: &PublishSection, settings: &ChannelSettings) -> String {
    let logo = settings.logo.as_deref().unwrap_or_default();
    format!(
        "#EXTM3U\n#EXTINF:-1 tvg-id=\"{id}\" tvg-name=\"{name}\" tvg-logo=\"{logo}\" group-title=\"{group}\",{name}\n{url}\n",
        id = publish.channel_id,
        name = settings.display_name,
        group = publish.group_title,
        url = publish.stream_url,
    )
}

pub fn render_xmltv(
    publish: &PublishSection,
    settings: &ChannelSettings,
    program: Option<&CurrentProgram>,
) -> Result<String, GuideError> {
    let programme = program.map(|program| {
        let stop = programme_stop(program.started_at, program.duration_seconds, publish);
        XmlProgramme {
            start: program.started_at.format(XMLTV_TIME).to_string(),
            stop: stop.format(XMLTV_TIME).to_string(),
            channel: &publish.channel_id,
            title: &program.label,
        }
    });
    let tv = Tv {
        generator: "loopcast",
        channel: XmlChannel {
            id: &publish.channel_id,
            display_name: &settings.display_name,
            icon: settings.logo.as_deref().map(|src| XmlIcon { src }),
        },
        programme,
    };
    let xml = quick_xml::se::to_string(&tv).map_err(|e| GuideError::Render(e.to_string()))?;
    Ok(format!("{XML_DECLARATION}\n{xml}\n"))
}

fn programme_stop(
    start: DateTime<Utc>,
    duration_seconds: Option<u64>,
    publish: &PublishSection,
) -> DateTime<Utc> {
    // Durations come from sidecar files on disk and may be garbage.
    duration_seconds
        .and_then(|seconds| i64::try_from(seconds).ok())
        .and_then(Duration::try_seconds)
        .and_then(|length| start.checked_add_signed(length))
        .unwrap_or_else(|| start + Duration::minutes(publish.programme_minutes))
}
