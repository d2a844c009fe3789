//! ffmpeg invocations for the segmenter and every feeder kind.

use std::path::{Path, PathBuf};

use tokio::fs as async_fs;
use url::Url;

use crate::config::{FfmpegSection, LoopcastConfig, SegmenterSection, TestPatternSection};
use crate::process::CommandSpec;
use crate::settings::QualityParams;
use crate::source::FeedItem;

pub const SEGMENTER_LABEL: &str = "segmenter";
pub const LIVE_LABEL: &str = "feeder:live";
pub const ON_DEMAND_LABEL: &str = "feeder:on_demand";
pub const TEST_PATTERN_LABEL: &str = "feeder:test_pattern";
pub const FILLER_LABEL: &str = "feeder:filler";

/// Every label a conduit writer can carry starts with this prefix.
pub const FEEDER_PREFIX: &str = "feeder:";

#[derive(Debug, Clone)]
pub struct FfmpegCommands {
    binary: PathBuf,
    ffmpeg: FfmpegSection,
    segmenter: SegmenterSection,
    test_pattern: TestPatternSection,
    conduit: PathBuf,
    hls_dir: PathBuf,
    work_dir: PathBuf,
    logs_dir: PathBuf,
}

impl FfmpegCommands {
    pub fn from_config(config: &LoopcastConfig) -> Self {
        Self {
            binary: PathBuf::from(&config.tools.ffmpeg),
            ffmpeg: config.ffmpeg.clone(),
            segmenter: config.segmenter.clone(),
            test_pattern: config.test_pattern.clone(),
            conduit: config.conduit_path(),
            hls_dir: config.hls_dir(),
            work_dir: config.work_dir(),
            logs_dir: config.logs_dir(),
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.ffmpeg.log_level.clone(),
        ];
        if !self.ffmpeg.stats_period.is_empty() {
            args.push("-stats_period".to_string());
            args.push(self.ffmpeg.stats_period.clone());
        }
        args
    }

    fn spec(&self, label: &str, args: Vec<String>) -> CommandSpec {
        let log_name = format!("{}.log", label.replace(':', "_"));
        CommandSpec::new(label, &self.binary)
            .args(args)
            .log_to(self.logs_dir.join(log_name))
    }

    fn conduit_arg(&self) -> String {
        self.conduit.to_string_lossy().to_string()
    }

    fn push_mpegts_output(&self, args: &mut Vec<String>) {
        args.push("-f".to_string());
        args.push("mpegts".to_string());
        args.push(self.conduit_arg());
    }

    /// The long-lived HLS segmenter reading from the conduit.
    pub fn segmenter(&self) -> CommandSpec {
        let mut args = self.base_args();
        args.push("-re".to_string());
        args.push("-thread_queue_size".to_string());
        args.push(self.ffmpeg.thread_queue_size.to_string());
        args.push("-i".to_string());
        args.push(self.conduit_arg());
        args.push("-c:v".to_string());
        args.push(self.segmenter.video_codec.clone());
        args.push("-preset".to_string());
        args.push(self.segmenter.preset.clone());
        args.push("-c:a".to_string());
        args.push(self.segmenter.audio_codec.clone());
        args.push("-f".to_string());
        args.push("hls".to_string());
        args.push("-hls_time".to_string());
        args.push(self.segmenter.segment_duration.to_string());
        args.push("-hls_list_size".to_string());
        args.push(self.segmenter.playlist_length.to_string());
        if !self.segmenter.flags.is_empty() {
            args.push("-hls_flags".to_string());
            args.push(self.segmenter.flags.join("+"));
        }
        args.push("-hls_segment_filename".to_string());
        args.push(
            self.hls_dir
                .join(&self.segmenter.segment_pattern)
                .to_string_lossy()
                .to_string(),
        );
        args.push(
            self.hls_dir
                .join(&self.segmenter.output_name)
                .to_string_lossy()
                .to_string(),
        );
        self.spec(SEGMENTER_LABEL, args)
    }

    /// Remuxes a resolved live URL into the conduit without re-encoding.
    pub fn live(&self, url: &Url) -> CommandSpec {
        let mut args = self.base_args();
        args.push("-re".to_string());
        args.push("-i".to_string());
        args.push(url.to_string());
        args.push("-c".to_string());
        args.push("copy".to_string());
        self.push_mpegts_output(&mut args);
        self.spec(LIVE_LABEL, args)
    }

    /// Writes a concat manifest for `item` and returns the feeder reading it.
    ///
    /// `quality` selects re-encoding; `None` copies the streams as they are.
    pub async fn on_demand(
        &self,
        item: &FeedItem,
        quality: Option<&QualityParams>,
    ) -> std::io::Result<CommandSpec> {
        async_fs::create_dir_all(&self.work_dir).await?;
        let manifest = self.work_dir.join(format!("concat_{}.txt", sanitize(&item.id)));
        async_fs::write(&manifest, concat_manifest(&item.local_path)).await?;

        let mut args = self.base_args();
        args.push("-re".to_string());
        args.push("-f".to_string());
        args.push("concat".to_string());
        args.push("-safe".to_string());
        args.push("0".to_string());
        args.push("-i".to_string());
        args.push(manifest.to_string_lossy().to_string());
        match quality {
            Some(quality) => {
                args.push("-c:v".to_string());
                args.push(quality.video_codec.clone());
                args.push("-preset".to_string());
                args.push(quality.preset.clone());
                args.push("-crf".to_string());
                args.push(quality.crf.to_string());
                if let Some(height) = quality.max_height {
                    args.push("-vf".to_string());
                    args.push(format!("scale=-2:'min({height},ih)'"));
                }
                args.push("-c:a".to_string());
                args.push(quality.audio_codec.clone());
                args.push("-b:a".to_string());
                args.push(quality.audio_bitrate.clone());
            }
            None => {
                args.push("-c".to_string());
                args.push("copy".to_string());
            }
        }
        self.push_mpegts_output(&mut args);
        Ok(self.spec(ON_DEMAND_LABEL, args))
    }

    /// Color bars and a tone; `label` tells a filler apart from the real thing.
    pub fn test_pattern(&self, label: &str) -> CommandSpec {
        let mut args = self.base_args();
        args.push("-re".to_string());
        args.push("-f".to_string());
        args.push("lavfi".to_string());
        args.push("-i".to_string());
        args.push(self.test_pattern.video.clone());
        args.push("-f".to_string());
        args.push("lavfi".to_string());
        args.push("-i".to_string());
        args.push(self.test_pattern.audio.clone());
        args.push("-c:v".to_string());
        args.push(self.test_pattern.video_codec.clone());
        args.push("-preset".to_string());
        args.push(self.test_pattern.preset.clone());
        args.push("-c:a".to_string());
        args.push(self.test_pattern.audio_codec.clone());
        self.push_mpegts_output(&mut args);
        self.spec(label, args)
    }
}

/// ffmpeg concat syntax; single quotes inside the path are escaped.
fn concat_manifest(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', r"'\''");
    format!("file '{escaped}'\n")
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
