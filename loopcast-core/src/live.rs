//! Live upstream probing through the external stream-resolution tool.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use url::Url;

use crate::config::LiveSection;
use crate::process::{run_bounded, CommandExecutor, ProcessError, SystemCommandExecutor};

/// Why a channel is not considered live.
///
/// Every variant means "not live" to the resolver; they stay separate so logs
/// and tests can tell an offline channel from a broken tool.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("channel offline (status {status:?}): {stderr}")]
    Offline { status: Option<i32>, stderr: String },
    #[error("probe timed out after {0:?}")]
    TimedOut(Duration),
    #[error("probe tool unavailable: {0}")]
    ToolUnavailable(std::io::Error),
    #[error("probe returned an unusable url {output:?}: {reason}")]
    InvalidUrl { output: String, reason: String },
}

impl ProbeFailure {
    /// True for the steady-state "nobody is streaming" answer.
    pub fn is_offline(&self) -> bool {
        matches!(self, ProbeFailure::Offline { .. })
    }
}

#[async_trait::async_trait]
pub trait LiveProbe: Send + Sync {
    /// Resolves a directly playable media URL for `channel`.
    async fn resolve(&self, channel: &str) -> Result<Url, ProbeFailure>;
}

/// Probes with `streamlink --stream-url <channel url> <quality>`.
#[derive(Clone)]
pub struct StreamlinkProbe {
    binary: PathBuf,
    config: LiveSection,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for StreamlinkProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamlinkProbe")
            .field("binary", &self.binary)
            .field("config", &self.config)
            .finish()
    }
}

impl StreamlinkProbe {
    pub fn new(
        binary: impl Into<PathBuf>,
        config: LiveSection,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            binary: binary.into(),
            config,
            executor,
        }
    }
}

#[async_trait::async_trait]
impl LiveProbe for StreamlinkProbe {
    async fn resolve(&self, channel: &str) -> Result<Url, ProbeFailure> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--stream-url")
            .arg(self.config.channel_url(channel))
            .arg(&self.config.stream_quality);
        let output = match run_bounded(
            self.executor.as_ref(),
            &mut command,
            self.config.probe_timeout(),
        )
        .await
        {
            Ok(output) => output,
            Err(ProcessError::TimedOut(limit)) => return Err(ProbeFailure::TimedOut(limit)),
            Err(ProcessError::Io { source, .. }) => {
                return Err(ProbeFailure::ToolUnavailable(source))
            }
            Err(other) => {
                return Err(ProbeFailure::ToolUnavailable(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    other.to_string(),
                )))
            }
        };
        if !output.status.success() {
            return Err(ProbeFailure::Offline {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_stream_url(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Takes the last non-empty stdout line; streamlink may print notices first.
fn parse_stream_url(stdout: &str) -> Result<Url, ProbeFailure> {
    let candidate = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default();
    let url = Url::parse(candidate).map_err(|err| ProbeFailure::InvalidUrl {
        output: candidate.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" | "rtmp" | "rtmps" => Ok(url),
        other => Err(ProbeFailure::InvalidUrl {
            output: candidate.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}
