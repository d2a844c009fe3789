use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::CatalogSection;
use crate::process::{describe, run_bounded, CommandExecutor, SystemCommandExecutor};
use crate::source::FeedItem;

use super::{evict_except, media_path, write_sidecar, CatalogError, CatalogSnapshot};

const LISTING_TEMPLATE: &str = "%(id)s\t%(duration)s\t%(title)s";
const LISTING_OVERSCAN: usize = 5;

/// Result of one refresh pass.
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub items: BTreeMap<String, FeedItem>,
    pub failures: Vec<SourceFailure>,
    pub evicted: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct SourceFailure {
    pub source: String,
    pub error: CatalogError,
}

#[async_trait::async_trait]
pub trait CatalogFetcher: Send + Sync {
    /// Refreshes every source; a failing source keeps its items from `previous`.
    async fn refresh(&self, sources: &[String], previous: &CatalogSnapshot) -> RefreshReport;
}

/// Normalizes a configured source into the channel's uploads page.
pub fn channel_url(source: &str) -> String {
    let source = source.trim();
    if source.starts_with("http://") || source.starts_with("https://") {
        source.to_string()
    } else if source.starts_with('@') {
        format!("https://www.youtube.com/{source}/videos")
    } else if source.starts_with("UC") {
        format!("https://www.youtube.com/channel/{source}/videos")
    } else if source.starts_with("channel/") {
        format!("https://www.youtube.com/{source}/videos")
    } else {
        format!("https://www.youtube.com/@{source}/videos")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ListingEntry {
    id: String,
    duration: Option<u64>,
    title: String,
}

fn parse_listing(stdout: &str) -> Vec<ListingEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let id = parts.next()?.trim();
            if id.is_empty() || id == "NA" {
                return None;
            }
            let duration = parts
                .next()
                .and_then(|value| value.trim().parse::<f64>().ok())
                .filter(|value| value.is_finite() && *value >= 0.0)
                .map(|value| value.round() as u64);
            let title = parts
                .next()
                .map(str::trim)
                .filter(|title| !title.is_empty() && *title != "NA")
                .unwrap_or(id)
                .to_string();
            Some(ListingEntry {
                id: id.to_string(),
                duration,
                title,
            })
        })
        .collect()
}

/// Fetches recent uploads with `yt-dlp` into the cache directory.
pub struct YtDlpFetcher {
    binary: PathBuf,
    cache_dir: PathBuf,
    config: CatalogSection,
    cookies: Option<PathBuf>,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for YtDlpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YtDlpFetcher")
            .field("binary", &self.binary)
            .field("cache_dir", &self.cache_dir)
            .field("config", &self.config)
            .finish()
    }
}

impl YtDlpFetcher {
    pub fn new(
        binary: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        config: CatalogSection,
        cookies: Option<PathBuf>,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            binary: binary.into(),
            cache_dir: cache_dir.into(),
            config,
            cookies,
            executor,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        if let Some(cookies) = self.cookies.as_ref().filter(|path| path.exists()) {
            command.arg("--cookies").arg(cookies);
        }
        command
    }

    async fn list(&self, source: &str) -> Result<Vec<ListingEntry>, CatalogError> {
        let mut command = self.command();
        command
            .arg("--flat-playlist")
            .arg("--playlist-end")
            .arg((self.config.max_items_per_source * LISTING_OVERSCAN).to_string())
            .arg("--print")
            .arg(LISTING_TEMPLATE)
            .arg(channel_url(source));
        let limit = Duration::from_secs(self.config.list_timeout_seconds);
        let output = run_bounded(self.executor.as_ref(), &mut command, limit).await?;
        if !output.status.success() {
            return Err(CatalogError::CommandFailure {
                command: describe(&command),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn download(&self, id: &str) -> Result<PathBuf, CatalogError> {
        let target = media_path(&self.cache_dir, id);
        let template = self.cache_dir.join("%(id)s.%(ext)s");
        let mut command = self.command();
        command
            .arg("--no-playlist")
            .arg("-f")
            .arg(&self.config.format)
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("-o")
            .arg(template)
            .arg(watch_url(id));
        let limit = Duration::from_secs(self.config.download_timeout_seconds);
        let output = run_bounded(self.executor.as_ref(), &mut command, limit).await?;
        if !output.status.success() {
            return Err(CatalogError::CommandFailure {
                command: describe(&command),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !target.exists() {
            return Err(CatalogError::MissingDownload(target));
        }
        Ok(target)
    }

    async fn refresh_source(&self, source: &str) -> Result<Vec<FeedItem>, CatalogError> {
        let listing = self.list(source).await?;
        let selected: Vec<ListingEntry> = listing
            .into_iter()
            .filter(|entry| {
                entry
                    .duration
                    .map(|seconds| self.config.accepts_duration(seconds))
                    .unwrap_or(false)
            })
            .take(self.config.max_items_per_source)
            .collect();

        let mut items = Vec::with_capacity(selected.len());
        let mut downloads = 0usize;
        for entry in selected {
            let path = media_path(&self.cache_dir, &entry.id);
            if !path.exists() {
                if downloads > 0 && self.config.download_pause_seconds > 0 {
                    sleep(Duration::from_secs(self.config.download_pause_seconds)).await;
                }
                downloads += 1;
                info!(source, id = %entry.id, title = %entry.title, "downloading on-demand item");
                if let Err(error) = self.download(&entry.id).await {
                    warn!(source, id = %entry.id, %error, "download failed, skipping item");
                    continue;
                }
            }
            let item = FeedItem {
                id: entry.id.clone(),
                title: entry.title,
                local_path: path,
                duration_seconds: entry.duration.unwrap_or_default(),
                source: Some(source.to_string()),
                url: Some(watch_url(&entry.id)),
            };
            write_sidecar(&self.cache_dir, &item)?;
            items.push(item);
        }
        Ok(items)
    }
}

fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}

#[async_trait::async_trait]
impl CatalogFetcher for YtDlpFetcher {
    async fn refresh(&self, sources: &[String], previous: &CatalogSnapshot) -> RefreshReport {
        let mut report = RefreshReport::default();
        if let Err(source) = std::fs::create_dir_all(&self.cache_dir) {
            let error = CatalogError::Io {
                source,
                path: self.cache_dir.clone(),
            };
            warn!(%error, "cache directory unavailable, keeping previous catalog");
            report.items = previous.items().clone();
            return report;
        }

        for source in sources {
            match self.refresh_source(source).await {
                Ok(items) => {
                    info!(source = %source, items = items.len(), "catalog source refreshed");
                    for item in items {
                        report.items.insert(item.id.clone(), item);
                    }
                }
                Err(error) => {
                    warn!(source = %source, %error, "catalog source refresh failed");
                    for item in previous.items().values() {
                        if item.source.as_deref() == Some(source.as_str()) {
                            report.items.insert(item.id.clone(), item.clone());
                        }
                    }
                    report.failures.push(SourceFailure {
                        source: source.clone(),
                        error,
                    });
                }
            }
        }

        match evict_except(&self.cache_dir, &report.items) {
            Ok(evicted) => {
                if !evicted.is_empty() {
                    info!(files = evicted.len(), "evicted stale cached media");
                }
                report.evicted = evicted;
            }
            Err(error) => warn!(%error, "cache eviction failed"),
        }
        report
    }
}
