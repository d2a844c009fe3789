use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::settings::SettingsStore;

use super::{scan_cache_dir, CatalogCache, CatalogError, CatalogFetcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub generation: u64,
    pub items: usize,
    pub failed_sources: Vec<String>,
}

/// Background task keeping the catalog snapshot fresh.
pub struct CatalogRefresher {
    cache: Arc<CatalogCache>,
    fetcher: Arc<dyn CatalogFetcher>,
    settings: SettingsStore,
    cache_dir: PathBuf,
    interval: Duration,
}

impl fmt::Debug for CatalogRefresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogRefresher")
            .field("cache_dir", &self.cache_dir)
            .field("interval", &self.interval)
            .finish()
    }
}

impl CatalogRefresher {
    pub fn new(
        cache: Arc<CatalogCache>,
        fetcher: Arc<dyn CatalogFetcher>,
        settings: SettingsStore,
        cache_dir: PathBuf,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            fetcher,
            settings,
            cache_dir,
            interval,
        }
    }

    /// Publishes whatever is already on disk so playback can start before the
    /// first network refresh completes.
    pub fn prime_from_disk(&self) -> Result<usize, CatalogError> {
        let items = scan_cache_dir(&self.cache_dir)?;
        let count = items.len();
        if count > 0 {
            self.cache.publish(items);
            info!(items = count, "catalog primed from disk cache");
        }
        Ok(count)
    }

    pub async fn refresh_once(&self) -> Result<RefreshSummary, CatalogError> {
        let settings = self.settings.load()?;
        let previous = self.cache.snapshot();
        let report = self
            .fetcher
            .refresh(&settings.on_demand_sources, &previous)
            .await;
        let failed_sources = report
            .failures
            .iter()
            .map(|failure| failure.source.clone())
            .collect();
        let snapshot = self.cache.publish(report.items);
        info!(
            generation = snapshot.generation(),
            items = snapshot.len(),
            "catalog refreshed"
        );
        Ok(RefreshSummary {
            generation: snapshot.generation(),
            items: snapshot.len(),
            failed_sources,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(error) = self.prime_from_disk() {
            warn!(%error, "failed to scan disk cache");
        }
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(error) = self.refresh_once().await {
                warn!(%error, "catalog refresh failed");
            }
            tokio::select! {
                _ = sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("catalog refresher stopped");
    }
}
