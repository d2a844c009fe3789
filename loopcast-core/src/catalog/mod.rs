pub mod fetcher;
pub mod refresher;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::source::FeedItem;

pub use fetcher::{channel_url, CatalogFetcher, RefreshReport, SourceFailure, YtDlpFetcher};
pub use refresher::CatalogRefresher;

const MEDIA_EXTENSION: &str = "mp4";
const SIDECAR_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("io error on {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("process error: {0}")]
    Process(#[from] crate::process::ProcessError),
    #[error("download finished without producing {0}")]
    MissingDownload(PathBuf),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("settings error: {0}")]
    Settings(#[from] crate::settings::SettingsError),
}

/// Immutable view of the cached on-demand items.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    generation: u64,
    refreshed_at: Option<DateTime<Utc>>,
    items: BTreeMap<String, FeedItem>,
}

impl CatalogSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    pub fn items(&self) -> &BTreeMap<String, FeedItem> {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&FeedItem> {
        self.items.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Copy-on-write holder for the current snapshot.
///
/// Readers clone the `Arc`; the refresher swaps in a whole new snapshot, so a
/// reader never sees a partially updated collection.
#[derive(Debug, Default)]
pub struct CatalogCache {
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl CatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Publishes `items`; an identical item set keeps the current generation.
    pub fn publish(&self, items: BTreeMap<String, FeedItem>) -> Arc<CatalogSnapshot> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.generation > 0 && guard.items == items {
            return Arc::clone(&guard);
        }
        let next = Arc::new(CatalogSnapshot {
            generation: guard.generation + 1,
            refreshed_at: Some(Utc::now()),
            items,
        });
        *guard = Arc::clone(&next);
        debug!(generation = next.generation, items = next.len(), "catalog snapshot published");
        next
    }
}

pub fn media_path(cache_dir: &Path, id: &str) -> PathBuf {
    cache_dir.join(format!("{id}.{MEDIA_EXTENSION}"))
}

pub fn sidecar_path(cache_dir: &Path, id: &str) -> PathBuf {
    cache_dir.join(format!("{id}.{SIDECAR_EXTENSION}"))
}

pub fn write_sidecar(cache_dir: &Path, item: &FeedItem) -> Result<(), CatalogError> {
    let path = sidecar_path(cache_dir, &item.id);
    let json = serde_json::to_vec_pretty(item)?;
    fs::write(&path, json).map_err(|source| CatalogError::Io { source, path })
}

/// Lists the media already on disk, using sidecar metadata where present.
pub fn scan_cache_dir(cache_dir: &Path) -> Result<BTreeMap<String, FeedItem>, CatalogError> {
    let mut items = BTreeMap::new();
    if !cache_dir.exists() {
        return Ok(items);
    }
    for entry in WalkDir::new(cache_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|err| CatalogError::Io {
            path: err
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| cache_dir.to_path_buf()),
            source: err
                .into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk error")),
        })?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().map(|ext| ext != MEDIA_EXTENSION).unwrap_or(true)
        {
            continue;
        }
        let Some(id) = path.file_stem().map(|stem| stem.to_string_lossy().to_string()) else {
            continue;
        };
        let item = match read_sidecar(cache_dir, &id) {
            Some(mut item) => {
                item.local_path = path.to_path_buf();
                item
            }
            None => FeedItem {
                id: id.clone(),
                title: id.clone(),
                local_path: path.to_path_buf(),
                duration_seconds: 0,
                source: None,
                url: None,
            },
        };
        items.insert(id, item);
    }
    Ok(items)
}

fn read_sidecar(cache_dir: &Path, id: &str) -> Option<FeedItem> {
    let path = sidecar_path(cache_dir, id);
    let content = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(item) => Some(item),
        Err(error) => {
            warn!(path = %path.display(), %error, "ignoring unreadable sidecar");
            None
        }
    }
}

/// Removes cached media and sidecars whose id is not in `keep`.
pub fn evict_except(
    cache_dir: &Path,
    keep: &BTreeMap<String, FeedItem>,
) -> Result<Vec<PathBuf>, CatalogError> {
    let mut removed = Vec::new();
    for id in scan_cache_dir(cache_dir)?.into_keys() {
        if keep.contains_key(&id) {
            continue;
        }
        for path in [media_path(cache_dir, &id), sidecar_path(cache_dir, &id)] {
            match fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(error) => warn!(path = %path.display(), %error, "failed to evict cached file"),
            }
        }
    }
    Ok(removed)
}

/// Deletes every file in the cache directory.
pub fn clear_cache_dir(cache_dir: &Path) -> Result<usize, CatalogError> {
    let mut removed = 0;
    if !cache_dir.exists() {
        return Ok(removed);
    }
    let entries = fs::read_dir(cache_dir).map_err(|source| CatalogError::Io {
        source,
        path: cache_dir.to_path_buf(),
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(error) => warn!(path = %path.display(), %error, "failed to delete cached file"),
            }
        }
    }
    Ok(removed)
}
