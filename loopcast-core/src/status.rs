use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::write_atomically;
use crate::source::SourceKind;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to access status {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to decode status {path}: {source}")]
    Decode {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Snapshot of the daemon published after every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub active_source_kind: Option<SourceKind>,
    pub since: Option<DateTime<Utc>>,
    pub program: Option<String>,
    pub feeder_pid: Option<u32>,
    pub segmenter_pid: Option<u32>,
    pub segmenter_restarts: u32,
    pub catalog_items: usize,
    pub catalog_generation: u64,
    pub updated_at: DateTime<Utc>,
}

impl StatusReport {
    pub fn write_to(&self, path: &Path) -> Result<(), StatusError> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomically(path, &json).map_err(|source| StatusError::Io {
            source,
            path: path.to_path_buf(),
        })
    }

    pub fn read_from(path: &Path) -> Result<Self, StatusError> {
        let content = fs::read_to_string(path).map_err(|source| StatusError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        serde_json::from_str(&content).map_err(|source| StatusError::Decode {
            source,
            path: path.to_path_buf(),
        })
    }

    /// Seconds since the report was written.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.updated_at).num_seconds()
    }
}
