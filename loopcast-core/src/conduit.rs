//! The named FIFO between the active feeder and the segmenter.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("failed to prepare conduit {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("named pipes are not supported on this platform")]
    Unsupported,
}

/// A FIFO created once at startup.
///
/// The conduit keeps its own read-write descriptor open for its whole
/// lifetime. The segmenter therefore never sees end-of-file when a feeder
/// exits, and a feeder never blocks opening the write end while the
/// segmenter restarts. The descriptor carries no bytes, so it does not count
/// as a writer for the single-writer rule.
#[derive(Debug)]
pub struct Conduit {
    path: PathBuf,
    keep_alive: Option<File>,
}

impl Conduit {
    /// Creates the FIFO at `path`, replacing any stale artifact of another kind.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, ConduitError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConduitError::Io {
                source,
                path: path.clone(),
            })?;
        }
        match fs::symlink_metadata(&path) {
            Ok(meta) if is_fifo(&meta) => {
                info!(path = %path.display(), "reusing existing conduit");
            }
            Ok(meta) => {
                warn!(path = %path.display(), "replacing stale conduit artifact");
                let removed = if meta.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                removed.map_err(|source| ConduitError::Io {
                    source,
                    path: path.clone(),
                })?;
                make_fifo(&path)?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => make_fifo(&path)?,
            Err(source) => return Err(ConduitError::Io { source, path }),
        }
        Ok(Self {
            path,
            keep_alive: None,
        })
    }

    /// Opens the keep-alive descriptor. Safe to call repeatedly.
    pub fn hold_open(&mut self) -> Result<(), ConduitError> {
        if self.keep_alive.is_some() {
            return Ok(());
        }
        // Read-write opens of a FIFO never block on Linux.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| ConduitError::Io {
                source,
                path: self.path.clone(),
            })?;
        self.keep_alive = Some(file);
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.keep_alive.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn is_fifo(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> Result<(), ConduitError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|err| ConduitError::Io {
        source: io::Error::new(io::ErrorKind::InvalidInput, err),
        path: path.to_path_buf(),
    })?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
    if rc != 0 {
        return Err(ConduitError::Io {
            source: io::Error::last_os_error(),
            path: path.to_path_buf(),
        });
    }
    info!(path = %path.display(), "conduit created");
    Ok(())
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> Result<(), ConduitError> {
    Err(ConduitError::Unsupported)
}
