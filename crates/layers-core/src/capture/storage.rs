use std::fs;
use std::path::{Path, PathBuf};

use crate::models::QueuedCapture;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueStorageError {
    #[error("Failed to read capture queue: {0}")]
    Read(String),
    #[error("Failed to parse capture queue: {0}")]
    Parse(String),
    #[error("Failed to save capture queue: {0}")]
    Write(String),
}

/// Durable, ordered list of captures waiting for delivery (JSON file).
///
/// Loading never fails: an unreadable or malformed file leaves the queue
/// empty with the problem in `last_error()`. A malformed file is moved
/// aside to `<name>.corrupt` first so the next save cannot destroy it.
pub struct QueueStorage {
    path: PathBuf,
    entries: Vec<QueuedCapture>,
    last_error: Option<QueueStorageError>,
}

impl QueueStorage {
    pub fn open(path: PathBuf) -> Self {
        let (entries, last_error) = Self::load_from_file(&path);
        if let Some(e) = &last_error {
            tracing::warn!("{}", e);
        }
        Self {
            path,
            entries,
            last_error,
        }
    }

    fn load_from_file(path: &Path) -> (Vec<QueuedCapture>, Option<QueueStorageError>) {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => (entries, None),
                Err(e) => {
                    let aside = corrupt_path(path);
                    if let Err(rename_err) = fs::rename(path, &aside) {
                        tracing::warn!(
                            "Could not move malformed queue file aside: {}",
                            rename_err
                        );
                    }
                    (Vec::new(), Some(QueueStorageError::Parse(e.to_string())))
                }
            },
            // No file yet: empty queue
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), None),
            Err(e) => (Vec::new(), Some(QueueStorageError::Read(e.to_string()))),
        }
    }

    /// Write via a temp file and rename, so a crash mid-write leaves the
    /// previous contents intact.
    fn save_to_file(&mut self) -> Result<(), QueueStorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        let json = serde_json::to_string_pretty(&self.entries).map_err(write_error)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(write_error)?;
        fs::rename(&tmp, &self.path).map_err(write_error)?;

        self.last_error = None;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_error(&self) -> Option<&QueueStorageError> {
        self.last_error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn entries(&self) -> &[QueuedCapture] {
        &self.entries
    }

    pub fn front(&self) -> Option<&QueuedCapture> {
        self.entries.first()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append and persist. On write failure nothing is kept in memory
    /// either.
    pub fn push(&mut self, capture: QueuedCapture) -> Result<(), QueueStorageError> {
        self.entries.push(capture);
        if let Err(e) = self.save_to_file() {
            self.entries.pop();
            self.last_error = Some(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Remove the oldest entry after it was delivered and persist.
    /// Rolled back if the write fails.
    pub fn remove_front(&mut self) -> Result<Option<QueuedCapture>, QueueStorageError> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let removed = self.entries.remove(0);
        if let Err(e) = self.save_to_file() {
            self.entries.insert(0, removed);
            self.last_error = Some(e.clone());
            return Err(e);
        }
        Ok(Some(removed))
    }
}

fn write_error(e: impl std::fmt::Display) -> QueueStorageError {
    QueueStorageError::Write(e.to_string())
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}
