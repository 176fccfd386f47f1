//! # Stage: File Transcript Store
//!
//! ## Responsibility
//! Keep one pretty-printed JSON array per session under a storage directory
//! (`<dir>/<session>.json`), appending an entry per completed exchange.
//!
//! ## Guarantees
//! - Appends within this process are serialized; no entry is lost to a
//!   read-modify-write race
//! - A file on disk is always a complete array: writes go to a temp file that
//!   is renamed over the original
//! - A missing file reads as an empty session
//! - A corrupt file is reported as an error and left untouched
//!
//! ## NOT Responsible For
//! - Coordination between several processes sharing one directory
//! - Retention or rotation

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StorageError;

use super::{session_key, TranscriptEntry, TranscriptStore};

#[derive(Debug)]
pub struct FileTranscriptStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTranscriptStore {
    /// Creates `dir` if it does not exist yet.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", session_key(session_id)))
    }

    fn load(path: &Path) -> Result<Vec<TranscriptEntry>, StorageError> {
        match fs::read(path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl TranscriptStore for FileTranscriptStore {
    fn append(&self, session_id: &str, entry: &TranscriptEntry) -> Result<(), StorageError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StorageError::Remote("transcript write lock poisoned".into()))?;

        let path = self.session_path(session_id);
        let mut entries = Self::load(&path)?;
        entries.push(entry.clone());

        let json = serde_json::to_vec_pretty(&entries)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, StorageError> {
        Self::load(&self.session_path(session_id))
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
