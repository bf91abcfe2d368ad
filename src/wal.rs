//! Write-ahead journal sink.
//!
//! The core only appends opaque records behind a single-writer mutex, per
//! spec.md §5's concurrency model; replay/recovery and the journal's wire
//! format belong to the external WAL-writer collaborator (spec.md Non-goals).
//! Grounded on the teacher's `acquire_lock` poisoned-mutex discipline in
//! `error.rs`, reused here for the journal's own lock.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{CoreError, Result};

/// A sink for opaque, already-serialized journal records.
pub trait JournalSink: Send + Sync {
    fn append(&self, record: &[u8]) -> Result<()>;
    fn sync(&self) -> Result<()>;
}

/// Discards every record. Used when `Config::wal_enabled` is `false`.
pub struct NullJournal;

impl JournalSink for NullJournal {
    fn append(&self, _record: &[u8]) -> Result<()> {
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Appends length-prefixed records to `wal/crushdb.journal` behind one mutex.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent.display().to_string(), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CoreError::io(path.display().to_string(), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl JournalSink for FileJournal {
    fn append(&self, record: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.write_all(&(record.len() as u32).to_be_bytes())
            .map_err(|e| CoreError::io(self.path.display().to_string(), e))?;
        file.write_all(record)
            .map_err(|e| CoreError::io(self.path.display().to_string(), e))
    }

    fn sync(&self) -> Result<()> {
        self.file
            .lock()
            .sync_data()
            .map_err(|e| CoreError::io(self.path.display().to_string(), e))
    }
}
