//! Explicit application context (C8 companion).
//!
//! Grounded on the REDESIGN FLAGS directive to replace ambient singleton
//! managers with a context object the caller constructs once and threads
//! through explicitly; `Context::open` is the one place that lays out
//! spec.md §6's `BASE_DIR` directory structure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::engine::StorageEngine;
use crate::error::{CoreError, Result};
use crate::wal::{FileJournal, JournalSink, NullJournal};

/// Owns the configuration, the directory layout, and the storage engine for
/// one `BASE_DIR`. Callers construct exactly one `Context` per database
/// directory and share it; there is no process-wide singleton.
pub struct Context {
    base_dir: PathBuf,
    config: Config,
    engine: StorageEngine,
}

impl Context {
    /// Lays out `BASE_DIR/{data/crates,data/indexes,wal,log,certs}` if
    /// absent, opens the journal per `config.wal_enabled`, and opens the
    /// storage engine over whatever crates/indexes already exist on disk.
    pub fn open(base_dir: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let base_dir = base_dir.into();
        for sub in ["data/crates", "data/indexes", "wal", "log", "certs"] {
            let path = base_dir.join(sub);
            std::fs::create_dir_all(&path).map_err(|e| CoreError::io(path.display().to_string(), e))?;
        }

        let journal: Arc<dyn JournalSink> = if config.wal_enabled {
            Arc::new(FileJournal::open(&base_dir.join("wal").join("crushdb.journal"))?)
        } else {
            Arc::new(NullJournal)
        };

        let engine = StorageEngine::open(&base_dir, config.clone(), journal)?;
        Ok(Self {
            base_dir,
            config,
            engine,
        })
    }

    /// Reads `BASE_DIR/crushdb.conf` if present, falling back to
    /// [`Config::default`], then calls [`Context::open`].
    pub fn open_with_conf_file(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let conf_path = base_dir.join("crushdb.conf");
        let config = if conf_path.exists() {
            let text = std::fs::read_to_string(&conf_path).map_err(|e| CoreError::io(conf_path.display().to_string(), e))?;
            Config::from_str(&text)?
        } else {
            Config::default()
        };
        Self::open(base_dir, config)
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    pub fn close(&self) -> Result<()> {
        self.engine.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypedValue;
    use tempfile::tempdir;

    #[test]
    fn open_lays_out_directory_structure() {
        let dir = tempdir().unwrap();
        let ctx = Context::open(dir.path(), Config::default()).unwrap();
        for sub in ["data/crates", "data/indexes", "wal", "log", "certs"] {
            assert!(dir.path().join(sub).is_dir(), "missing {sub}");
        }
        ctx.close().unwrap();
    }

    #[test]
    fn engine_survives_a_close_and_reopen() {
        let dir = tempdir().unwrap();
        let doc_id;
        {
            let ctx = Context::open(dir.path(), Config::default()).unwrap();
            ctx.engine().create_crate("notes").unwrap();
            let doc = ctx
                .engine()
                .insert("notes", vec![("text".to_string(), TypedValue::Str("hi".into()))])
                .unwrap();
            doc_id = doc.document_id();
            ctx.close().unwrap();
        }
        {
            let ctx = Context::open(dir.path(), Config::default()).unwrap();
            let found = ctx.engine().find("notes", doc_id).unwrap().unwrap();
            assert_eq!(found.get("text"), Some(&TypedValue::Str("hi".into())));
        }
    }
}
