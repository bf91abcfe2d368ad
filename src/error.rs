//! Error taxonomy for the paged storage engine and B+Tree index layer.

use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A document or record could not fit in the space available.
    #[error("page full: need {needed} bytes, {available} available")]
    PageFull { needed: usize, available: usize },

    /// A unique index already holds the inserted key.
    #[error("duplicate key on unique index {index_name:?} of crate {crate_name:?}")]
    DuplicateKey {
        crate_name: String,
        index_name: String,
    },

    /// A key's runtime type tag did not match the index's declared type.
    #[error("key type mismatch on index {index_name:?}: expected {expected}, got {actual}")]
    KeyTypeMismatch {
        index_name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A page's on-disk bytes failed an internal consistency check.
    #[error("corrupt page {page_id}: {reason}")]
    CorruptPage { page_id: u64, reason: String },

    /// I/O failure against the data file, metadata file, or index file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Bad configuration supplied at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation referenced a crate or index name that does not exist.
    #[error("index {index_name:?} not found for crate {crate_name:?}")]
    IndexNotFound {
        crate_name: String,
        index_name: String,
    },
}

impl CoreError {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
