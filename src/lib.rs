//! CrushDB's embedded paged storage engine and B+Tree index layer.
//!
//! This crate owns the on-disk page format, the page cache, the B+Tree
//! index structure, and the [`engine::StorageEngine`] façade that ties them
//! together into crate-scoped document CRUD. It does not include a query
//! planner, network server, CLI, or WAL replay logic — those are separate
//! collaborators built against this crate's public API.
//!
//! Start with [`context::Context::open`].

pub mod btree;
pub mod config;
pub mod context;
pub mod document;
pub mod engine;
pub mod error;
pub mod index_manager;
pub mod logging;
pub mod page;
pub mod page_manager;
pub mod value;
pub mod wal;

pub use context::Context;
pub use document::Document;
pub use engine::StorageEngine;
pub use error::{CoreError, Result};
pub use value::TypedValue;
