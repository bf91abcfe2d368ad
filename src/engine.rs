//! Storage engine façade (C8): the single entry point that ties pages,
//! indexes, and the journal together into crate-level CRUD operations.
//!
//! Grounded on the teacher's `storage::index::store::IndexStore`, which
//! composes a catalog with concrete backends behind one type; here the
//! façade additionally owns per-crate [`PageManager`]s and performs the
//! compensating rollback spec.md's insert/delete operations require on
//! partial failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, instrument};

use crate::btree::SortOrder;
use crate::config::Config;
use crate::document::Document;
use crate::error::{CoreError, Result};
use crate::index_manager::{IndexDef, IndexManager};
use crate::page::PAGE_SIZE;
use crate::page_manager::PageManager;
use crate::value::{TypedValue, TAG_I64};
use crate::wal::JournalSink;

/// Name and backing field of the index every crate is created with.
pub const ID_INDEX_NAME: &str = "_id";
const ID_INDEX_ORDER: usize = 3;

pub struct StorageEngine {
    base_dir: PathBuf,
    config: Config,
    pages: RwLock<HashMap<String, PageManager>>,
    indexes: RwLock<IndexManager>,
    journal: Arc<dyn JournalSink>,
    next_doc_id: Mutex<HashMap<String, u64>>,
}

impl StorageEngine {
    pub fn open(base_dir: impl Into<PathBuf>, config: Config, journal: Arc<dyn JournalSink>) -> Result<Self> {
        let base_dir = base_dir.into();
        let crates_dir = base_dir.join("data").join("crates");
        let indexes_dir = base_dir.join("data").join("indexes");
        std::fs::create_dir_all(&crates_dir).map_err(|e| CoreError::io(crates_dir.display().to_string(), e))?;
        std::fs::create_dir_all(&indexes_dir).map_err(|e| CoreError::io(indexes_dir.display().to_string(), e))?;

        let mut indexes = IndexManager::new();
        indexes.load_all(&indexes_dir)?;

        let mut pages = HashMap::new();
        let mut next_doc_id = HashMap::new();
        if crates_dir.exists() {
            for entry in std::fs::read_dir(&crates_dir).map_err(|e| CoreError::io(crates_dir.display().to_string(), e))? {
                let entry = entry.map_err(|e| CoreError::io(crates_dir.display().to_string(), e))?;
                let Some(name) = crate_name_from_path(&entry.path()) else {
                    continue;
                };
                let manager = PageManager::open(&entry.path(), &config)?;
                pages.insert(name.clone(), manager);
                next_doc_id.insert(name, 0);
            }
        }

        let engine = Self {
            base_dir,
            config,
            pages: RwLock::new(pages),
            indexes: RwLock::new(indexes),
            journal,
            next_doc_id: Mutex::new(next_doc_id),
        };
        engine.recover_next_doc_ids()?;
        Ok(engine)
    }

    fn recover_next_doc_ids(&self) -> Result<()> {
        let indexes = self.indexes.read();
        let mut next_ids = self.next_doc_id.lock();
        for crate_name in next_ids.keys().cloned().collect::<Vec<_>>() {
            if let Ok(id_index) = indexes.get(&crate_name, ID_INDEX_NAME) {
                let max_id = id_index
                    .range_find(None, None)
                    .into_iter()
                    .filter_map(|(k, _)| match k {
                        TypedValue::I64(v) => Some(v as u64),
                        _ => None,
                    })
                    .max()
                    .unwrap_or(0);
                next_ids.insert(crate_name, max_id + 1);
            }
        }
        Ok(())
    }

    fn crates_dir(&self) -> PathBuf {
        self.base_dir.join("data").join("crates")
    }

    fn indexes_dir(&self) -> PathBuf {
        self.base_dir.join("data").join("indexes")
    }

    #[instrument(skip(self))]
    pub fn create_crate(&self, name: &str) -> Result<()> {
        {
            let pages = self.pages.read();
            if pages.contains_key(name) {
                return Ok(());
            }
        }
        let dir = self.crates_dir().join(format!("{name}.crate"));
        let manager = PageManager::open(&dir, &self.config)?;
        self.pages.write().insert(name.to_string(), manager);
        self.next_doc_id.lock().insert(name.to_string(), 1);

        self.indexes.write().create_index(IndexDef {
            crate_name: name.to_string(),
            index_name: ID_INDEX_NAME.to_string(),
            field_name: crate::document::ID_FIELD.to_string(),
            type_tag: TAG_I64,
            unique: true,
            sort_order: SortOrder::Asc,
            order: ID_INDEX_ORDER,
        })?;
        info!(crate_name = name, "crate created");
        Ok(())
    }

    pub fn create_index(
        &self,
        crate_name: &str,
        index_name: &str,
        field_name: &str,
        type_tag: u8,
        unique: bool,
        sort_order: SortOrder,
        order: usize,
    ) -> Result<()> {
        self.require_crate(crate_name)?;
        self.indexes.write().create_index(IndexDef {
            crate_name: crate_name.to_string(),
            index_name: index_name.to_string(),
            field_name: field_name.to_string(),
            type_tag,
            unique,
            sort_order,
            order,
        })
    }

    fn require_crate(&self, crate_name: &str) -> Result<()> {
        if self.pages.read().contains_key(crate_name) {
            Ok(())
        } else {
            Err(CoreError::IndexNotFound {
                crate_name: crate_name.to_string(),
                index_name: ID_INDEX_NAME.to_string(),
            })
        }
    }

    /// Assigns the next `_id`, places the document on a page with room (or a
    /// fresh one), and populates every index defined on the crate. Rolls
    /// back the page insert and any index entries already written if a
    /// later index insert fails.
    #[instrument(skip(self, fields))]
    pub fn insert(&self, crate_name: &str, fields: Vec<(String, TypedValue)>) -> Result<Document> {
        let doc_id = {
            let mut next_ids = self.next_doc_id.lock();
            let entry = next_ids
                .get_mut(crate_name)
                .ok_or_else(|| CoreError::IndexNotFound {
                    crate_name: crate_name.to_string(),
                    index_name: ID_INDEX_NAME.to_string(),
                })?;
            let id = *entry;
            *entry += 1;
            id
        };
        self.insert_with_id(crate_name, doc_id, fields)
    }

    fn insert_with_id(&self, crate_name: &str, doc_id: u64, fields: Vec<(String, TypedValue)>) -> Result<Document> {
        let mut doc = Document::new(doc_id);
        for (key, value) in fields {
            doc.set(key, value);
        }

        self.journal.append(&journal_record(b'I', crate_name, doc_id))?;
        let placed = self.place_on_page(crate_name, doc)?;

        let rollback = |engine: &Self, placed: &Document, written: &[(String, String, TypedValue)]| {
            for (crate_name, index_name, key) in written {
                let _ = engine.indexes.write().remove(crate_name, index_name, key, None);
            }
            if let Some(manager) = engine.pages.read().get(crate_name) {
                if let Ok(page) = manager.get(placed.page_id()) {
                    let _ = page.write().delete(placed.document_id());
                }
            }
        };

        let mut written = Vec::new();
        {
            let mut indexes = self.indexes.write();
            if let Err(e) = indexes.insert(crate_name, ID_INDEX_NAME, TypedValue::I64(doc_id as i64), (placed.page_id(), doc_id)) {
                drop(indexes);
                rollback(self, &placed, &written);
                return Err(e);
            }
            written.push((crate_name.to_string(), ID_INDEX_NAME.to_string(), TypedValue::I64(doc_id as i64)));

            let secondary: Vec<(String, String)> = indexes
                .indexes_for_crate(crate_name)
                .filter(|idx| idx.def.index_name != ID_INDEX_NAME)
                .map(|idx| (idx.def.index_name.clone(), idx.def.field_name.clone()))
                .collect();

            for (index_name, field_name) in secondary {
                let Some(value) = placed.get(&field_name) else {
                    continue;
                };
                if let Err(e) = indexes.insert(crate_name, &index_name, value.clone(), (placed.page_id(), doc_id)) {
                    drop(indexes);
                    rollback(self, &placed, &written);
                    return Err(e);
                }
                written.push((crate_name.to_string(), index_name, value.clone()));
            }
        }

        Ok(placed)
    }

    fn place_on_page(&self, crate_name: &str, doc: Document) -> Result<Document> {
        let pages = self.pages.read();
        let manager = pages.get(crate_name).ok_or_else(|| CoreError::IndexNotFound {
            crate_name: crate_name.to_string(),
            index_name: ID_INDEX_NAME.to_string(),
        })?;

        let needed = doc.encode_fields().len() + 25;
        let needed = needed.min(PAGE_SIZE);
        let page = match manager.find_page_with_space(needed)? {
            Some(page) => page,
            None => manager.allocate()?,
        };
        page.write().insert(doc)
    }

    /// Finds a document by `_id`.
    pub fn find(&self, crate_name: &str, doc_id: u64) -> Result<Option<Document>> {
        let locations = {
            let indexes = self.indexes.read();
            indexes.find(crate_name, ID_INDEX_NAME, &TypedValue::I64(doc_id as i64))?
        };
        let Some(&(page_id, _)) = locations.first() else {
            return Ok(None);
        };
        self.retrieve_from(crate_name, page_id, doc_id)
    }

    /// Finds every document whose indexed field equals `key` on `index_name`.
    /// Skips and logs any reference whose document is tombstoned or whose
    /// page fails verification rather than aborting the whole query.
    pub fn find_by_index(&self, crate_name: &str, index_name: &str, key: &TypedValue) -> Result<Vec<Document>> {
        let locations = {
            let indexes = self.indexes.read();
            indexes.find(crate_name, index_name, key)?
        };
        let mut out = Vec::with_capacity(locations.len());
        for (page_id, doc_id) in locations {
            match self.retrieve_from(crate_name, page_id, doc_id) {
                Ok(Some(doc)) => out.push(doc),
                Ok(None) => {}
                Err(e) => error!(crate_name, doc_id, error = %e, "skipping unreadable document during indexed find"),
            }
        }
        Ok(out)
    }

    /// Range scan over a secondary index, returned in the index's own order.
    /// Skips and logs any reference whose document is tombstoned or whose
    /// page fails verification rather than aborting the whole query.
    pub fn range_find(
        &self,
        crate_name: &str,
        index_name: &str,
        lo: Option<&TypedValue>,
        hi: Option<&TypedValue>,
    ) -> Result<Vec<Document>> {
        let matches = {
            let indexes = self.indexes.read();
            indexes.range_find(crate_name, index_name, lo, hi)?
        };
        let mut out = Vec::with_capacity(matches.len());
        for (_, (page_id, doc_id)) in matches {
            match self.retrieve_from(crate_name, page_id, doc_id) {
                Ok(Some(doc)) => out.push(doc),
                Ok(None) => {}
                Err(e) => error!(crate_name, doc_id, error = %e, "skipping unreadable document during range find"),
            }
        }
        Ok(out)
    }

    /// Every live document in a crate, in ascending `_id` order, skipping
    /// any reference a tombstone or corrupt page makes unreachable.
    pub fn scan(&self, crate_name: &str) -> Result<Vec<Document>> {
        let locations = {
            let indexes = self.indexes.read();
            indexes.range_find(crate_name, ID_INDEX_NAME, None, None)?
        };
        let mut out = Vec::with_capacity(locations.len());
        for (_, (page_id, doc_id)) in locations {
            match self.retrieve_from(crate_name, page_id, doc_id) {
                Ok(Some(doc)) => out.push(doc),
                Ok(None) => {}
                Err(e) => error!(crate_name, doc_id, error = %e, "skipping unreadable document during scan"),
            }
        }
        Ok(out)
    }

    fn retrieve_from(&self, crate_name: &str, page_id: u64, doc_id: u64) -> Result<Option<Document>> {
        let pages = self.pages.read();
        let manager = pages.get(crate_name).ok_or_else(|| CoreError::IndexNotFound {
            crate_name: crate_name.to_string(),
            index_name: ID_INDEX_NAME.to_string(),
        })?;
        let page = manager.get(page_id)?;
        page.read().retrieve(doc_id)
    }

    /// Tombstones the document's page record and removes every index entry
    /// keyed off its field values.
    pub fn delete(&self, crate_name: &str, doc_id: u64) -> Result<bool> {
        let Some(doc) = self.find(crate_name, doc_id)? else {
            return Ok(false);
        };

        self.journal.append(&journal_record(b'D', crate_name, doc_id))?;
        {
            let pages = self.pages.read();
            let manager = pages.get(crate_name).ok_or_else(|| CoreError::IndexNotFound {
                crate_name: crate_name.to_string(),
                index_name: ID_INDEX_NAME.to_string(),
            })?;
            let page = manager.get(doc.page_id())?;
            page.write().delete(doc_id)?;
        }

        let mut indexes = self.indexes.write();
        indexes.remove(crate_name, ID_INDEX_NAME, &TypedValue::I64(doc_id as i64), None)?;
        let secondary: Vec<(String, String)> = indexes
            .indexes_for_crate(crate_name)
            .filter(|idx| idx.def.index_name != ID_INDEX_NAME)
            .map(|idx| (idx.def.index_name.clone(), idx.def.field_name.clone()))
            .collect();
        for (index_name, field_name) in secondary {
            if let Some(value) = doc.get(&field_name) {
                let _ = indexes.remove(crate_name, &index_name, value, Some(&(doc.page_id(), doc_id)));
            }
        }
        Ok(true)
    }

    /// Replaces a document's fields in place: a delete followed by a
    /// re-insert under the same `_id`, per spec.md's update semantics.
    pub fn update(&self, crate_name: &str, doc_id: u64, fields: Vec<(String, TypedValue)>) -> Result<Option<Document>> {
        if !self.delete(crate_name, doc_id)? {
            return Ok(None);
        }
        self.insert_with_id(crate_name, doc_id, fields).map(Some)
    }

    pub fn journal(&self) -> &Arc<dyn JournalSink> {
        &self.journal
    }

    /// Flushes every crate's dirty pages and persists every index to disk.
    pub fn close(&self) -> Result<()> {
        for manager in self.pages.read().values() {
            manager.flush_all()?;
        }
        self.indexes.read().persist_all(&self.indexes_dir())?;
        self.journal.sync()?;
        Ok(())
    }
}

/// A minimal opaque record logged before a mutation commits: `op | crate_name
/// | doc_id`. Replay is the external WAL subsystem's job (spec.md Non-goals);
/// the core only guarantees the record lands before the mutation it guards.
fn journal_record(op: u8, crate_name: &str, doc_id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 2 + crate_name.len() + 8);
    buf.push(op);
    buf.extend_from_slice(&(crate_name.len() as u16).to_be_bytes());
    buf.extend_from_slice(crate_name.as_bytes());
    buf.extend_from_slice(&doc_id.to_be_bytes());
    buf
}

fn crate_name_from_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("crate") {
        return None;
    }
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}
