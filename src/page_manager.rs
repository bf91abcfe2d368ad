//! Page allocation, caching, and persistence (C4).
//!
//! Grounded on the teacher's `pager::Pager`: an `lru::LruCache` fronting a
//! single data file, a small fixed-size metadata header, and a monotonic id
//! allocator (the teacher's page ids are also never drawn at random).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::page::{Page, PAGE_SIZE};

const META_MAGIC: u32 = 0x4352_5553; // "CRUS"
const META_VERSION: u8 = 1;
/// magic:u32 | version:u8 | last_page_id:u64 | reserved:u32, spec.md §4.2.
const META_SIZE: usize = 17;

#[derive(Debug, Clone, Copy, Default)]
pub struct PageManagerStats {
    pub pages_allocated: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub flushes: u64,
}

/// Owns the data file, the page cache, and the monotonic page-id allocator
/// for one crate's storage.
pub struct PageManager {
    data_path: PathBuf,
    meta_path: PathBuf,
    data_file: Mutex<File>,
    last_page_id: Mutex<u64>,
    cache: Mutex<LruCache<u64, Arc<RwLock<Page>>>>,
    auto_compress: bool,
    stats: Mutex<PageManagerStats>,
}

impl PageManager {
    /// Opens (creating if absent) the data and metadata files under
    /// `dir`, matching spec.md §6's `data/crushdb.db` + `data/meta.dat`
    /// layout for one crate.
    pub fn open(dir: &Path, config: &Config) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| CoreError::io(dir.display().to_string(), e))?;
        let data_path = dir.join("crushdb.db");
        let meta_path = dir.join("meta.dat");

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)
            .map_err(|e| CoreError::io(data_path.display().to_string(), e))?;

        let last_page_id = read_or_init_meta(&meta_path)?;

        let cache_capacity = config
            .cache_max_pages
            .or_else(|| {
                config
                    .cache_memory_limit_mb
                    .map(|mb| ((mb * 1024 * 1024) as usize / PAGE_SIZE).max(1))
            })
            .unwrap_or(256);
        let cache_capacity = std::num::NonZeroUsize::new(cache_capacity.max(1)).unwrap();

        let manager = Self {
            data_path,
            meta_path,
            data_file: Mutex::new(data_file),
            last_page_id: Mutex::new(last_page_id),
            cache: Mutex::new(LruCache::new(cache_capacity)),
            auto_compress: config.auto_compress_on_insert,
            stats: Mutex::new(PageManagerStats::default()),
        };

        if config.eager_load_pages {
            manager.warm_cache()?;
        }

        Ok(manager)
    }

    fn warm_cache(&self) -> Result<()> {
        let last = *self.last_page_id.lock();
        for page_id in 1..=last {
            if self.load_from_disk(page_id)?.is_some() {
                debug!(page_id, "eager-loaded page");
            }
        }
        Ok(())
    }

    /// Allocates a new, empty page with the next monotonic id.
    pub fn allocate(&self) -> Result<Arc<RwLock<Page>>> {
        let mut last = self.last_page_id.lock();
        *last += 1;
        let page_id = *last;
        write_meta(&self.meta_path, page_id)?;

        let page = Arc::new(RwLock::new(Page::new(page_id, self.auto_compress)));
        self.cache_insert(page_id, Arc::clone(&page))?;
        self.stats.lock().pages_allocated += 1;
        Ok(page)
    }

    /// Inserts a page into the LRU cache, flushing whatever it evicts to
    /// disk first if that page is dirty (spec.md §4.2's eviction contract).
    fn cache_insert(&self, page_id: u64, page: Arc<RwLock<Page>>) -> Result<()> {
        let evicted = self.cache.lock().push(page_id, page);
        if let Some((evicted_id, evicted_page)) = evicted {
            if evicted_id != page_id {
                let mut guard = evicted_page.write();
                if guard.is_dirty() {
                    self.flush_page(evicted_id, &guard)?;
                    guard.mark_clean();
                }
            }
        }
        Ok(())
    }

    /// Fetches a page by id, consulting the cache before the data file.
    pub fn get(&self, page_id: u64) -> Result<Arc<RwLock<Page>>> {
        if let Some(page) = self.cache.lock().get(&page_id) {
            self.stats.lock().cache_hits += 1;
            return Ok(Arc::clone(page));
        }
        self.stats.lock().cache_misses += 1;
        match self.load_from_disk(page_id)? {
            Some(page) => Ok(page),
            None => Err(CoreError::CorruptPage {
                page_id,
                reason: "page not present in data file".to_string(),
            }),
        }
    }

    fn load_from_disk(&self, page_id: u64) -> Result<Option<Arc<RwLock<Page>>>> {
        let mut file = self.data_file.lock();
        let offset = (page_id - 1) * PAGE_SIZE as u64;
        let file_len = file
            .metadata()
            .map_err(|e| CoreError::io(self.data_path.display().to_string(), e))?
            .len();
        if offset + PAGE_SIZE as u64 > file_len {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| CoreError::io(self.data_path.display().to_string(), e))?;
        let mut buf = [0u8; PAGE_SIZE];
        file.read_exact(&mut buf)
            .map_err(|e| CoreError::io(self.data_path.display().to_string(), e))?;
        drop(file);

        let page = Page::from_bytes(&buf)?;
        let page = Arc::new(RwLock::new(page));
        self.cache_insert(page_id, Arc::clone(&page))?;
        Ok(Some(page))
    }

    /// Returns the first page (by ascending id) with room for `needed`
    /// bytes, consulting only pages already in memory via the cache and
    /// falling back to a full scan of the data file if nothing fits.
    pub fn find_page_with_space(&self, needed: usize) -> Result<Option<Arc<RwLock<Page>>>> {
        let last = *self.last_page_id.lock();
        for page_id in 1..=last {
            let page = self.get(page_id)?;
            let fits = {
                let guard = page.read();
                !guard.is_full() && guard.available_space() >= needed
            };
            if fits {
                return Ok(Some(page));
            }
        }
        Ok(None)
    }

    /// Writes one page's current in-memory contents to the data file.
    pub fn flush_page(&self, page_id: u64, page: &Page) -> Result<()> {
        let mut file = self.data_file.lock();
        let offset = (page_id - 1) * PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| CoreError::io(self.data_path.display().to_string(), e))?;
        file.write_all(&page.to_bytes())
            .map_err(|e| CoreError::io(self.data_path.display().to_string(), e))?;
        self.stats.lock().flushes += 1;
        Ok(())
    }

    /// Flushes every cached dirty page.
    pub fn flush_all(&self) -> Result<()> {
        let entries: Vec<(u64, Arc<RwLock<Page>>)> = self
            .cache
            .lock()
            .iter()
            .map(|(&id, page)| (id, Arc::clone(page)))
            .collect();
        for (page_id, page) in entries {
            let mut guard = page.write();
            if guard.is_dirty() {
                self.flush_page(page_id, &guard)?;
                guard.mark_clean();
            }
        }
        self.data_file
            .lock()
            .flush()
            .map_err(|e| CoreError::io(self.data_path.display().to_string(), e))?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush_all()?;
        warn!(path = %self.data_path.display(), "page manager closed");
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> PageManagerStats {
        *self.stats.lock()
    }

    #[must_use]
    pub fn last_page_id(&self) -> u64 {
        *self.last_page_id.lock()
    }
}

fn read_or_init_meta(meta_path: &Path) -> Result<u64> {
    if !meta_path.exists() {
        write_meta(meta_path, 0)?;
        return Ok(0);
    }
    let mut file =
        File::open(meta_path).map_err(|e| CoreError::io(meta_path.display().to_string(), e))?;
    let mut buf = [0u8; META_SIZE];
    file.read_exact(&mut buf)
        .map_err(|e| CoreError::io(meta_path.display().to_string(), e))?;

    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let version = buf[4];
    let last_page_id = u64::from_be_bytes(buf[5..13].try_into().unwrap());
    if magic != META_MAGIC {
        return Err(CoreError::CorruptPage {
            page_id: 0,
            reason: format!("meta.dat magic mismatch: {magic:#x}"),
        });
    }
    if version != META_VERSION {
        return Err(CoreError::Config(format!(
            "unsupported meta.dat version {version}"
        )));
    }
    Ok(last_page_id)
}

fn write_meta(meta_path: &Path, last_page_id: u64) -> Result<()> {
    let mut buf = [0u8; META_SIZE];
    buf[0..4].copy_from_slice(&META_MAGIC.to_be_bytes());
    buf[4] = META_VERSION;
    buf[5..13].copy_from_slice(&last_page_id.to_be_bytes());
    buf[13..17].copy_from_slice(&0u32.to_be_bytes());
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(meta_path)
        .map_err(|e| CoreError::io(meta_path.display().to_string(), e))?;
    file.write_all(&buf)
        .map_err(|e| CoreError::io(meta_path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::value::TypedValue;
    use tempfile::tempdir;

    #[test]
    fn allocate_assigns_monotonic_ids() {
        let dir = tempdir().unwrap();
        let manager = PageManager::open(dir.path(), &Config::default()).unwrap();
        let p1 = manager.allocate().unwrap();
        let p2 = manager.allocate().unwrap();
        assert_eq!(p1.read().page_id(), 1);
        assert_eq!(p2.read().page_id(), 2);
    }

    #[test]
    fn flush_and_reopen_preserves_documents() {
        let dir = tempdir().unwrap();
        let page_id;
        {
            let manager = PageManager::open(dir.path(), &Config::default()).unwrap();
            let page = manager.allocate().unwrap();
            page_id = page.read().page_id();
            let mut doc = Document::new(1);
            doc.set("name", TypedValue::Str("hi".into()));
            let placed = page.write().insert(doc).unwrap();
            assert_eq!(placed.page_id(), page_id);
            manager.flush_all().unwrap();
        }
        {
            let manager = PageManager::open(dir.path(), &Config::default()).unwrap();
            assert_eq!(manager.last_page_id(), page_id);
            let page = manager.get(page_id).unwrap();
            let fetched = page.read().retrieve(1).unwrap().unwrap();
            assert_eq!(fetched.get("name"), Some(&TypedValue::Str("hi".into())));
        }
    }

    #[test]
    fn find_page_with_space_skips_full_pages() {
        let dir = tempdir().unwrap();
        let manager = PageManager::open(dir.path(), &Config::default()).unwrap();
        let first = manager.allocate().unwrap();
        {
            let mut guard = first.write();
            let mut big = Document::new(1);
            big.set("blob", TypedValue::Str("x".repeat(4000)));
            guard.insert(big).unwrap();
        }
        assert!(manager.find_page_with_space(500).unwrap().is_none());

        let second = manager.allocate().unwrap();
        let found = manager.find_page_with_space(500).unwrap().unwrap();
        assert_eq!(found.read().page_id(), second.read().page_id());
    }
}
