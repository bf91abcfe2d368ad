//! Fixed-size page layout (C3): header, document region, tombstones,
//! compaction, and splitting.
//!
//! Grounded on the teacher's `storage::btree::page` module for the discipline
//! of "parse a byte slice into a typed header, validate invariants, return
//! `Result`" — adapted here from a fence/slot B+Tree page to the flat
//! document-record layout spec.md §3/§4.1 describes.

use std::collections::{HashMap, HashSet};

use crate::document::Document;
use crate::error::{CoreError, Result};

/// Total on-disk page size, fixed per spec.md §3.
pub const PAGE_SIZE: usize = 4096;

/// Persisted header: `page_id | available_space | next | prev | is_full |
/// is_compressed | compressed_page_size` (32 bytes, spec.md §3) plus a
/// `record_count` (4 bytes) and a trailing CRC32 checksum (4 bytes) —
/// ambient integrity hardening in the teacher's own style (`pager::mod`
/// checksums every page with `crc32fast`), still inside the "up to 128
/// permitted" header budget. `record_count` gives [`Page::from_bytes`] an
/// exact number of records to walk instead of relying on an end-of-region
/// heuristic, which would collide with a legitimate all-zero tombstoned
/// record for `document_id == 0`.
pub const HEADER_SIZE: usize = 40;

/// `docId | pageId | dcs | cs | flag`, spec.md §3/§4.1.
pub const RECORD_HEADER_SIZE: usize = 25;

const FLAG_INACTIVE: u8 = 0;
const FLAG_ACTIVE: u8 = 1;

const NONE_SIBLING: u64 = u64::MAX;

fn encode_sibling(sibling: Option<u64>) -> u64 {
    sibling.unwrap_or(NONE_SIBLING)
}

fn decode_sibling(raw: u64) -> Option<u64> {
    if raw == NONE_SIBLING {
        None
    } else {
        Some(raw)
    }
}

/// A record's 25-byte header, decoded from the byte region at some offset.
#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    doc_id: u64,
    page_id: u64,
    dcs: u32,
    cs: u32,
    flag: u8,
}

impl RecordHeader {
    fn body_len(&self) -> usize {
        if self.cs > 0 {
            self.cs as usize
        } else {
            self.dcs as usize
        }
    }

    fn total_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.body_len()
    }
}

fn parse_record_header(bytes: &[u8], at: usize) -> Result<RecordHeader> {
    let slice = bytes
        .get(at..at + RECORD_HEADER_SIZE)
        .ok_or_else(|| corrupt(0, "record header truncated"))?;
    Ok(RecordHeader {
        doc_id: u64::from_be_bytes(slice[0..8].try_into().unwrap()),
        page_id: u64::from_be_bytes(slice[8..16].try_into().unwrap()),
        dcs: u32::from_be_bytes(slice[16..20].try_into().unwrap()),
        cs: u32::from_be_bytes(slice[20..24].try_into().unwrap()),
        flag: slice[24],
    })
}

fn write_record_header(buf: &mut [u8], at: usize, header: &RecordHeader) {
    buf[at..at + 8].copy_from_slice(&header.doc_id.to_be_bytes());
    buf[at + 8..at + 16].copy_from_slice(&header.page_id.to_be_bytes());
    buf[at + 16..at + 20].copy_from_slice(&header.dcs.to_be_bytes());
    buf[at + 20..at + 24].copy_from_slice(&header.cs.to_be_bytes());
    buf[at + 24] = header.flag;
}

fn corrupt(page_id: u64, reason: &str) -> CoreError {
    CoreError::CorruptPage {
        page_id,
        reason: reason.to_string(),
    }
}

/// A fixed-size 4096-byte document page.
#[derive(Debug, Clone)]
pub struct Page {
    page_id: u64,
    next: Option<u64>,
    prev: Option<u64>,
    is_full: bool,
    /// Captured once at page creation; never toggled per-record (spec.md §9).
    auto_compress: bool,
    buf: Vec<u8>,
    /// Byte offset of the first free byte in the document region.
    cursor: usize,
    offsets: HashMap<u64, usize>,
    deleted_doc_ids: HashSet<u64>,
    document_count: usize,
    dirty: bool,
}

impl Page {
    #[must_use]
    pub fn new(page_id: u64, auto_compress: bool) -> Self {
        Self {
            page_id,
            next: None,
            prev: None,
            is_full: false,
            auto_compress,
            buf: vec![0u8; PAGE_SIZE],
            cursor: HEADER_SIZE,
            offsets: HashMap::new(),
            deleted_doc_ids: HashSet::new(),
            document_count: 0,
            dirty: true,
        }
    }

    #[must_use]
    pub fn page_id(&self) -> u64 {
        self.page_id
    }

    #[must_use]
    pub fn next(&self) -> Option<u64> {
        self.next
    }

    #[must_use]
    pub fn prev(&self) -> Option<u64> {
        self.prev
    }

    pub fn set_next(&mut self, next: Option<u64>) {
        self.next = next;
        self.dirty = true;
    }

    pub fn set_prev(&mut self, prev: Option<u64>) {
        self.prev = prev;
        self.dirty = true;
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.is_full
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    #[must_use]
    pub fn document_count(&self) -> usize {
        self.document_count
    }

    #[must_use]
    pub fn available_space(&self) -> usize {
        PAGE_SIZE - self.cursor
    }

    #[must_use]
    pub fn deleted_doc_ids(&self) -> &HashSet<u64> {
        &self.deleted_doc_ids
    }

    /// Places `doc` on this page, returning the same document with
    /// `page_id`/`offset`/`decompressed_size`/`compressed_size` populated.
    pub fn insert(&mut self, mut doc: Document) -> Result<Document> {
        let decoded = doc.encode_fields();
        let dcs = decoded.len() as u32;
        let (body, cs) = if self.auto_compress {
            let compressed = lz4::block::compress(&decoded, None, false)
                .map_err(|e| corrupt(self.page_id, &format!("lz4 compress failed: {e}")))?;
            let cs = compressed.len() as u32;
            (compressed, cs)
        } else {
            (decoded, 0u32)
        };

        let total = RECORD_HEADER_SIZE + body.len();
        if self.cursor + total > PAGE_SIZE {
            return Err(CoreError::PageFull {
                needed: total,
                available: self.available_space(),
            });
        }

        let offset = self.cursor;
        let header = RecordHeader {
            doc_id: doc.document_id(),
            page_id: self.page_id,
            dcs,
            cs,
            flag: FLAG_ACTIVE,
        };
        write_record_header(&mut self.buf, offset, &header);
        self.buf[offset + RECORD_HEADER_SIZE..offset + total].copy_from_slice(&body);

        self.offsets.insert(doc.document_id(), offset);
        self.cursor += total;
        self.document_count += 1;
        self.dirty = true;
        if self.available_space() < RECORD_HEADER_SIZE {
            self.is_full = true;
        }

        doc.mark_placed(self.page_id, offset as u32, dcs, cs);
        Ok(doc)
    }

    /// Returns `None` if `doc_id` is unknown or tombstoned.
    pub fn retrieve(&self, doc_id: u64) -> Result<Option<Document>> {
        if self.deleted_doc_ids.contains(&doc_id) {
            return Ok(None);
        }
        let Some(&offset) = self.offsets.get(&doc_id) else {
            return Ok(None);
        };
        let header = parse_record_header(&self.buf, offset)?;
        if header.doc_id != doc_id {
            return Err(corrupt(self.page_id, "offset table points at mismatched docId"));
        }
        if header.flag != FLAG_ACTIVE {
            return Ok(None);
        }
        let body_start = offset + RECORD_HEADER_SIZE;
        let body_end = body_start + header.body_len();
        let body = self
            .buf
            .get(body_start..body_end)
            .ok_or_else(|| corrupt(self.page_id, "record body truncated"))?;

        let field_bytes = if header.cs > 0 {
            let decompressed = lz4::block::decompress(body, Some(header.dcs as i32))
                .map_err(|e| corrupt(self.page_id, &format!("lz4 decompress failed: {e}")))?;
            if decompressed.len() as u32 != header.dcs {
                return Err(corrupt(self.page_id, "decompressed length disagreement"));
            }
            decompressed
        } else {
            body.to_vec()
        };

        let fields = Document::decode_fields(&field_bytes)?;
        Ok(Some(Document::from_parts(
            header.doc_id,
            header.page_id,
            offset as u32,
            header.dcs,
            header.cs,
            fields,
        )))
    }

    /// Flips the record's active flag to INACTIVE in place. Returns `Ok(false)`
    /// if `doc_id` is unknown on this page (not an error), `Ok(true)` on a
    /// verified tombstone, and `Err` if the flip could not be verified.
    pub fn delete(&mut self, doc_id: u64) -> Result<bool> {
        let Some(&offset) = self.offsets.get(&doc_id) else {
            return Ok(false);
        };
        let flag_offset = offset + 24;
        self.buf[flag_offset] = FLAG_INACTIVE;
        if self.buf[flag_offset] != FLAG_INACTIVE {
            // Unreachable on a plain Vec<u8>, but mirrors spec.md's "verify by
            // re-reading" contract in case the backing store ever becomes
            // something less trustworthy than in-process memory.
            return Err(corrupt(self.page_id, "tombstone flip did not persist"));
        }
        self.deleted_doc_ids.insert(doc_id);
        self.document_count -= 1;
        self.dirty = true;
        Ok(true)
    }

    /// Rewrites the page to contain only ACTIVE records, reclaiming the
    /// space occupied by tombstones.
    pub fn compact(&mut self) -> Result<()> {
        let mut entries: Vec<(u64, usize)> = self
            .offsets
            .iter()
            .map(|(&doc_id, &offset)| (doc_id, offset))
            .collect();
        entries.sort_by_key(|&(_, offset)| offset);

        let mut new_buf = vec![0u8; PAGE_SIZE];
        let mut cursor = HEADER_SIZE;
        let mut new_offsets = HashMap::with_capacity(entries.len());

        for (doc_id, offset) in entries {
            if self.deleted_doc_ids.contains(&doc_id) {
                continue;
            }
            let header = parse_record_header(&self.buf, offset)?;
            let total = header.total_len();
            new_buf[cursor..cursor + total].copy_from_slice(&self.buf[offset..offset + total]);
            new_offsets.insert(doc_id, cursor);
            cursor += total;
        }

        self.buf = new_buf;
        self.cursor = cursor;
        self.offsets = new_offsets;
        self.document_count = self.offsets.len();
        self.deleted_doc_ids.clear();
        self.is_full = self.available_space() < RECORD_HEADER_SIZE;
        self.dirty = true;
        Ok(())
    }

    /// Compacts, then moves the upper half (`ceil(n/2)`) of active documents
    /// into a freshly allocated page whose id is supplied by the caller's
    /// allocator (never drawn from a random integer, per spec.md §4.1).
    ///
    /// The caller is responsible for wiring the returned page into the page
    /// manager and for fixing up the old `self.next` page's `prev` pointer,
    /// since `Page` has no visibility into sibling pages.
    pub fn split(&mut self, new_page_id: u64) -> Result<Page> {
        self.compact()?;

        let mut entries: Vec<(u64, usize)> = self
            .offsets
            .iter()
            .map(|(&doc_id, &offset)| (doc_id, offset))
            .collect();
        entries.sort_by_key(|&(_, offset)| offset);

        let total = entries.len();
        let num_right = total.div_ceil(2);
        let num_left = total - num_right;
        let split_byte = if num_left < total {
            entries[num_left].1
        } else {
            self.cursor
        };

        let mut new_page = Page::new(new_page_id, self.auto_compress);
        new_page.cursor = HEADER_SIZE;
        let tail = self.buf[split_byte..self.cursor].to_vec();
        let mut rel = 0usize;
        while rel < tail.len() {
            let mut header = parse_record_header(&tail, rel)?;
            let total_len = header.total_len();
            header.page_id = new_page_id;
            let dest = new_page.cursor;
            write_record_header(&mut new_page.buf, dest, &header);
            let body_start = rel + RECORD_HEADER_SIZE;
            let body_end = body_start + header.body_len();
            new_page.buf[dest + RECORD_HEADER_SIZE..dest + total_len]
                .copy_from_slice(&tail[body_start..body_end]);
            new_page.offsets.insert(header.doc_id, dest);
            new_page.cursor += total_len;
            rel += total_len;
        }
        new_page.document_count = new_page.offsets.len();
        new_page.is_full = new_page.available_space() < RECORD_HEADER_SIZE;

        for (doc_id, offset) in entries.into_iter().skip(num_left) {
            self.offsets.remove(&doc_id);
            let _ = offset;
        }
        self.cursor = split_byte;
        self.document_count = self.offsets.len();
        self.is_full = self.available_space() < RECORD_HEADER_SIZE;

        new_page.next = self.next;
        new_page.prev = Some(self.page_id);
        self.next = Some(new_page_id);

        self.dirty = true;
        new_page.dirty = true;
        Ok(new_page)
    }

    /// CRC32 over the header (checksum field excluded) and used document
    /// region, matching the teacher's `crc32fast`-based page integrity check.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.buf[0..HEADER_SIZE - 4]);
        hasher.update(&self.buf[HEADER_SIZE..self.cursor]);
        hasher.finalize()
    }

    /// Serializes the page to its exact 4096-byte on-disk frame.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PAGE_SIZE] {
        let mut out = self.buf.clone();
        out[0..8].copy_from_slice(&self.page_id.to_be_bytes());
        out[8..10].copy_from_slice(&(self.available_space() as u16).to_be_bytes());
        out[10..18].copy_from_slice(&encode_sibling(self.next).to_be_bytes());
        out[18..26].copy_from_slice(&encode_sibling(self.prev).to_be_bytes());
        out[26] = u8::from(self.is_full);
        out[27] = u8::from(self.auto_compress);
        out[28..32].copy_from_slice(&0u32.to_be_bytes());
        out[32..36].copy_from_slice(&(self.offsets.len() as u32).to_be_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&out[0..HEADER_SIZE - 4]);
        hasher.update(&out[HEADER_SIZE..self.cursor]);
        let checksum = hasher.finalize();
        out[HEADER_SIZE - 4..HEADER_SIZE].copy_from_slice(&checksum.to_be_bytes());
        out.try_into().expect("buffer is exactly PAGE_SIZE bytes")
    }

    /// Parses a 4096-byte frame back into a [`Page`], rebuilding the
    /// in-memory offset table and tombstone set by walking the document
    /// region for exactly `record_count` records (the persisted count, not
    /// an end-of-region sentinel — an all-zero record is a legitimate
    /// tombstoned document with id 0 and would be indistinguishable from
    /// "no more records"). Returns [`CoreError::CorruptPage`] on checksum
    /// mismatch or a malformed record stream.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(corrupt(0, "page frame is not PAGE_SIZE bytes"));
        }
        let page_id = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let next = decode_sibling(u64::from_be_bytes(bytes[10..18].try_into().unwrap()));
        let prev = decode_sibling(u64::from_be_bytes(bytes[18..26].try_into().unwrap()));
        let is_full = bytes[26] != 0;
        let auto_compress = bytes[27] != 0;
        let record_count = u32::from_be_bytes(bytes[32..36].try_into().unwrap());
        let stored_checksum = u32::from_be_bytes(bytes[HEADER_SIZE - 4..HEADER_SIZE].try_into().unwrap());

        let mut page = Page {
            page_id,
            next,
            prev,
            is_full,
            auto_compress,
            buf: bytes.to_vec(),
            cursor: HEADER_SIZE,
            offsets: HashMap::new(),
            deleted_doc_ids: HashSet::new(),
            document_count: 0,
            dirty: false,
        };

        let mut cursor = HEADER_SIZE;
        for _ in 0..record_count {
            let header = parse_record_header(&page.buf, cursor)?;
            let total = header.total_len();
            if cursor + total > PAGE_SIZE {
                return Err(corrupt(page_id, "record overruns page bounds"));
            }
            page.offsets.insert(header.doc_id, cursor);
            if header.flag != FLAG_ACTIVE {
                page.deleted_doc_ids.insert(header.doc_id);
            } else {
                page.document_count += 1;
            }
            cursor += total;
        }
        page.cursor = cursor;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page.buf[0..HEADER_SIZE - 4]);
        hasher.update(&page.buf[HEADER_SIZE..page.cursor]);
        if hasher.finalize() != stored_checksum {
            return Err(corrupt(page_id, "checksum mismatch"));
        }

        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypedValue;

    fn sample_doc(id: u64) -> Document {
        let mut doc = Document::new(id);
        doc.set("make", TypedValue::Str("Subaru".into()));
        doc.set("year", TypedValue::I32(2017));
        doc
    }

    #[test]
    fn round_trip_insert_retrieve() {
        let mut page = Page::new(1, false);
        let placed = page.insert(sample_doc(42)).unwrap();
        assert_eq!(placed.page_id(), 1);

        let fetched = page.retrieve(42).unwrap().unwrap();
        assert_eq!(fetched.document_id(), 42);
        assert_eq!(fetched.page_id(), 1);
        assert_eq!(fetched.offset(), placed.offset());
    }

    #[test]
    fn compressed_round_trip() {
        let mut page = Page::new(1, true);
        page.insert(sample_doc(1)).unwrap();
        let fetched = page.retrieve(1).unwrap().unwrap();
        assert_eq!(fetched.get("make"), sample_doc(1).get("make"));
    }

    #[test]
    fn tombstone_hides_document_until_compaction() {
        let mut page = Page::new(1, false);
        page.insert(sample_doc(1)).unwrap();
        assert!(page.delete(1).unwrap());
        assert!(page.retrieve(1).unwrap().is_none());
        assert!(page.deleted_doc_ids().contains(&1));

        page.compact().unwrap();
        assert!(page.deleted_doc_ids().is_empty());
        assert!(page.retrieve(1).unwrap().is_none());
    }

    #[test]
    fn compaction_preserves_active_contents_and_frees_space() {
        let mut page = Page::new(1, false);
        page.insert(sample_doc(1)).unwrap();
        page.insert(sample_doc(2)).unwrap();
        page.insert(sample_doc(3)).unwrap();
        page.delete(2).unwrap();

        let before = page.available_space();
        page.compact().unwrap();
        let after = page.available_space();
        assert!(after > before);

        assert!(page.retrieve(1).unwrap().is_some());
        assert!(page.retrieve(2).unwrap().is_none());
        assert!(page.retrieve(3).unwrap().is_some());
    }

    #[test]
    fn split_divides_documents_and_wires_siblings() {
        let mut page = Page::new(1, false);
        for id in 1..=5u64 {
            page.insert(sample_doc(id)).unwrap();
        }
        let right = page.split(2).unwrap();

        assert_eq!(page.document_count() + right.document_count(), 5);
        assert_eq!(right.document_count(), 3); // ceil(5/2)
        assert_eq!(page.document_count(), 2);
        assert_eq!(page.next(), Some(2));
        assert_eq!(right.prev(), Some(1));

        for id in 1..=2u64 {
            assert!(page.retrieve(id).unwrap().is_some());
        }
        for id in 3..=5u64 {
            assert!(right.retrieve(id).unwrap().is_some());
            assert_eq!(right.retrieve(id).unwrap().unwrap().page_id(), 2);
        }
    }

    #[test]
    fn page_full_on_oversized_insert() {
        let mut page = Page::new(1, false);
        let mut big = Document::new(1);
        big.set("blob", TypedValue::Str("x".repeat(PAGE_SIZE)));
        let err = page.insert(big).unwrap_err();
        assert!(matches!(err, CoreError::PageFull { .. }));
    }

    #[test]
    fn bytes_round_trip_through_from_bytes() {
        let mut page = Page::new(7, false);
        page.insert(sample_doc(1)).unwrap();
        page.insert(sample_doc(2)).unwrap();
        page.delete(1).unwrap();
        page.set_next(Some(9));

        let bytes = page.to_bytes();
        let reloaded = Page::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded.page_id(), 7);
        assert_eq!(reloaded.next(), Some(9));
        assert!(reloaded.retrieve(1).unwrap().is_none());
        assert!(reloaded.retrieve(2).unwrap().is_some());
    }

    #[test]
    fn zero_id_tombstoned_record_survives_a_round_trip() {
        // document_id 0, zero fields, tombstoned — every field of its record
        // header is zero. A from_bytes that still relies on an all-zero
        // sentinel to mean "no more records" would stop here and silently
        // drop every record that follows.
        let mut page = Page::new(1, false);
        page.insert(Document::new(0)).unwrap();
        page.insert(sample_doc(1)).unwrap();
        page.delete(0).unwrap();

        let bytes = page.to_bytes();
        let reloaded = Page::from_bytes(&bytes).unwrap();
        assert!(reloaded.retrieve(0).unwrap().is_none());
        assert!(reloaded.retrieve(1).unwrap().is_some());
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut page = Page::new(1, false);
        page.insert(sample_doc(1)).unwrap();
        let mut bytes = page.to_bytes();
        let mid = HEADER_SIZE + 3;
        bytes[mid] ^= 0xFF;
        let err = Page::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, CoreError::CorruptPage { .. }));
    }
}
