//! Page cache, eviction, and disk I/O.
//!
//! The storage manager is an arena keyed by page id: the B-Tree never holds
//! a [`crate::node::Node`] across a call that might evict it, it re-loads by
//! page id after every step. `fetch_page` is the single chokepoint where a
//! page moves between "on disk", "in cache", and "MRU in cache".
use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::errors::{err, Error};
use crate::node::{Node, PageId};

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_MAX_CACHED_PAGES: usize = 100;

/// One page's worth of content plus its dirty flag. Mirrors the reference
/// `DiskPage`: `content` is whatever dict-shaped JSON value the header or a
/// node serializes to.
#[derive(Debug, Clone)]
pub struct DiskPage {
    page_number: PageId,
    byte_size: usize,
    content: Value,
    has_unsaved_changes: bool,
}

impl DiskPage {
    fn new(page_number: PageId, byte_size: usize) -> Self {
        DiskPage {
            page_number,
            byte_size,
            content: Value::Object(serde_json::Map::new()),
            has_unsaved_changes: false,
        }
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.has_unsaved_changes
    }

    /// Encodes `content` as JSON bytes. Over-size pages are a fatal
    /// encoding failure (§7) rather than the silent truncation the
    /// reference implementation leaves unguarded.
    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let bytes = serde_json::to_vec(&self.content)
            .map_err(|e| err!(Encoding, "failed to encode page {}: {}", self.page_number, e))?;
        if bytes.len() > self.byte_size {
            warn!(
                page_number = self.page_number,
                encoded_len = bytes.len(),
                page_size = self.byte_size,
                "rejecting over-size page encoding"
            );
            return Err(err!(
                Encoding,
                "page {} content ({} bytes) exceeds page size ({} bytes)",
                self.page_number,
                bytes.len(),
                self.byte_size
            ));
        }
        Ok(bytes)
    }
}

/// Decodes a raw page body: strip NUL padding, parse as JSON. Any failure
/// along the way — bad UTF-8, malformed JSON — is swallowed and treated as
/// an empty page rather than propagated (§7, "Corrupt page").
fn decode_page_bytes(page_number: PageId, raw: &[u8]) -> Value {
    let trimmed = {
        let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        &raw[..end]
    };
    if trimmed.is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    match std::str::from_utf8(trimmed) {
        Ok(text) => serde_json::from_str(text).unwrap_or_else(|e| {
            let corrupt = err!(Corrupt, "page {} is not valid JSON: {}", page_number, e);
            warn!(page_number, "{corrupt}, recovering as empty");
            Value::Object(serde_json::Map::new())
        }),
        Err(e) => {
            let corrupt = err!(Corrupt, "page {} is not valid UTF-8: {}", page_number, e);
            warn!(page_number, "{corrupt}, recovering as empty");
            Value::Object(serde_json::Map::new())
        }
    }
}

/// A JSON value counts as "no content" the way an empty Python dict does:
/// `load_node`/bootstrap treat an empty object (or a missing page) as if
/// nothing were ever stored there.
pub fn is_empty_content(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Insertion-ordered cache of pages, tracking MRU at the back. A thin
/// HashMap + VecDeque pairing — the same shape as a textbook LRU cache —
/// rather than a strict LRU: eviction policy lives in `StorageManager`.
struct PageCache {
    order: VecDeque<PageId>,
    pages: HashMap<PageId, DiskPage>,
}

impl PageCache {
    fn new() -> Self {
        PageCache {
            order: VecDeque::new(),
            pages: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.pages.len()
    }

    fn contains(&self, page_number: PageId) -> bool {
        self.pages.contains_key(&page_number)
    }

    fn touch_mru(&mut self, page_number: PageId) {
        if let Some(pos) = self.order.iter().position(|&id| id == page_number) {
            self.order.remove(pos);
        }
        self.order.push_back(page_number);
    }

    fn insert_mru(&mut self, page_number: PageId, page: DiskPage) {
        self.pages.insert(page_number, page);
        self.touch_mru(page_number);
    }

    fn get_mut(&mut self, page_number: PageId) -> Option<&mut DiskPage> {
        self.pages.get_mut(&page_number)
    }

    fn pop_lru(&mut self) -> Option<(PageId, DiskPage)> {
        let page_number = self.order.pop_front()?;
        let page = self.pages.remove(&page_number)?;
        Some((page_number, page))
    }

    fn values_mut(&mut self) -> impl Iterator<Item = &mut DiskPage> {
        self.pages.values_mut()
    }
}

/// Manages reading and writing pages to a database file, with an in-memory
/// cache and second-chance eviction. The B-Tree only ever talks to this
/// type through page ids, never through long-lived node references.
pub struct StorageManager {
    database_file_path: PathBuf,
    max_cached_pages: usize,
    page_size: usize,
    next_page_id: PageId,
    cache: PageCache,
}

impl StorageManager {
    pub fn new<P: AsRef<Path>>(
        database_file_path: P,
        max_cached_pages: usize,
        page_size: usize,
        next_page_id: PageId,
    ) -> Result<Self, Error> {
        let path = database_file_path.as_ref().to_path_buf();
        if !path.exists() {
            OpenOptions::new().write(true).create(true).open(&path)?;
        }
        Ok(StorageManager {
            database_file_path: path,
            max_cached_pages,
            page_size,
            next_page_id,
            cache: PageCache::new(),
        })
    }

    pub fn next_page_id(&self) -> PageId {
        self.next_page_id
    }

    /// Retrieves a page, checking the cache first and loading from disk on
    /// a miss. Returns `None` only when the page is genuinely past the end
    /// of the file — a disk read that succeeds with an all-zero body still
    /// produces a (cached) page with empty content.
    fn fetch_page(&mut self, page_number: PageId) -> Result<Option<&mut DiskPage>, Error> {
        if self.cache.contains(page_number) {
            trace!(page_number, "cache hit");
            self.cache.touch_mru(page_number);
        } else {
            trace!(page_number, "cache miss");
            if self.cache.len() >= self.max_cached_pages {
                self.evict_one()?;
            }
            match self.read_page_from_disk(page_number)? {
                Some(page) => self.cache.insert_mru(page_number, page),
                None => return Ok(None),
            }
        }
        Ok(self.cache.get_mut(page_number))
    }

    /// Stores a B-tree node, allocating a page id on first store.
    pub fn store_node(&mut self, node: &mut Node) -> Result<PageId, Error> {
        if node.page_id().is_none() {
            node.set_page_id(self.next_page_id);
            self.next_page_id += 1;
        }
        let page_id = node.page_id().unwrap();
        let content = serde_json::to_value(&*node)
            .map_err(|e| err!(Encoding, "failed to encode node {}: {}", page_id, e))?;
        self.store_page_content(page_id, content)?;
        Ok(page_id)
    }

    /// Loads a node from a page, or `None` if the page is empty/absent.
    pub fn load_node(&mut self, page_number: PageId) -> Result<Option<Node>, Error> {
        match self.load_page_content(page_number)? {
            Some(content) if !is_empty_content(&content) => {
                let node: Node = serde_json::from_value(content).map_err(|e| {
                    err!(
                        Storage,
                        "failed to decode node on page {}: {}",
                        page_number,
                        e
                    )
                })?;
                Ok(Some(node))
            }
            _ => Ok(None),
        }
    }

    /// Upserts page content, marking it dirty.
    pub fn store_page_content(
        &mut self,
        page_number: PageId,
        content: Value,
    ) -> Result<(), Error> {
        if self.fetch_page(page_number)?.is_none() {
            let page = DiskPage::new(page_number, self.page_size);
            self.cache.insert_mru(page_number, page);
        }
        let page = self
            .cache
            .get_mut(page_number)
            .expect("page was just fetched or inserted");
        page.content = content;
        page.has_unsaved_changes = true;
        Ok(())
    }

    /// Reads content from a page, or `None` if the page is past EOF.
    pub fn load_page_content(&mut self, page_number: PageId) -> Result<Option<Value>, Error> {
        Ok(self.fetch_page(page_number)?.map(|p| p.content.clone()))
    }

    /// Writes every dirty cached page to disk and clears its dirty flag.
    pub fn flush_all(&mut self) -> Result<(), Error> {
        let mut flushed = 0usize;
        for page in self.cache.values_mut() {
            if !page.has_unsaved_changes {
                continue;
            }
            let page_number = page.page_number;
            let bytes = page.to_bytes()?;
            write_page_at(
                &self.database_file_path,
                page_number * self.page_size as u64,
                &bytes,
                self.page_size,
            )?;
            page.has_unsaved_changes = false;
            flushed += 1;
        }
        debug!(flushed, "flushed dirty pages");
        Ok(())
    }

    fn read_page_from_disk(&self, page_number: PageId) -> Result<Option<DiskPage>, Error> {
        let offset = page_number * self.page_size as u64;
        let raw = read_page_at(&self.database_file_path, offset, self.page_size)?;
        match raw {
            Some(bytes) => {
                let mut page = DiskPage::new(page_number, self.page_size);
                page.content = decode_page_bytes(page_number, &bytes);
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }

    fn write_page_to_disk(&self, page: &DiskPage) -> Result<(), Error> {
        let offset = page.page_number * self.page_size as u64;
        let bytes = page.to_bytes()?;
        write_page_at(&self.database_file_path, offset, &bytes, self.page_size)
    }

    /// Second-chance eviction: walk the LRU end for up to one full pass
    /// over the cache. A clean page is evicted immediately. A dirty page is
    /// flushed and given a second chance (moved back to the MRU end). If
    /// every page in the pass was dirty, the (now-clean) page that was
    /// popped first is evicted as a fallback.
    fn evict_one(&mut self) -> Result<(), Error> {
        let attempts = self.cache.len();
        for _ in 0..attempts {
            let (page_number, mut page) = match self.cache.pop_lru() {
                Some(entry) => entry,
                None => return Ok(()),
            };
            if page.has_unsaved_changes {
                warn!(
                    page_number,
                    "evicting dirty page, writing back with a second chance"
                );
                self.write_page_to_disk(&page)?;
                page.has_unsaved_changes = false;
                self.cache.insert_mru(page_number, page);
            } else {
                return Ok(());
            }
        }
        // Every page in the pass was dirty (and has since been flushed).
        // Evict the one that was processed first.
        self.cache.pop_lru();
        Ok(())
    }
}

fn read_page_at(path: &Path, offset: u64, page_size: usize) -> Result<Option<Vec<u8>>, Error> {
    let mut file = OpenOptions::new().read(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut buf = vec![0u8; page_size];
    let mut total = 0usize;
    loop {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
        if total == page_size {
            break;
        }
    }
    if total == 0 {
        return Ok(None);
    }
    buf.truncate(total);
    Ok(Some(buf))
}

fn write_page_at(path: &Path, offset: u64, body: &[u8], page_size: usize) -> Result<(), Error> {
    let mut padded = body.to_vec();
    padded.resize(page_size, 0u8);

    let mut file = OpenOptions::new().write(true).create(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&padded)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

/// Reads page 0's raw header content, tolerating a missing file or a page
/// that hasn't been written yet (all zero bytes decode to an empty object).
/// Used once, before a `StorageManager` exists, during `BTree` bootstrap.
pub fn read_header_content<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Value, Error> {
    match path.as_ref().metadata() {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Value::Object(serde_json::Map::new()))
        }
        Err(e) => return Err(e.into()),
    }
    match read_page_at(path.as_ref(), 0, page_size)? {
        Some(raw) => Ok(decode_page_bytes(0, &raw)),
        None => Ok(Value::Object(serde_json::Map::new())),
    }
}
