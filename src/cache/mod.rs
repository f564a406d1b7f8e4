//! Block-granular LRU page cache keyed by inode.
//!
//! Two instances exist per client: a small-block one for ordinary files and a
//! big-block one for log files. Blocks hold a contiguous valid byte range and
//! an optional dirty sub-range that is written back through
//! [`StorageBackend::pwrite_inode`].

pub mod flusher;

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use lru::LruCache;
use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{Ino, StorageBackend};
use crate::config::CacheConfig;
use crate::error::Result;

bitflags! {
    /// How writes to an inode interact with its page cache.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CachePolicy: u8 {
        /// Writes stay dirty in the cache until flushed.
        const WRITE_BACK = 1;
        /// Writes also go to the backend immediately; cached copies are clean.
        const WRITE_THROUGH = 1 << 1;
        /// Blocks are skipped by eviction while other victims exist.
        const PRIORITY_HIGH = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockKey {
    ino: Ino,
    offset: u64,
}

struct Block {
    data: Box<[u8]>,
    valid: Range<usize>,
    dirty: Option<Range<usize>>,
    dirtied_at: Option<Instant>,
    high_priority: bool,
}

impl Block {
    fn new(block_size: usize, at: usize, bytes: &[u8], dirty: bool, high_priority: bool) -> Self {
        let mut data = vec![0u8; block_size].into_boxed_slice();
        let range = at..at + bytes.len();
        data[range.clone()].copy_from_slice(bytes);
        Self {
            data,
            valid: range.clone(),
            dirty: dirty.then_some(range),
            dirtied_at: dirty.then(Instant::now),
            high_priority,
        }
    }

    /// Copy `bytes` in at `at`. Refused when it would leave a hole next to
    /// the current valid range.
    fn store(&mut self, at: usize, bytes: &[u8], dirty: bool) -> bool {
        let end = at + bytes.len();
        if end < self.valid.start || at > self.valid.end {
            return false;
        }
        self.data[at..end].copy_from_slice(bytes);
        self.valid = self.valid.start.min(at)..self.valid.end.max(end);
        if dirty {
            self.dirty = Some(match self.dirty.take() {
                Some(d) => d.start.min(at)..d.end.max(end),
                None => at..end,
            });
            self.dirtied_at.get_or_insert_with(Instant::now);
        }
        true
    }

    fn is_dirty(&self) -> bool {
        self.dirty.is_some()
    }
}

struct CacheInner {
    blocks: LruCache<BlockKey, Block>,
    by_inode: HashMap<Ino, BTreeSet<u64>>,
}

impl CacheInner {
    fn index(&mut self, key: BlockKey) {
        self.by_inode.entry(key.ino).or_default().insert(key.offset);
    }

    fn remove(&mut self, key: BlockKey) -> Option<Block> {
        let block = self.blocks.pop(&key);
        if let Some(offsets) = self.by_inode.get_mut(&key.ino) {
            offsets.remove(&key.offset);
            if offsets.is_empty() {
                self.by_inode.remove(&key.ino);
            }
        }
        block
    }

    /// Keys of the inode's blocks that intersect `[start, end)`.
    fn keys_in(&self, ino: Ino, start: u64, end: u64, block_size: u64) -> Vec<BlockKey> {
        let first = start - start % block_size;
        match self.by_inode.get(&ino) {
            Some(offsets) if first < end => offsets
                .range(first..end)
                .map(|&offset| BlockKey { ino, offset })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn all_keys(&self, ino: Ino) -> Vec<BlockKey> {
        self.keys_in(ino, 0, u64::MAX, 1)
    }
}

/// Counters describing what a cache currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub blocks: usize,
    pub dirty_blocks: usize,
    pub inodes: usize,
}

pub struct PageCache {
    name: &'static str,
    block_size: usize,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl PageCache {
    pub fn new(name: &'static str, block_size: usize, capacity: usize) -> Self {
        Self {
            name,
            block_size: block_size.max(1),
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                blocks: LruCache::unbounded(),
                by_inode: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn locate(&self, ino: Ino, pos: u64) -> (BlockKey, usize) {
        let bs = self.block_size as u64;
        let key = BlockKey {
            ino,
            offset: pos - pos % bs,
        };
        (key, (pos % bs) as usize)
    }

    /// Copy the longest fully cached prefix of `[offset, offset + buf.len())`
    /// into `buf` and return its length.
    pub fn read(&self, ino: Ino, offset: u64, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let mut served = 0;
        while served < buf.len() {
            let (key, at) = self.locate(ino, offset + served as u64);
            let Some(block) = inner.blocks.get(&key) else {
                break;
            };
            if at < block.valid.start || at >= block.valid.end {
                break;
            }
            let n = (block.valid.end - at).min(buf.len() - served);
            buf[served..served + n].copy_from_slice(&block.data[at..at + n]);
            served += n;
        }
        served
    }

    /// Store `data` at `offset` and return how many leading bytes were
    /// accepted. Stops at the first block that would get a hole or that cannot
    /// be made room for.
    pub fn write(
        &self,
        ino: Ino,
        offset: u64,
        data: &[u8],
        policy: CachePolicy,
        backend: &dyn StorageBackend,
    ) -> usize {
        let dirty = !policy.contains(CachePolicy::WRITE_THROUGH);
        let high = policy.contains(CachePolicy::PRIORITY_HIGH);
        let mut inner = self.inner.lock();
        let mut accepted = 0;
        while accepted < data.len() {
            let (key, at) = self.locate(ino, offset + accepted as u64);
            let n = (self.block_size - at).min(data.len() - accepted);
            let chunk = &data[accepted..accepted + n];
            if let Some(block) = inner.blocks.get_mut(&key) {
                if !block.store(at, chunk, dirty) {
                    break;
                }
                block.high_priority |= high;
            } else {
                if let Err(e) = self.make_room(&mut inner, backend) {
                    warn!("{} cache: cannot evict for inode {}: {}", self.name, ino, e);
                    break;
                }
                let block = Block::new(self.block_size, at, chunk, dirty, high);
                inner.blocks.put(key, block);
                inner.index(key);
            }
            accepted += n;
        }
        accepted
    }

    /// Insert clean bytes fetched from the backend into blocks that are not
    /// cached yet. Never evicts dirty blocks. `still_valid` is checked under
    /// the cache lock; nothing is inserted once it returns false.
    pub fn populate(
        &self,
        ino: Ino,
        offset: u64,
        data: &[u8],
        policy: CachePolicy,
        still_valid: impl Fn() -> bool,
    ) {
        let high = policy.contains(CachePolicy::PRIORITY_HIGH);
        let mut inner = self.inner.lock();
        if !still_valid() {
            return;
        }
        let mut done = 0;
        while done < data.len() {
            let (key, at) = self.locate(ino, offset + done as u64);
            let n = (self.block_size - at).min(data.len() - done);
            if !inner.blocks.contains(&key) {
                if !self.make_clean_room(&mut inner) {
                    return;
                }
                let block = Block::new(self.block_size, at, &data[done..done + n], false, high);
                inner.blocks.put(key, block);
                inner.index(key);
            }
            done += n;
        }
    }

    fn pick_victim(inner: &CacheInner, clean_only: bool) -> Option<BlockKey> {
        let eligible = |b: &Block| !(clean_only && b.is_dirty());
        inner
            .blocks
            .iter()
            .rev()
            .find(|&(_, b)| !b.high_priority && eligible(b))
            .or_else(|| inner.blocks.iter().rev().find(|&(_, b)| eligible(b)))
            .map(|(k, _)| *k)
    }

    /// Evict until one more block fits, writing back dirty victims first.
    fn make_room(&self, inner: &mut CacheInner, backend: &dyn StorageBackend) -> Result<()> {
        while inner.blocks.len() >= self.capacity {
            let Some(key) = Self::pick_victim(inner, false) else {
                break;
            };
            if let Some(block) = inner.blocks.peek_mut(&key) {
                if block.is_dirty() {
                    debug!(
                        "{} cache: evicting dirty block ino={} offset={}",
                        self.name, key.ino, key.offset
                    );
                }
                write_back(key, block, backend)?;
            }
            inner.remove(key);
        }
        Ok(())
    }

    fn make_clean_room(&self, inner: &mut CacheInner) -> bool {
        while inner.blocks.len() >= self.capacity {
            match Self::pick_victim(inner, true) {
                Some(key) => {
                    inner.remove(key);
                }
                None => return false,
            }
        }
        true
    }

    /// Write back dirty blocks of `ino` intersecting `[offset, offset + len)`.
    pub fn flush_range(
        &self,
        ino: Ino,
        offset: u64,
        len: u64,
        backend: &dyn StorageBackend,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let keys = inner.keys_in(ino, offset, offset.saturating_add(len), self.block_size as u64);
        for key in keys {
            if let Some(block) = inner.blocks.peek_mut(&key) {
                write_back(key, block, backend)?;
            }
        }
        Ok(())
    }

    /// Write back every dirty block of `ino`.
    pub fn flush_inode(&self, ino: Ino, backend: &dyn StorageBackend) -> Result<()> {
        let mut inner = self.inner.lock();
        for key in inner.all_keys(ino) {
            if let Some(block) = inner.blocks.peek_mut(&key) {
                write_back(key, block, backend)?;
            }
        }
        Ok(())
    }

    /// Write back blocks that have been dirty for at least `max_age`, across
    /// all inodes. Failures are logged and skipped. Returns the number of
    /// blocks written.
    pub fn flush_aged(&self, max_age: Duration, backend: &dyn StorageBackend) -> usize {
        let mut inner = self.inner.lock();
        let inodes: Vec<Ino> = inner.by_inode.keys().copied().collect();
        let mut flushed = 0;
        for ino in inodes {
            for key in inner.all_keys(ino) {
                let Some(block) = inner.blocks.peek_mut(&key) else {
                    continue;
                };
                let aged = matches!(block.dirtied_at, Some(t) if t.elapsed() >= max_age);
                if !aged {
                    continue;
                }
                match write_back(key, block, backend) {
                    Ok(()) => flushed += 1,
                    Err(e) => warn!(
                        "{} cache: background flush failed ino={} offset={}: {}",
                        self.name, key.ino, key.offset, e
                    ),
                }
            }
        }
        flushed
    }

    /// Drop blocks of `ino` intersecting the range, dirty or not. Callers
    /// flush first when the dirty bytes must survive.
    pub fn clear_range(&self, ino: Ino, offset: u64, len: u64) {
        let mut inner = self.inner.lock();
        let keys = inner.keys_in(ino, offset, offset.saturating_add(len), self.block_size as u64);
        for key in keys {
            inner.remove(key);
        }
    }

    /// Forget everything cached for `ino`.
    pub fn evict_inode(&self, ino: Ino) {
        let mut inner = self.inner.lock();
        for key in inner.all_keys(ino) {
            inner.remove(key);
        }
    }

    /// Drop cached bytes at or beyond `size`.
    pub fn truncate(&self, ino: Ino, size: u64) {
        let mut inner = self.inner.lock();
        for key in inner.keys_in(ino, size, u64::MAX, self.block_size as u64) {
            if key.offset >= size {
                inner.remove(key);
                continue;
            }
            let cut = (size - key.offset) as usize;
            let empty = match inner.blocks.peek_mut(&key) {
                Some(block) => {
                    block.valid.end = block.valid.end.min(cut);
                    if let Some(d) = block.dirty.take() {
                        let end = d.end.min(cut);
                        if d.start < end {
                            block.dirty = Some(d.start..end);
                        } else {
                            block.dirtied_at = None;
                        }
                    }
                    block.valid.start >= block.valid.end
                }
                None => false,
            };
            if empty {
                inner.remove(key);
            }
        }
    }

    pub fn has_dirty(&self, ino: Ino) -> bool {
        let inner = self.inner.lock();
        inner
            .all_keys(ino)
            .iter()
            .any(|k| inner.blocks.peek(k).is_some_and(Block::is_dirty))
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            blocks: inner.blocks.len(),
            dirty_blocks: inner.blocks.iter().filter(|(_, b)| b.is_dirty()).count(),
            inodes: inner.by_inode.len(),
        }
    }

    /// Drop every block. Dirty data is lost; flush beforehand.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.blocks.clear();
        inner.by_inode.clear();
    }
}

/// Write the dirty part of `block` to the backend and mark it clean.
fn write_back(key: BlockKey, block: &mut Block, backend: &dyn StorageBackend) -> Result<()> {
    let Some(range) = block.dirty.clone() else {
        return Ok(());
    };
    let bytes = &block.data[range.clone()];
    let mut written = 0;
    while written < bytes.len() {
        let at = key.offset + (range.start + written) as u64;
        let n = backend.pwrite_inode(key.ino, &bytes[written..], at)?;
        if n == 0 {
            return Err(Errno::EIO.into());
        }
        written += n;
    }
    block.dirty = None;
    block.dirtied_at = None;
    Ok(())
}

/// Which of the two cache instances an inode uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Small,
    Big,
}

/// The pair of page caches owned by one client.
#[derive(Clone)]
pub struct CacheSet {
    pub small: Arc<PageCache>,
    pub big: Arc<PageCache>,
}

impl CacheSet {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            small: Arc::new(PageCache::new("small", config.small_block_size, config.small_blocks)),
            big: Arc::new(PageCache::new("big", config.big_block_size, config.big_blocks)),
        }
    }

    pub fn get(&self, kind: CacheKind) -> &Arc<PageCache> {
        match kind {
            CacheKind::Small => &self.small,
            CacheKind::Big => &self.big,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PageCache>> {
        [&self.small, &self.big].into_iter()
    }

    pub fn flush_aged(&self, max_age: Duration, backend: &dyn StorageBackend) -> usize {
        self.iter().map(|c| c.flush_aged(max_age, backend)).sum()
    }

    pub fn clear(&self) {
        for cache in self.iter() {
            cache.clear();
        }
    }
}
