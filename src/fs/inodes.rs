use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use super::handles::FileType;
use crate::backend::{Ino, StorageBackend};
use crate::cache::{CacheKind, CachePolicy, CacheSet, PageCache};
use crate::error::Result;

/// Cache instance and write policy for a file type. Log files use the big
/// cache in write-back mode and relay logs are additionally kept resident;
/// other regular files use the small cache.
pub fn cache_policy(file_type: FileType, write_back_regular: bool) -> Option<(CacheKind, CachePolicy)> {
    match file_type {
        FileType::BinLog => Some((CacheKind::Big, CachePolicy::WRITE_BACK)),
        FileType::RelayLog => Some((
            CacheKind::Big,
            CachePolicy::WRITE_BACK | CachePolicy::PRIORITY_HIGH,
        )),
        FileType::Regular | FileType::RedoLog => {
            let policy = if write_back_regular {
                CachePolicy::WRITE_BACK
            } else {
                CachePolicy::WRITE_THROUGH
            };
            Some((CacheKind::Small, policy))
        }
        FileType::Other => None,
    }
}

#[derive(Debug)]
struct InodeState {
    size: u64,
    fd_ref: u32,
    /// Set once the last reference is gone; the entry stays visible until
    /// its blocks are written back.
    closing: bool,
}

/// Per-inode state shared by every open descriptor of the inode.
pub struct InodeInfo {
    pub ino: Ino,
    pub client_id: i64,
    pub file_type: FileType,
    pub policy: CachePolicy,
    pub cache: Option<Arc<PageCache>>,
    state: Mutex<InodeState>,
    /// Bumped whenever cached ranges are invalidated, so a read that raced
    /// with the invalidation does not repopulate stale bytes.
    epoch: AtomicU64,
}

impl InodeInfo {
    /// Locally authoritative size; may be ahead of the backend while dirty
    /// blocks are pending.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn set_size(&self, size: u64) {
        self.state.lock().size = size;
    }

    /// Raise the size to `end` if it is larger. Returns the resulting size.
    pub fn grow_to(&self, end: u64) -> u64 {
        let mut state = self.state.lock();
        state.size = state.size.max(end);
        state.size
    }

    pub fn fd_refs(&self) -> u32 {
        self.state.lock().fd_ref
    }

    /// Write back all dirty blocks of this inode.
    pub fn flush(&self, backend: &dyn StorageBackend) -> Result<()> {
        match &self.cache {
            Some(cache) => cache.flush_inode(self.ino, backend),
            None => Ok(()),
        }
    }

    pub fn flush_range(&self, offset: u64, len: u64, backend: &dyn StorageBackend) -> Result<()> {
        match &self.cache {
            Some(cache) => cache.flush_range(self.ino, offset, len, backend),
            None => Ok(()),
        }
    }

    pub fn clear_range(&self, offset: u64, len: u64) {
        if let Some(cache) = &self.cache {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            cache.clear_range(self.ino, offset, len);
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Cut cached data and the cached size down to `size` without writing
    /// anything back.
    pub fn discard_beyond(&self, size: u64) {
        if let Some(cache) = &self.cache {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            cache.truncate(self.ino, size);
        }
        self.set_size(size);
    }
}

/// Registry of open inodes: at most one [`InodeInfo`] per inode, shared by
/// all descriptors and reference counted by them.
///
/// The map lock is only held for lookups and inserts. Write-back of a closing
/// inode runs without it; opens of that inode wait on `departed` until the
/// entry is gone.
pub struct InodeRegistry {
    inodes: RwLock<HashMap<Ino, Arc<InodeInfo>>>,
    departures: Mutex<()>,
    departed: Condvar,
    caches: CacheSet,
    write_back_regular: bool,
}

impl InodeRegistry {
    pub fn new(caches: CacheSet, write_back_regular: bool) -> Self {
        Self {
            inodes: RwLock::new(HashMap::new()),
            departures: Mutex::new(()),
            departed: Condvar::new(),
            caches,
            write_back_regular,
        }
    }

    pub fn caches(&self) -> &CacheSet {
        &self.caches
    }

    /// Take one descriptor reference on `ino`, creating its entry if needed.
    /// `size` and `client_id` only matter when the entry is new.
    pub fn acquire(&self, ino: Ino, file_type: FileType, size: u64, client_id: i64) -> Arc<InodeInfo> {
        loop {
            let existing = self.inodes.read().get(&ino).cloned();
            match existing {
                Some(info) => {
                    if Self::try_ref(&info) {
                        return info;
                    }
                    self.wait_departure(&info);
                }
                None => {
                    if let Some(info) = self.insert(ino, file_type, size, client_id) {
                        return info;
                    }
                }
            }
        }
    }

    /// Count a reference unless the entry is already on its way out.
    fn try_ref(info: &InodeInfo) -> bool {
        let mut state = info.state.lock();
        if state.closing {
            return false;
        }
        state.fd_ref += 1;
        true
    }

    /// Block until `info` has left the map.
    fn wait_departure(&self, info: &Arc<InodeInfo>) {
        let mut departures = self.departures.lock();
        while self.is_current(info) {
            self.departed.wait(&mut departures);
        }
    }

    fn is_current(&self, info: &Arc<InodeInfo>) -> bool {
        matches!(self.inodes.read().get(&info.ino), Some(current) if Arc::ptr_eq(current, info))
    }

    /// Insert a fresh entry holding one reference. Returns `None` when another
    /// entry for the inode showed up first and could not be referenced.
    fn insert(&self, ino: Ino, file_type: FileType, size: u64, client_id: i64) -> Option<Arc<InodeInfo>> {
        let fresh = self.detached(ino, file_type, size, client_id, 1);
        let mut inodes = self.inodes.write();
        if let Some(existing) = inodes.get(&ino) {
            // Lost the race against another opener.
            return Self::try_ref(existing).then(|| Arc::clone(existing));
        }
        debug!(
            "inode {} registered: type={:?} size={} policy={:?}",
            ino, file_type, size, fresh.policy
        );
        inodes.insert(ino, Arc::clone(&fresh));
        Some(fresh)
    }

    /// Build an entry holding `fd_refs` references without registering it.
    pub fn detached(
        &self,
        ino: Ino,
        file_type: FileType,
        size: u64,
        client_id: i64,
        fd_refs: u32,
    ) -> Arc<InodeInfo> {
        let (cache, policy) = match cache_policy(file_type, self.write_back_regular) {
            Some((kind, policy)) => (Some(Arc::clone(self.caches.get(kind))), policy),
            None => (None, CachePolicy::WRITE_THROUGH),
        };
        Arc::new(InodeInfo {
            ino,
            client_id,
            file_type,
            policy,
            cache,
            state: Mutex::new(InodeState {
                size,
                fd_ref: fd_refs,
                closing: false,
            }),
            epoch: AtomicU64::new(0),
        })
    }

    /// Drop one descriptor reference. The last one writes back the inode's
    /// dirty blocks, forgets its cached data and removes the entry. Opens of
    /// the same inode wait for that to finish; nothing else does.
    pub fn release(&self, info: &Arc<InodeInfo>, backend: &dyn StorageBackend) -> Result<()> {
        {
            let mut state = info.state.lock();
            state.fd_ref = state.fd_ref.saturating_sub(1);
            if state.fd_ref > 0 {
                return Ok(());
            }
            state.closing = true;
        }

        let flushed = info.flush(backend);
        if let Some(cache) = &info.cache {
            if flushed.is_ok() {
                cache.evict_inode(info.ino);
            }
        }

        {
            let _departures = self.departures.lock();
            let mut inodes = self.inodes.write();
            if matches!(inodes.get(&info.ino), Some(current) if Arc::ptr_eq(current, info)) {
                inodes.remove(&info.ino);
            }
        }
        self.departed.notify_all();
        debug!("inode {} released", info.ino);
        flushed
    }

    pub fn lookup(&self, ino: Ino) -> Option<Arc<InodeInfo>> {
        self.inodes.read().get(&ino).cloned()
    }

    pub fn all(&self) -> Vec<Arc<InodeInfo>> {
        self.inodes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace every entry with `entries`, without flushing. Used when
    /// rebuilding from a snapshot after the caches were flushed.
    pub fn replace_all(&self, entries: Vec<Arc<InodeInfo>>) {
        let mut inodes = self.inodes.write();
        inodes.clear();
        for info in entries {
            inodes.insert(info.ino, info);
        }
    }
}
