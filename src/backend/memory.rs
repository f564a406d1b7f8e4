//! An in-process storage cluster.
//!
//! [`MemoryStore`] plays the role of the cluster: one namespace shared by
//! every client. [`MemoryBackend`] is one client session against it, with its
//! own descriptor space that can be exported and resumed across a hot
//! reload. [`MemoryExtentReader`] serves the direct extent path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    BackendResult, DirEntry, ExtentReader, ExtentRequest, Fd, FileInfo, FileLock, FileStat, Ino,
    LockKind, SetAttr, StorageBackend,
};
use crate::fs::path::{clean_path, split_parent};

pub const ROOT_INO: Ino = 1;
pub const DEFAULT_EXTENT_SIZE: u64 = 64 * 1024;

const MAX_SYMLINK_DEPTH: u32 = 8;
const MAX_FD: Fd = 1 << 20;
const DATA_PORT: u16 = 17310;
const DATA_NODES: u64 = 3;

enum NodeKind {
    File(Vec<u8>),
    Dir(BTreeMap<String, Ino>),
    Symlink(String),
}

struct Node {
    kind: NodeKind,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    open_count: u32,
    atime: i64,
    mtime: i64,
    ctime: i64,
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl Node {
    fn new(kind: NodeKind, mode: u32) -> Self {
        let now = chrono::Utc::now().timestamp();
        let nlink = if matches!(kind, NodeKind::Dir(_)) { 2 } else { 1 };
        Self {
            kind,
            mode,
            uid: 0,
            gid: 0,
            nlink,
            open_count: 0,
            atime: now,
            mtime: now,
            ctime: now,
            xattrs: BTreeMap::new(),
        }
    }

    fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Dir(_) => 4096,
            NodeKind::Symlink(target) => target.len() as u64,
        }
    }

    fn touch(&mut self) {
        let now = chrono::Utc::now().timestamp();
        self.mtime = now;
        self.ctime = now;
    }
}

struct HeldLock {
    client_id: i64,
    kind: LockKind,
    start: u64,
    end: Option<u64>,
    pid: i32,
}

impl HeldLock {
    fn overlaps(&self, start: u64, end: Option<u64>) -> bool {
        let before = matches!(end, Some(e) if e <= self.start);
        let after = matches!(self.end, Some(e) if e <= start);
        !before && !after
    }
}

struct StoreInner {
    nodes: HashMap<Ino, Node>,
    next_ino: Ino,
    locks: HashMap<Ino, Vec<HeldLock>>,
}

impl StoreInner {
    fn node(&self, ino: Ino) -> BackendResult<&Node> {
        self.nodes.get(&ino).ok_or(Errno::ENOENT)
    }

    fn node_mut(&mut self, ino: Ino) -> BackendResult<&mut Node> {
        self.nodes.get_mut(&ino).ok_or(Errno::ENOENT)
    }

    fn lookup(&self, path: &str, follow_last: bool) -> BackendResult<Ino> {
        self.lookup_depth(path, follow_last, 0)
    }

    fn lookup_depth(&self, path: &str, follow_last: bool, depth: u32) -> BackendResult<Ino> {
        if depth > MAX_SYMLINK_DEPTH {
            return Err(Errno::ELOOP);
        }
        let comps: Vec<&str> = path
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect();
        let mut cur = ROOT_INO;
        let mut cur_path = String::from("/");
        for (i, comp) in comps.iter().enumerate() {
            let entries = match &self.node(cur)?.kind {
                NodeKind::Dir(entries) => entries,
                _ => return Err(Errno::ENOTDIR),
            };
            let child = *entries.get(*comp).ok_or(Errno::ENOENT)?;
            let last = i + 1 == comps.len();
            if let NodeKind::Symlink(target) = &self.node(child)?.kind {
                if !last || follow_last {
                    let base = if target.starts_with('/') {
                        target.clone()
                    } else {
                        format!("{}/{}", cur_path, target)
                    };
                    let rest = comps[i + 1..].join("/");
                    let next = clean_path(&format!("{}/{}", base, rest));
                    return self.lookup_depth(&next, follow_last, depth + 1);
                }
            }
            cur = child;
            cur_path = clean_path(&format!("{}/{}", cur_path, comp));
        }
        Ok(cur)
    }

    /// Resolve the directory holding `path` and return it with the final name.
    fn parent_of<'a>(&self, path: &'a str) -> BackendResult<(Ino, &'a str)> {
        let (parent, name) = split_parent(path);
        if name.is_empty() {
            return Err(Errno::EBUSY);
        }
        let dir = self.lookup(parent, true)?;
        match self.node(dir)?.kind {
            NodeKind::Dir(_) => Ok((dir, name)),
            _ => Err(Errno::ENOTDIR),
        }
    }

    fn entries(&self, dir: Ino) -> BackendResult<&BTreeMap<String, Ino>> {
        match &self.node(dir)?.kind {
            NodeKind::Dir(entries) => Ok(entries),
            _ => Err(Errno::ENOTDIR),
        }
    }

    fn entries_mut(&mut self, dir: Ino) -> BackendResult<&mut BTreeMap<String, Ino>> {
        match &mut self.node_mut(dir)?.kind {
            NodeKind::Dir(entries) => Ok(entries),
            _ => Err(Errno::ENOTDIR),
        }
    }

    fn insert_node(&mut self, parent: Ino, name: &str, node: Node) -> BackendResult<Ino> {
        let ino = self.next_ino;
        self.next_ino += 1;
        let is_dir = matches!(node.kind, NodeKind::Dir(_));
        self.entries_mut(parent)?.insert(name.to_string(), ino);
        self.nodes.insert(ino, node);
        let parent_node = self.node_mut(parent)?;
        if is_dir {
            parent_node.nlink += 1;
        }
        parent_node.touch();
        Ok(ino)
    }

    /// Drop an inode once it has no names and no open descriptors.
    fn reap(&mut self, ino: Ino) {
        let dead = matches!(self.nodes.get(&ino), Some(n) if n.nlink == 0 && n.open_count == 0);
        if dead {
            debug!("memory store: reaping inode {}", ino);
            self.nodes.remove(&ino);
            self.locks.remove(&ino);
        }
    }

    fn drop_link(&mut self, ino: Ino) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.nlink = if matches!(node.kind, NodeKind::Dir(_)) { 0 } else { node.nlink.saturating_sub(1) };
            node.ctime = chrono::Utc::now().timestamp();
        }
        self.reap(ino);
    }

    fn file_data_mut(&mut self, ino: Ino) -> BackendResult<&mut Vec<u8>> {
        match &mut self.node_mut(ino)?.kind {
            NodeKind::File(data) => Ok(data),
            NodeKind::Dir(_) => Err(Errno::EISDIR),
            NodeKind::Symlink(_) => Err(Errno::EINVAL),
        }
    }

    fn read_at(&self, ino: Ino, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        match &self.node(ino)?.kind {
            NodeKind::File(data) => {
                let len = data.len() as u64;
                if offset >= len {
                    return Ok(0);
                }
                let start = offset as usize;
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            NodeKind::Dir(_) => Err(Errno::EISDIR),
            NodeKind::Symlink(_) => Err(Errno::EINVAL),
        }
    }

    fn write_at(&mut self, ino: Ino, data: &[u8], offset: u64) -> BackendResult<usize> {
        let file = self.file_data_mut(ino)?;
        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);
        self.node_mut(ino)?.touch();
        Ok(data.len())
    }

    fn stat_of(&self, ino: Ino) -> BackendResult<FileStat> {
        let node = self.node(ino)?;
        let size = node.size();
        Ok(FileStat {
            ino,
            mode: node.mode,
            nlink: node.nlink,
            uid: node.uid,
            gid: node.gid,
            size,
            blksize: 4096,
            blocks: size.div_ceil(512),
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.ctime,
        })
    }
}

/// The shared namespace every [`MemoryBackend`] session talks to.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    extent_size: u64,
    next_client: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Self::with_extent_size(DEFAULT_EXTENT_SIZE)
    }

    pub fn with_extent_size(extent_size: u64) -> Arc<Self> {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INO,
            Node::new(NodeKind::Dir(BTreeMap::new()), libc::S_IFDIR | 0o755),
        );
        Arc::new(Self {
            inner: Mutex::new(StoreInner {
                nodes,
                next_ino: ROOT_INO + 1,
                locks: HashMap::new(),
            }),
            extent_size: extent_size.max(1),
            next_client: AtomicI64::new(1),
        })
    }

    /// Current contents of a regular file, by in-mount path.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        let ino = inner.lookup(path, true).ok()?;
        match &inner.node(ino).ok()?.kind {
            NodeKind::File(data) => Some(data.clone()),
            _ => None,
        }
    }

    /// Current contents of a regular file, by inode. Works for unlinked inodes
    /// that are still open somewhere.
    pub fn inode_contents(&self, ino: Ino) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        match &inner.node(ino).ok()?.kind {
            NodeKind::File(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn inode_exists(&self, ino: Ino) -> bool {
        self.inner.lock().nodes.contains_key(&ino)
    }

    fn read_extent(&self, ino: Ino, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        self.inner.lock().read_at(ino, buf, offset)
    }
}

/// Operation counters of one session, used to observe cache behaviour.
#[derive(Debug, Default)]
pub struct BackendStats {
    pub preads: AtomicU64,
    pub pwrites: AtomicU64,
    pub inode_writes: AtomicU64,
    pub flushes: AtomicU64,
    pub refreshes: AtomicU64,
}

impl BackendStats {
    pub fn preads(&self) -> u64 {
        self.preads.load(Ordering::Relaxed)
    }

    pub fn pwrites(&self) -> u64 {
        self.pwrites.load(Ordering::Relaxed)
    }

    pub fn inode_writes(&self) -> u64 {
        self.inode_writes.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionFile {
    ino: Ino,
    flags: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Session {
    client_id: i64,
    files: BTreeMap<Fd, SessionFile>,
    reserved: BTreeSet<Fd>,
}

impl Session {
    fn lowest_free(&self, min: Fd) -> BackendResult<Fd> {
        let mut fd = min.max(1);
        while self.files.contains_key(&fd) || self.reserved.contains(&fd) {
            fd += 1;
        }
        if fd >= MAX_FD {
            return Err(Errno::EMFILE);
        }
        Ok(fd)
    }

    fn file(&self, fd: Fd) -> BackendResult<&SessionFile> {
        self.files.get(&fd).ok_or(Errno::EBADF)
    }
}

fn can_read(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_WRONLY
}

fn can_write(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY
}

/// Called with the inode and offset of a write before the bytes land.
pub type WriteHook = Arc<dyn Fn(Ino, u64) + Send + Sync>;

#[derive(Default)]
struct WriteHooks {
    pwrite: Option<WriteHook>,
    inode_write: Option<WriteHook>,
}

/// One client session against a [`MemoryStore`].
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    session: Mutex<Session>,
    stats: BackendStats,
    hooks: Mutex<WriteHooks>,
}

impl MemoryBackend {
    pub fn connect(store: Arc<MemoryStore>) -> Self {
        let client_id = store.next_client.fetch_add(1, Ordering::Relaxed);
        Self {
            store,
            session: Mutex::new(Session {
                client_id,
                ..Session::default()
            }),
            stats: BackendStats::default(),
            hooks: Mutex::new(WriteHooks::default()),
        }
    }

    /// Reattach to the store with a descriptor space exported by
    /// [`StorageBackend::export_state`] of an earlier session.
    pub fn resume(store: Arc<MemoryStore>, state: &[u8]) -> BackendResult<Self> {
        let session: Session = serde_json::from_slice(state).map_err(|_| Errno::EINVAL)?;
        debug!(
            "memory backend: resuming client {} with {} open descriptors",
            session.client_id,
            session.files.len()
        );
        Ok(Self {
            store,
            session: Mutex::new(session),
            stats: BackendStats::default(),
            hooks: Mutex::new(WriteHooks::default()),
        })
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn stats(&self) -> &BackendStats {
        &self.stats
    }

    /// Run `hook` inside every descriptor write, outside the store lock.
    pub fn set_pwrite_hook(&self, hook: Option<WriteHook>) {
        self.hooks.lock().pwrite = hook;
    }

    /// Run `hook` inside every cache write-back, outside the store lock.
    pub fn set_inode_write_hook(&self, hook: Option<WriteHook>) {
        self.hooks.lock().inode_write = hook;
    }

    pub fn open_descriptors(&self) -> usize {
        self.session.lock().files.len()
    }

    fn client_id(&self) -> i64 {
        self.session.lock().client_id
    }

    fn fd_ino(&self, fd: Fd) -> BackendResult<(Ino, i32)> {
        let session = self.session.lock();
        let file = session.file(fd)?;
        Ok((file.ino, file.flags))
    }
}

impl StorageBackend for MemoryBackend {
    fn open(&self, path: &str, flags: i32, mode: u32) -> BackendResult<Fd> {
        let mut inner = self.store.inner.lock();
        let follow = flags & libc::O_NOFOLLOW == 0;
        let ino = match inner.lookup(path, follow) {
            Ok(ino) => {
                if flags & libc::O_CREAT != 0 && flags & libc::O_EXCL != 0 {
                    return Err(Errno::EEXIST);
                }
                ino
            }
            Err(Errno::ENOENT) if flags & libc::O_CREAT != 0 => {
                let (parent, name) = inner.parent_of(path)?;
                let node = Node::new(NodeKind::File(Vec::new()), libc::S_IFREG | (mode & 0o7777));
                inner.insert_node(parent, name, node)?
            }
            Err(e) => return Err(e),
        };

        let node = inner.node_mut(ino)?;
        match &node.kind {
            NodeKind::Dir(_) if can_write(flags) => return Err(Errno::EISDIR),
            NodeKind::File(_) if flags & libc::O_DIRECTORY != 0 => return Err(Errno::ENOTDIR),
            NodeKind::Symlink(_) => return Err(Errno::ELOOP),
            _ => {}
        }
        if flags & libc::O_TRUNC != 0 && can_write(flags) {
            if let NodeKind::File(data) = &mut node.kind {
                data.clear();
            }
            node.touch();
        }

        let mut session = self.session.lock();
        let fd = session.lowest_free(1)?;
        node.open_count += 1;
        session.files.insert(fd, SessionFile { ino, flags });
        debug!("memory backend: open {} -> fd {} (ino {})", path, fd, ino);
        Ok(fd)
    }

    fn file_info(&self, fd: Fd) -> BackendResult<FileInfo> {
        let (ino, _) = self.fd_ino(fd)?;
        let inner = self.store.inner.lock();
        let node = inner.node(ino)?;
        Ok(FileInfo {
            ino,
            size: node.size(),
            mode: node.mode,
            client_id: self.client_id(),
        })
    }

    fn close(&self, fd: Fd) -> BackendResult<()> {
        let mut inner = self.store.inner.lock();
        let (file, client_id) = {
            let mut session = self.session.lock();
            let file = session.files.remove(&fd).ok_or(Errno::EBADF)?;
            (file, session.client_id)
        };
        if let Some(locks) = inner.locks.get_mut(&file.ino) {
            locks.retain(|l| l.client_id != client_id);
        }
        if let Ok(node) = inner.node_mut(file.ino) {
            node.open_count = node.open_count.saturating_sub(1);
        }
        inner.reap(file.ino);
        Ok(())
    }

    fn alloc_fd(&self, min: Fd) -> BackendResult<Fd> {
        let mut session = self.session.lock();
        let fd = session.lowest_free(min)?;
        session.reserved.insert(fd);
        Ok(fd)
    }

    fn release_fd(&self, fd: Fd) {
        self.session.lock().reserved.remove(&fd);
    }

    fn stat(&self, path: &str, follow: bool) -> BackendResult<FileStat> {
        let inner = self.store.inner.lock();
        let ino = inner.lookup(path, follow)?;
        inner.stat_of(ino)
    }

    fn fstat(&self, fd: Fd) -> BackendResult<FileStat> {
        let (ino, _) = self.fd_ino(fd)?;
        self.store.inner.lock().stat_of(ino)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        let (ino, flags) = self.fd_ino(fd)?;
        if !can_read(flags) {
            return Err(Errno::EBADF);
        }
        self.stats.preads.fetch_add(1, Ordering::Relaxed);
        self.store.inner.lock().read_at(ino, buf, offset)
    }

    fn pwrite(&self, fd: Fd, data: &[u8], offset: u64) -> BackendResult<usize> {
        let (ino, flags) = self.fd_ino(fd)?;
        if !can_write(flags) {
            return Err(Errno::EBADF);
        }
        self.stats.pwrites.fetch_add(1, Ordering::Relaxed);
        let hook = self.hooks.lock().pwrite.clone();
        if let Some(hook) = hook {
            hook(ino, offset);
        }
        self.store.inner.lock().write_at(ino, data, offset)
    }

    fn pwrite_inode(&self, ino: Ino, data: &[u8], offset: u64) -> BackendResult<usize> {
        self.stats.inode_writes.fetch_add(1, Ordering::Relaxed);
        let hook = self.hooks.lock().inode_write.clone();
        if let Some(hook) = hook {
            hook(ino, offset);
        }
        self.store.inner.lock().write_at(ino, data, offset)
    }

    fn flush(&self, fd: Fd) -> BackendResult<()> {
        self.fd_ino(fd)?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn refresh_extents(&self, ino: Ino) -> BackendResult<u64> {
        self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(self.store.inner.lock().node(ino)?.size())
    }

    fn read_requests(&self, fd: Fd, offset: u64, len: usize) -> BackendResult<Vec<ExtentRequest>> {
        let (ino, flags) = self.fd_ino(fd)?;
        if !can_read(flags) {
            return Err(Errno::EBADF);
        }
        let size = self.store.inner.lock().node(ino)?.size();
        let end = size.min(offset + len as u64);
        let extent = self.store.extent_size;
        let mut reqs = Vec::new();
        let mut pos = offset;
        while pos < end {
            let index = pos / extent;
            let chunk_end = ((index + 1) * extent).min(end);
            let node = index % DATA_NODES;
            reqs.push(ExtentRequest {
                file_offset: pos,
                size: (chunk_end - pos) as usize,
                partition_id: node + 1,
                extent_id: ino,
                extent_offset: pos,
                host: format!("10.0.0.{}", node + 1),
                port: DATA_PORT,
            });
            pos = chunk_end;
        }
        Ok(reqs)
    }

    fn truncate(&self, path: &str, len: u64) -> BackendResult<()> {
        let mut inner = self.store.inner.lock();
        let ino = inner.lookup(path, true)?;
        inner.file_data_mut(ino)?.resize(len as usize, 0);
        inner.node_mut(ino)?.touch();
        Ok(())
    }

    fn ftruncate(&self, fd: Fd, len: u64) -> BackendResult<()> {
        let (ino, flags) = self.fd_ino(fd)?;
        if !can_write(flags) {
            return Err(Errno::EINVAL);
        }
        let mut inner = self.store.inner.lock();
        inner.file_data_mut(ino)?.resize(len as usize, 0);
        inner.node_mut(ino)?.touch();
        Ok(())
    }

    fn fallocate(&self, fd: Fd, mode: i32, offset: u64, len: u64) -> BackendResult<()> {
        let (ino, flags) = self.fd_ino(fd)?;
        if !can_write(flags) {
            return Err(Errno::EBADF);
        }
        let mut inner = self.store.inner.lock();
        let data = inner.file_data_mut(ino)?;
        match mode {
            0 => {
                let end = (offset + len) as usize;
                if data.len() < end {
                    data.resize(end, 0);
                }
                Ok(())
            }
            libc::FALLOC_FL_KEEP_SIZE => Ok(()),
            _ => Err(Errno::EOPNOTSUPP),
        }
    }

    fn unlink(&self, path: &str) -> BackendResult<()> {
        let mut inner = self.store.inner.lock();
        let (parent, name) = inner.parent_of(path)?;
        let ino = *inner.entries(parent)?.get(name).ok_or(Errno::ENOENT)?;
        if matches!(inner.node(ino)?.kind, NodeKind::Dir(_)) {
            return Err(Errno::EISDIR);
        }
        inner.entries_mut(parent)?.remove(name);
        inner.node_mut(parent)?.touch();
        inner.drop_link(ino);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
        let from = clean_path(from);
        let to = clean_path(to);
        if from == to {
            return Ok(());
        }
        if to.starts_with(&format!("{}/", from)) {
            return Err(Errno::EINVAL);
        }
        let mut inner = self.store.inner.lock();
        let (src_dir, src_name) = inner.parent_of(&from)?;
        let (dst_dir, dst_name) = inner.parent_of(&to)?;
        let ino = *inner.entries(src_dir)?.get(src_name).ok_or(Errno::ENOENT)?;
        let src_is_dir = matches!(inner.node(ino)?.kind, NodeKind::Dir(_));

        if let Some(&existing) = inner.entries(dst_dir)?.get(dst_name) {
            match &inner.node(existing)?.kind {
                NodeKind::Dir(entries) => {
                    if !src_is_dir {
                        return Err(Errno::EISDIR);
                    }
                    if !entries.is_empty() {
                        return Err(Errno::ENOTEMPTY);
                    }
                }
                _ if src_is_dir => return Err(Errno::ENOTDIR),
                _ => {}
            }
            inner.entries_mut(dst_dir)?.remove(dst_name);
            inner.drop_link(existing);
        }

        inner.entries_mut(src_dir)?.remove(src_name);
        inner.entries_mut(dst_dir)?.insert(dst_name.to_string(), ino);
        if src_is_dir && src_dir != dst_dir {
            inner.node_mut(src_dir)?.nlink -= 1;
            inner.node_mut(dst_dir)?.nlink += 1;
        }
        inner.node_mut(src_dir)?.touch();
        inner.node_mut(dst_dir)?.touch();
        Ok(())
    }

    fn mkdir(&self, path: &str, mode: u32) -> BackendResult<()> {
        let mut inner = self.store.inner.lock();
        let (parent, name) = inner.parent_of(path)?;
        if inner.entries(parent)?.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        let node = Node::new(NodeKind::Dir(BTreeMap::new()), libc::S_IFDIR | (mode & 0o7777));
        inner.insert_node(parent, name, node)?;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> BackendResult<()> {
        let mut inner = self.store.inner.lock();
        let (parent, name) = inner.parent_of(path)?;
        let ino = *inner.entries(parent)?.get(name).ok_or(Errno::ENOENT)?;
        if !inner.entries(ino)?.is_empty() {
            return Err(Errno::ENOTEMPTY);
        }
        inner.entries_mut(parent)?.remove(name);
        let parent_node = inner.node_mut(parent)?;
        parent_node.nlink -= 1;
        parent_node.touch();
        inner.drop_link(ino);
        Ok(())
    }

    fn readdir(&self, fd: Fd, start: usize, max: usize) -> BackendResult<Vec<DirEntry>> {
        let (ino, _) = self.fd_ino(fd)?;
        let inner = self.store.inner.lock();
        let entries = inner.entries(ino)?;
        let dots = [(".".to_string(), ino), ("..".to_string(), ino)];
        let listing: Vec<DirEntry> = dots
            .into_iter()
            .chain(entries.iter().map(|(name, ino)| (name.clone(), *ino)))
            .skip(start)
            .take(max)
            .map(|(name, child)| {
                let kind = match inner.nodes.get(&child).map(|n| &n.kind) {
                    Some(NodeKind::Dir(_)) => libc::DT_DIR,
                    Some(NodeKind::Symlink(_)) => libc::DT_LNK,
                    _ => libc::DT_REG,
                };
                DirEntry { ino: child, name, kind }
            })
            .collect();
        Ok(listing)
    }

    fn link(&self, from: &str, to: &str) -> BackendResult<()> {
        let mut inner = self.store.inner.lock();
        let ino = inner.lookup(from, false)?;
        if matches!(inner.node(ino)?.kind, NodeKind::Dir(_)) {
            return Err(Errno::EPERM);
        }
        let (parent, name) = inner.parent_of(to)?;
        if inner.entries(parent)?.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        inner.entries_mut(parent)?.insert(name.to_string(), ino);
        let node = inner.node_mut(ino)?;
        node.nlink += 1;
        node.ctime = chrono::Utc::now().timestamp();
        Ok(())
    }

    fn symlink(&self, target: &str, link: &str) -> BackendResult<()> {
        let mut inner = self.store.inner.lock();
        let (parent, name) = inner.parent_of(link)?;
        if inner.entries(parent)?.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        let node = Node::new(NodeKind::Symlink(target.to_string()), libc::S_IFLNK | 0o777);
        inner.insert_node(parent, name, node)?;
        Ok(())
    }

    fn readlink(&self, path: &str) -> BackendResult<String> {
        let inner = self.store.inner.lock();
        let ino = inner.lookup(path, false)?;
        match &inner.node(ino)?.kind {
            NodeKind::Symlink(target) => Ok(target.clone()),
            _ => Err(Errno::EINVAL),
        }
    }

    fn access(&self, path: &str, _mode: i32) -> BackendResult<()> {
        self.store.inner.lock().lookup(path, true).map(|_| ())
    }

    fn set_attr(&self, path: &str, attr: SetAttr, follow: bool) -> BackendResult<()> {
        let mut inner = self.store.inner.lock();
        let ino = inner.lookup(path, follow)?;
        apply_attr(inner.node_mut(ino)?, attr);
        Ok(())
    }

    fn fset_attr(&self, fd: Fd, attr: SetAttr) -> BackendResult<()> {
        let (ino, _) = self.fd_ino(fd)?;
        let mut inner = self.store.inner.lock();
        apply_attr(inner.node_mut(ino)?, attr);
        Ok(())
    }

    fn set_xattr(&self, path: &str, name: &str, value: &[u8], flags: i32, follow: bool) -> BackendResult<()> {
        let mut inner = self.store.inner.lock();
        let ino = inner.lookup(path, follow)?;
        let node = inner.node_mut(ino)?;
        let exists = node.xattrs.contains_key(name);
        if flags & libc::XATTR_CREATE != 0 && exists {
            return Err(Errno::EEXIST);
        }
        if flags & libc::XATTR_REPLACE != 0 && !exists {
            return Err(Errno::ENODATA);
        }
        node.xattrs.insert(name.to_string(), value.to_vec());
        node.ctime = chrono::Utc::now().timestamp();
        Ok(())
    }

    fn get_xattr(&self, path: &str, name: &str, follow: bool) -> BackendResult<Vec<u8>> {
        let inner = self.store.inner.lock();
        let ino = inner.lookup(path, follow)?;
        inner.node(ino)?.xattrs.get(name).cloned().ok_or(Errno::ENODATA)
    }

    fn list_xattr(&self, path: &str, follow: bool) -> BackendResult<Vec<String>> {
        let inner = self.store.inner.lock();
        let ino = inner.lookup(path, follow)?;
        Ok(inner.node(ino)?.xattrs.keys().cloned().collect())
    }

    fn remove_xattr(&self, path: &str, name: &str, follow: bool) -> BackendResult<()> {
        let mut inner = self.store.inner.lock();
        let ino = inner.lookup(path, follow)?;
        inner
            .node_mut(ino)?
            .xattrs
            .remove(name)
            .map(|_| ())
            .ok_or(Errno::ENODATA)
    }

    fn set_lock(&self, fd: Fd, lock: FileLock) -> BackendResult<()> {
        let (ino, _) = self.fd_ino(fd)?;
        let client_id = self.client_id();
        let end = (lock.len != 0).then(|| lock.start + lock.len);
        let mut inner = self.store.inner.lock();
        let held = inner.locks.entry(ino).or_default();
        if lock.kind != LockKind::Unlock {
            let conflict = held.iter().any(|h| {
                h.client_id != client_id
                    && h.overlaps(lock.start, end)
                    && (h.kind == LockKind::Write || lock.kind == LockKind::Write)
            });
            if conflict {
                return Err(Errno::EAGAIN);
            }
        }
        held.retain(|h| h.client_id != client_id || !h.overlaps(lock.start, end));
        if lock.kind != LockKind::Unlock {
            held.push(HeldLock {
                client_id,
                kind: lock.kind,
                start: lock.start,
                end,
                pid: lock.pid,
            });
        }
        Ok(())
    }

    fn get_lock(&self, fd: Fd, lock: FileLock) -> BackendResult<Option<FileLock>> {
        let (ino, _) = self.fd_ino(fd)?;
        let client_id = self.client_id();
        let end = (lock.len != 0).then(|| lock.start + lock.len);
        let inner = self.store.inner.lock();
        let found = inner.locks.get(&ino).and_then(|held| {
            held.iter().find(|h| {
                h.client_id != client_id
                    && h.overlaps(lock.start, end)
                    && (h.kind == LockKind::Write || lock.kind == LockKind::Write)
            })
        });
        Ok(found.map(|h| FileLock {
            kind: h.kind,
            start: h.start,
            len: h.end.map(|e| e - h.start).unwrap_or(0),
            pid: h.pid,
        }))
    }

    fn export_state(&self) -> BackendResult<Vec<u8>> {
        serde_json::to_vec(&*self.session.lock()).map_err(|_| Errno::EIO)
    }
}

fn apply_attr(node: &mut Node, attr: SetAttr) {
    if let Some(mode) = attr.mode {
        node.mode = (node.mode & libc::S_IFMT) | (mode & 0o7777);
    }
    if let Some(uid) = attr.uid {
        node.uid = uid;
    }
    if let Some(gid) = attr.gid {
        node.gid = gid;
    }
    if let Some(atime) = attr.atime {
        node.atime = atime;
    }
    if let Some(mtime) = attr.mtime {
        node.mtime = mtime;
    }
    node.ctime = chrono::Utc::now().timestamp();
}

/// Serves [`ExtentRequest`]s planned by [`MemoryBackend::read_requests`].
pub struct MemoryExtentReader {
    store: Arc<MemoryStore>,
    failing: AtomicBool,
    reads: AtomicU64,
}

impl MemoryExtentReader {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            failing: AtomicBool::new(false),
            reads: AtomicU64::new(0),
        }
    }

    /// Make every subsequent extent read fail with EIO.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl ExtentReader for MemoryExtentReader {
    fn read_extent(&self, req: &ExtentRequest, buf: &mut [u8]) -> BackendResult<usize> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(Errno::EIO);
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        let len = buf.len().min(req.size);
        self.store.read_extent(req.extent_id, &mut buf[..len], req.extent_offset)
    }
}
