pub mod data;
pub mod fdspace;
pub mod handles;
pub mod inodes;
pub mod passthrough;
pub mod path;
pub mod replica;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use nix::errno::Errno;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use self::fdspace::{untag_fd, AliasSlot, FdSpace};
use self::handles::{FileTable, FileType, OpenFile};
use self::inodes::{InodeInfo, InodeRegistry};
use self::path::{join_path, Cwd, PathClassifier};
use self::replica::Replica;
use crate::backend::{
    BackendResult, BackendSlot, DirEntry, ExtentReader, Fd, FileLock, FileStat, SetAttr, StorageBackend,
};
use crate::cache::flusher::Flusher;
use crate::cache::CacheSet;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Open-file status flags that `F_SETFL` may change.
const SETFL_MASK: i32 = libc::O_APPEND | libc::O_NONBLOCK | libc::O_DIRECT | libc::O_NOATIME;

/// Poll interval of `F_SETLKW` while the lock is held elsewhere.
const LOCK_WAIT_TICK: Duration = Duration::from_millis(10);

/// Symlinks `realpath` follows before giving up with ELOOP.
const MAX_LINK_HOPS: u32 = 40;

/// `fcntl` commands understood for in-mount descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcntlCmd {
    DupFd(Fd),
    DupFdCloexec(Fd),
    GetFd,
    SetFd(i32),
    GetFl,
    SetFl(i32),
    SetLock(FileLock),
    SetLockWait(FileLock),
}

/// Result of `statx`. The SDK keeps no birth time, so a requested
/// `STATX_BTIME` is answered with the change time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statx {
    pub mask: u32,
    pub stat: FileStat,
    pub btime: Option<i64>,
}

fn check_len(len: i64) -> Result<u64> {
    u64::try_from(len).map_err(|_| ClientError::InvalidArgument(format!("negative length {}", len)))
}

fn is_writable(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY
}

/// The per-process client: every table, both caches and the backend
/// connection, shared by all threads of the process.
///
/// Methods are shaped after the intercepted calls. A call that does not
/// concern the mount returns [`ClientError::Passthrough`] so the caller can
/// forward it to the native implementation.
pub struct Client {
    pub(crate) config: ClientConfig,
    pub(crate) classifier: PathClassifier,
    pub(crate) backend: BackendSlot,
    pub(crate) extent_reader: RwLock<Option<Arc<dyn ExtentReader>>>,
    pub(crate) fds: FdSpace,
    pub(crate) files: FileTable,
    pub(crate) inodes: InodeRegistry,
    /// `FD_CLOEXEC` per visible descriptor.
    pub(crate) fd_flags: DashMap<Fd, i32>,
    pub(crate) cwd: RwLock<Cwd>,
    pub(crate) replica: Option<Replica>,
    /// Held shared by every operation and exclusively by snapshot, restore
    /// and backend reload.
    pub(crate) gate: RwLock<()>,
    pub(crate) flusher: Mutex<Option<Flusher>>,
}

impl Client {
    pub fn new(mut config: ClientConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        config.validate()?;
        let classifier = PathClassifier::new(&config.mount_point, config.ignore_prefixes());
        let caches = CacheSet::new(&config.cache);
        let replica = config.replicate_path.as_deref().map(Replica::new).transpose()?;

        let cwd = match std::env::current_dir() {
            Ok(dir) => {
                let dir = dir.to_string_lossy().into_owned();
                match classifier.classify(&dir, &Cwd::default()) {
                    Some(in_mount) => Cwd::mount(in_mount),
                    None => Cwd::native(dir),
                }
            }
            Err(_) => Cwd::default(),
        };

        let client = Self {
            inodes: InodeRegistry::new(caches, config.cache.write_back_regular),
            classifier,
            backend: BackendSlot::new(backend),
            extent_reader: RwLock::new(None),
            fds: FdSpace::new(),
            files: FileTable::new(),
            fd_flags: DashMap::new(),
            cwd: RwLock::new(cwd),
            replica,
            gate: RwLock::new(()),
            flusher: Mutex::new(None),
            config,
        };
        client.start_flusher()?;
        info!(
            "client ready: mount_point={}, replicate={:?}",
            client.config.mount_point, client.config.replicate_path
        );
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn classifier(&self) -> &PathClassifier {
        &self.classifier
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.current()
    }

    pub fn caches(&self) -> &CacheSet {
        self.inodes.caches()
    }

    pub fn inodes(&self) -> &InodeRegistry {
        &self.inodes
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn fd_space(&self) -> &FdSpace {
        &self.fds
    }

    /// Install or remove the direct extent read path.
    pub fn set_extent_reader(&self, reader: Option<Arc<dyn ExtentReader>>) {
        *self.extent_reader.write() = reader;
    }

    pub(crate) fn extent_reader(&self) -> Option<Arc<dyn ExtentReader>> {
        self.extent_reader.read().clone()
    }

    pub fn is_in_scope(&self, fd: Fd) -> bool {
        self.fds.is_in_scope(fd)
    }

    pub(crate) fn start_flusher(&self) -> Result<()> {
        let flusher = Flusher::start(
            self.inodes.caches().clone(),
            self.backend.clone(),
            self.config.cache.flush_interval(),
            self.config.cache.dirty_age(),
        )?;
        *self.flusher.lock() = Some(flusher);
        Ok(())
    }

    pub(crate) fn stop_flusher(&self) {
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.stop();
        }
    }

    /// The open file behind a visible descriptor.
    pub(crate) fn open_file(&self, fd: Fd) -> Result<Arc<OpenFile>> {
        let resolved = self.fds.resolve(fd).ok_or(ClientError::Passthrough)?;
        let file = self.files.get(resolved.sdk_fd).ok_or(ClientError::BadFd(fd))?;
        if !resolved.is_alias && !file.state().primary_open {
            return Err(ClientError::BadFd(fd));
        }
        Ok(file)
    }

    /// In-mount path for a process path, or `Passthrough`.
    pub(crate) fn mount_path(&self, path: &str) -> Result<String> {
        self.classifier
            .classify(path, &self.cwd.read())
            .ok_or(ClientError::Passthrough)
    }

    /// In-mount path for an `*at` call.
    pub(crate) fn at_path(&self, dirfd: Fd, path: &str) -> Result<String> {
        if path.starts_with('/') || dirfd == libc::AT_FDCWD {
            return self.mount_path(path);
        }
        if !self.fds.is_in_scope(dirfd) {
            return Err(ClientError::Passthrough);
        }
        let dir = self.open_file(dirfd)?;
        Ok(join_path(&dir.path, path))
    }

    /// Like `at_path`, but a native path yields `None`.
    fn at_path_opt(&self, dirfd: Fd, path: &str) -> Result<Option<String>> {
        match self.at_path(dirfd, path) {
            Ok(path) => Ok(Some(path)),
            Err(ClientError::Passthrough) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Run the local half of a mirrored operation and compare outcomes.
    fn mirrored<T>(
        &self,
        op: &str,
        path: &str,
        remote: Result<T>,
        local: impl FnOnce(&Replica) -> std::io::Result<()>,
    ) -> Result<T> {
        if let Some(replica) = &self.replica {
            replica.compare_outcome(op, path, &remote, local(replica))?;
        }
        remote
    }

    /// Replace a backend-reported size with the locally authoritative one
    /// when the inode is open.
    fn with_cached_size(&self, mut st: FileStat) -> FileStat {
        if st.is_file() {
            if let Some(inode) = self.inodes.lookup(st.ino) {
                st.size = inode.size();
                st.blocks = st.size.div_ceil(512);
            }
        }
        st
    }

    // -----------------------------------------------------------------------
    // Open / close
    // -----------------------------------------------------------------------

    pub fn open(&self, path: &str, flags: i32, mode: u32) -> Result<Fd> {
        let _gate = self.gate.read();
        let path = self.mount_path(path)?;
        self.open_locked(&path, flags, mode)
    }

    pub fn openat(&self, dirfd: Fd, path: &str, flags: i32, mode: u32) -> Result<Fd> {
        let _gate = self.gate.read();
        let path = self.at_path(dirfd, path)?;
        self.open_locked(&path, flags, mode)
    }

    pub fn creat(&self, path: &str, mode: u32) -> Result<Fd> {
        self.open(path, libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, mode)
    }

    pub fn opendir(&self, path: &str) -> Result<Fd> {
        self.open(path, libc::O_RDONLY | libc::O_DIRECTORY, 0)
    }

    fn open_locked(&self, path: &str, flags: i32, mode: u32) -> Result<Fd> {
        let backend = self.backend.current();
        let sdk_fd = match backend.open(path, flags, mode) {
            Ok(fd) => fd,
            Err(e) => {
                let remote: Result<()> = Err(e.into());
                let local_flags = flags & !(libc::O_APPEND | libc::O_DIRECT);
                self.mirrored("open", path, remote, |r| {
                    passthrough::open_local(&r.local_path(path), local_flags, mode).map(|_| ())
                })?;
                return Err(e.into());
            }
        };
        let sdk_fd = match FdSpace::check_sdk_fd(sdk_fd) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = backend.close(sdk_fd);
                return Err(e);
            }
        };
        let info = match backend.file_info(sdk_fd) {
            Ok(info) => info,
            Err(e) => {
                let _ = backend.close(sdk_fd);
                return Err(e.into());
            }
        };

        let file_type = FileType::classify(path, info.is_dir());
        let inode = self.inodes.acquire(info.ino, file_type, info.size, info.client_id);
        if flags & libc::O_TRUNC != 0 && is_writable(flags) && !info.is_dir() {
            inode.discard_beyond(0);
        }
        let file = self.files.register(OpenFile::new(sdk_fd, path.to_string(), flags, file_type, inode));
        let fd = file.visible_fd();
        if flags & libc::O_CLOEXEC != 0 {
            self.fd_flags.insert(fd, libc::FD_CLOEXEC);
        }
        if let Some(replica) = &self.replica {
            if let Err(e) = replica.open(sdk_fd, path, flags, mode) {
                let _ = self.close_locked(fd);
                return Err(e);
            }
        }
        debug!(
            "open {} flags={:#o} -> fd {} (ino {}, {:?})",
            path, flags, fd, info.ino, file_type
        );
        Ok(fd)
    }

    pub fn close(&self, fd: Fd) -> Result<()> {
        let _gate = self.gate.read();
        self.close_locked(fd)
    }

    fn close_locked(&self, fd: Fd) -> Result<()> {
        let resolved = self.fds.resolve(fd).ok_or(ClientError::Passthrough)?;
        let backend = self.backend.current();
        if resolved.is_alias {
            if let Some(alias) = self.fds.remove_alias(fd) {
                if alias.owns_slot {
                    backend.release_fd(untag_fd(fd));
                }
            }
        }
        self.fd_flags.remove(&fd);
        self.files.close(
            resolved.sdk_fd,
            !resolved.is_alias,
            &self.inodes,
            &*backend,
            |file| {
                if let Some(replica) = &self.replica {
                    replica.close(file.fd);
                }
            },
        )?;
        debug!("close fd {}", fd);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Descriptor duplication
    // -----------------------------------------------------------------------

    pub fn dup(&self, fd: Fd) -> Result<Fd> {
        let _gate = self.gate.read();
        self.alias_locked(fd, AliasSlot::Any, 0)
    }

    /// Make `new` refer to the open file behind `old`. An in-mount occupant of
    /// `new` is closed first; a native occupant must be closed by the caller.
    pub fn dup2(&self, old: Fd, new: Fd) -> Result<Fd> {
        let _gate = self.gate.read();
        self.dup2_locked(old, new, 0)
    }

    pub fn dup3(&self, old: Fd, new: Fd, flags: i32) -> Result<Fd> {
        let _gate = self.gate.read();
        if old == new {
            return Err(ClientError::InvalidArgument("dup3 onto the same descriptor".to_string()));
        }
        if flags & !libc::O_CLOEXEC != 0 {
            return Err(ClientError::InvalidArgument(format!("dup3 flags {:#o}", flags)));
        }
        let fd_flags = if flags & libc::O_CLOEXEC != 0 { libc::FD_CLOEXEC } else { 0 };
        self.dup2_locked(old, new, fd_flags)
    }

    fn dup2_locked(&self, old: Fd, new: Fd, fd_flags: i32) -> Result<Fd> {
        self.open_file(old)?;
        if new < 0 {
            return Err(ClientError::BadFd(new));
        }
        if old == new {
            return Ok(new);
        }
        if self.fds.is_in_scope(new) {
            match self.close_locked(new) {
                Ok(()) | Err(ClientError::BadFd(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.alias_locked(old, AliasSlot::Exact(new), fd_flags)
    }

    fn alias_locked(&self, fd: Fd, slot: AliasSlot, fd_flags: i32) -> Result<Fd> {
        let file = self.open_file(fd)?;
        let backend = self.backend.current();
        let new_fd = self.fds.allocate_alias(file.fd, slot, &self.files, &*backend)?;
        if fd_flags != 0 {
            self.fd_flags.insert(new_fd, fd_flags);
        }
        debug!("dup fd {} -> {}", fd, new_fd);
        Ok(new_fd)
    }

    pub fn fcntl(&self, fd: Fd, cmd: FcntlCmd) -> Result<i32> {
        if let FcntlCmd::SetLockWait(lock) = cmd {
            return self.wait_lock(fd, lock);
        }
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        match cmd {
            FcntlCmd::DupFd(min) => self.alias_locked(fd, AliasSlot::AtLeast(min), 0),
            FcntlCmd::DupFdCloexec(min) => {
                self.alias_locked(fd, AliasSlot::AtLeast(min), libc::FD_CLOEXEC)
            }
            FcntlCmd::GetFd => Ok(self.fd_flags.get(&fd).map(|f| *f).unwrap_or(0)),
            FcntlCmd::SetFd(flags) => {
                if flags & libc::FD_CLOEXEC != 0 {
                    self.fd_flags.insert(fd, libc::FD_CLOEXEC);
                } else {
                    self.fd_flags.remove(&fd);
                }
                Ok(0)
            }
            FcntlCmd::GetFl => Ok(file.flags()),
            FcntlCmd::SetFl(flags) => {
                let mut state = file.lock();
                state.flags = (state.flags & !SETFL_MASK) | (flags & SETFL_MASK);
                Ok(0)
            }
            FcntlCmd::SetLock(lock) => {
                self.backend.current().set_lock(file.fd, lock)?;
                Ok(0)
            }
            FcntlCmd::SetLockWait(_) => Err(ClientError::InvalidArgument("F_SETLKW".to_string())),
        }
    }

    /// `F_SETLKW`: retry until the lock is granted. The operation gate is
    /// only held per attempt.
    fn wait_lock(&self, fd: Fd, lock: FileLock) -> Result<i32> {
        loop {
            let attempt = {
                let _gate = self.gate.read();
                let file = self.open_file(fd)?;
                self.backend.current().set_lock(file.fd, lock)
            };
            match attempt {
                Ok(()) => return Ok(0),
                Err(Errno::EAGAIN) => std::thread::sleep(LOCK_WAIT_TICK),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `F_GETLK`: the first lock held elsewhere that conflicts with `lock`.
    pub fn get_lock(&self, fd: Fd, lock: FileLock) -> Result<Option<FileLock>> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        Ok(self.backend.current().get_lock(file.fd, lock)?)
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let _gate = self.gate.read();
        let path = self.mount_path(path)?;
        let st = self.backend.current().stat(&path, true)?;
        Ok(self.with_cached_size(st))
    }

    pub fn lstat(&self, path: &str) -> Result<FileStat> {
        let _gate = self.gate.read();
        let path = self.mount_path(path)?;
        let st = self.backend.current().stat(&path, false)?;
        Ok(self.with_cached_size(st))
    }

    pub fn fstat(&self, fd: Fd) -> Result<FileStat> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        let mut st = self.backend.current().fstat(file.fd)?;
        if st.is_file() {
            st.size = file.inode.size();
            st.blocks = st.size.div_ceil(512);
        }
        Ok(st)
    }

    pub fn fstatat(&self, dirfd: Fd, path: &str, flags: i32) -> Result<FileStat> {
        if path.is_empty() && flags & libc::AT_EMPTY_PATH != 0 {
            return self.fstat(dirfd);
        }
        let _gate = self.gate.read();
        let path = self.at_path(dirfd, path)?;
        let follow = flags & libc::AT_SYMLINK_NOFOLLOW == 0;
        let st = self.backend.current().stat(&path, follow)?;
        Ok(self.with_cached_size(st))
    }

    pub fn statx(&self, dirfd: Fd, path: &str, flags: i32, mask: u32) -> Result<Statx> {
        let stat = self.fstatat(dirfd, path, flags)?;
        let mut statx = Statx { mask: libc::STATX_BASIC_STATS, stat, btime: None };
        if mask & libc::STATX_BTIME != 0 {
            statx.mask |= libc::STATX_BTIME;
            statx.btime = Some(stat.ctime);
        }
        Ok(statx)
    }

    pub fn truncate(&self, path: &str, len: i64) -> Result<()> {
        let _gate = self.gate.read();
        let len = check_len(len)?;
        let path = self.mount_path(path)?;
        let backend = self.backend.current();
        let open_inode = backend
            .stat(&path, true)
            .ok()
            .and_then(|st| self.inodes.lookup(st.ino));
        if let Some(inode) = &open_inode {
            inode.flush(&*backend)?;
        }
        let remote = backend.truncate(&path, len).map_err(ClientError::from);
        self.mirrored("truncate", &path, remote, |r| r.truncate(&path, len))?;
        if let Some(inode) = open_inode {
            inode.discard_beyond(len);
        }
        debug!("truncate {} to {}", path, len);
        Ok(())
    }

    pub fn ftruncate(&self, fd: Fd, len: i64) -> Result<()> {
        let _gate = self.gate.read();
        let len = check_len(len)?;
        let file = self.open_file(fd)?;
        if !is_writable(file.flags()) {
            return Err(ClientError::InvalidArgument("descriptor not open for writing".to_string()));
        }
        let backend = self.backend.current();
        file.inode.flush(&*backend)?;
        let remote = backend.ftruncate(file.fd, len).map_err(ClientError::from);
        self.mirrored("ftruncate", &file.path, remote, |r| r.ftruncate(file.fd, len))?;
        file.inode.discard_beyond(len);
        debug!("ftruncate fd {} to {}", fd, len);
        Ok(())
    }

    pub fn fallocate(&self, fd: Fd, mode: i32, offset: i64, len: i64) -> Result<()> {
        let _gate = self.gate.read();
        let offset = check_len(offset)?;
        let len = check_len(len)?;
        let file = self.open_file(fd)?;
        let remote = self.backend.current().fallocate(file.fd, mode, offset, len).map_err(ClientError::from);
        self.mirrored("fallocate", &file.path, remote, |r| r.fallocate(file.fd, mode, offset, len))?;
        if mode == 0 {
            file.inode.grow_to(offset + len);
        }
        Ok(())
    }

    pub fn posix_fallocate(&self, fd: Fd, offset: i64, len: i64) -> Result<()> {
        if offset < 0 || len <= 0 {
            return Err(ClientError::InvalidArgument(format!("posix_fallocate {} + {}", offset, len)));
        }
        self.fallocate(fd, 0, offset, len)
    }

    /// Write back cached data and ask the SDK to persist the descriptor.
    pub fn fsync(&self, fd: Fd) -> Result<()> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        let backend = self.backend.current();
        file.inode.flush(&*backend)?;
        backend.flush(file.fd)?;
        Ok(())
    }

    pub fn fdatasync(&self, fd: Fd) -> Result<()> {
        self.fsync(fd)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let _gate = self.gate.read();
        let path = self.mount_path(path)?;
        self.unlink_locked(&path)
    }

    fn unlink_locked(&self, path: &str) -> Result<()> {
        let remote = self.backend.current().unlink(path).map_err(ClientError::from);
        self.mirrored("unlink", path, remote, |r| r.unlink(path))?;
        debug!("unlink {}", path);
        Ok(())
    }

    pub fn unlinkat(&self, dirfd: Fd, path: &str, flags: i32) -> Result<()> {
        let _gate = self.gate.read();
        let path = self.at_path(dirfd, path)?;
        if flags & libc::AT_REMOVEDIR != 0 {
            self.rmdir_locked(&path)
        } else {
            self.unlink_locked(&path)
        }
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let _gate = self.gate.read();
        let cwd = self.cwd.read().clone();
        let from = self.classifier.classify(from, &cwd);
        let to = self.classifier.classify(to, &cwd);
        self.rename_locked(from, to, 0)
    }

    pub fn renameat2(&self, olddirfd: Fd, old: &str, newdirfd: Fd, new: &str, flags: u32) -> Result<()> {
        let _gate = self.gate.read();
        let from = self.at_path(olddirfd, old).ok();
        let to = self.at_path(newdirfd, new).ok();
        self.rename_locked(from, to, flags)
    }

    fn rename_locked(&self, from: Option<String>, to: Option<String>, flags: u32) -> Result<()> {
        let (from, to) = match (from, to) {
            (Some(from), Some(to)) => (from, to),
            (None, None) => return Err(ClientError::Passthrough),
            _ => return Err(Errno::EXDEV.into()),
        };
        let backend = self.backend.current();
        match flags {
            0 => {}
            libc::RENAME_NOREPLACE => {
                if backend.stat(&to, false).is_ok() {
                    return Err(Errno::EEXIST.into());
                }
            }
            _ => return Err(ClientError::InvalidArgument(format!("rename flags {:#x}", flags))),
        }
        let remote = backend.rename(&from, &to).map_err(ClientError::from);
        self.mirrored("rename", &from, remote, |r| r.rename(&from, &to))?;
        debug!("rename {} -> {}", from, to);
        Ok(())
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let _gate = self.gate.read();
        let path = self.mount_path(path)?;
        self.mkdir_locked(&path, mode)
    }

    pub fn mkdirat(&self, dirfd: Fd, path: &str, mode: u32) -> Result<()> {
        let _gate = self.gate.read();
        let path = self.at_path(dirfd, path)?;
        self.mkdir_locked(&path, mode)
    }

    fn mkdir_locked(&self, path: &str, mode: u32) -> Result<()> {
        let remote = self.backend.current().mkdir(path, mode).map_err(ClientError::from);
        self.mirrored("mkdir", path, remote, |r| r.mkdir(path, mode))
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let _gate = self.gate.read();
        let path = self.mount_path(path)?;
        self.rmdir_locked(&path)
    }

    fn rmdir_locked(&self, path: &str) -> Result<()> {
        let remote = self.backend.current().rmdir(path).map_err(ClientError::from);
        self.mirrored("rmdir", path, remote, |r| r.rmdir(path))
    }

    /// Next directory entries of an open directory, advancing its cursor.
    pub fn readdir(&self, fd: Fd, max: usize) -> Result<Vec<DirEntry>> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        let mut state = file.lock();
        let entries = self.backend.current().readdir(file.fd, state.pos as usize, max)?;
        state.pos += entries.len() as u64;
        Ok(entries)
    }

    pub fn link(&self, from: &str, to: &str) -> Result<()> {
        let _gate = self.gate.read();
        let cwd = self.cwd.read().clone();
        let from = self.classifier.classify(from, &cwd);
        let to = self.classifier.classify(to, &cwd);
        self.link_locked(from, to, false)
    }

    pub fn linkat(&self, olddirfd: Fd, old: &str, newdirfd: Fd, new: &str, flags: i32) -> Result<()> {
        if flags & !(libc::AT_SYMLINK_FOLLOW | libc::AT_EMPTY_PATH) != 0 {
            return Err(ClientError::InvalidArgument(format!("linkat flags {:#x}", flags)));
        }
        let _gate = self.gate.read();
        let from = if old.is_empty() && flags & libc::AT_EMPTY_PATH != 0 {
            if !self.fds.is_in_scope(olddirfd) {
                return Err(ClientError::Passthrough);
            }
            Some(self.open_file(olddirfd)?.path.clone())
        } else {
            self.at_path_opt(olddirfd, old)?
        };
        let to = self.at_path_opt(newdirfd, new)?;
        self.link_locked(from, to, flags & libc::AT_SYMLINK_FOLLOW != 0)
    }

    /// Links between the mount and the native filesystem are refused.
    fn link_locked(&self, from: Option<String>, to: Option<String>, follow: bool) -> Result<()> {
        let (from, to) = match (from, to) {
            (Some(from), Some(to)) => (from, to),
            (None, None) => return Err(ClientError::Passthrough),
            _ => return Err(Errno::EXDEV.into()),
        };
        let from = if follow { self.resolve_links(&from)? } else { from };
        let remote = self.backend.current().link(&from, &to).map_err(ClientError::from);
        self.mirrored("link", &to, remote, |r| r.link(&from, &to))?;
        debug!("link {} -> {}", to, from);
        Ok(())
    }

    /// Create `link` pointing at `target`. A relative target is stored as
    /// given. An absolute one must lie inside the mount and is stored as its
    /// in-mount path.
    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let _gate = self.gate.read();
        let link = self.mount_path(link)?;
        self.symlink_locked(target, &link)
    }

    pub fn symlinkat(&self, target: &str, dirfd: Fd, link: &str) -> Result<()> {
        let _gate = self.gate.read();
        let link = self.at_path(dirfd, link)?;
        self.symlink_locked(target, &link)
    }

    fn symlink_locked(&self, target: &str, link: &str) -> Result<()> {
        if target.is_empty() {
            return Err(Errno::ENOENT.into());
        }
        let stored = if target.starts_with('/') {
            self.classifier
                .classify(target, &Cwd::default())
                .ok_or(ClientError::Backend(Errno::EXDEV))?
        } else {
            target.to_string()
        };
        let remote = self.backend.current().symlink(&stored, link).map_err(ClientError::from);
        self.mirrored("symlink", link, remote, |r| r.symlink(&stored, link))?;
        debug!("symlink {} -> {}", link, stored);
        Ok(())
    }

    /// The stored target, with in-mount absolute targets turned back into
    /// process paths.
    pub fn readlink(&self, path: &str) -> Result<String> {
        let _gate = self.gate.read();
        let path = self.mount_path(path)?;
        self.readlink_locked(&path)
    }

    pub fn readlinkat(&self, dirfd: Fd, path: &str) -> Result<String> {
        let _gate = self.gate.read();
        let path = self.at_path(dirfd, path)?;
        self.readlink_locked(&path)
    }

    fn readlink_locked(&self, path: &str) -> Result<String> {
        let target = self.backend.current().readlink(path)?;
        if target.starts_with('/') {
            Ok(self.classifier.process_path(&target))
        } else {
            Ok(target)
        }
    }

    /// Canonical process path of `path` with every symlink resolved.
    pub fn realpath(&self, path: &str) -> Result<String> {
        let _gate = self.gate.read();
        let path = self.mount_path(path)?;
        let resolved = self.resolve_links(&path)?;
        Ok(self.classifier.process_path(&resolved))
    }

    /// Resolve every symlink along an in-mount path. Each component must
    /// exist.
    fn resolve_links(&self, path: &str) -> Result<String> {
        fn components(path: &str) -> VecDeque<String> {
            path.split('/').filter(|c| !c.is_empty()).map(str::to_string).collect()
        }

        let backend = self.backend.current();
        let mut pending = components(path);
        let mut resolved = String::from("/");
        let mut hops = 0;
        while let Some(name) = pending.pop_front() {
            let candidate = join_path(&resolved, &name);
            if !backend.stat(&candidate, false)?.is_symlink() {
                resolved = candidate;
                continue;
            }
            hops += 1;
            if hops > MAX_LINK_HOPS {
                return Err(Errno::ELOOP.into());
            }
            let target = join_path(&resolved, &backend.readlink(&candidate)?);
            let mut next = components(&target);
            next.extend(pending.drain(..));
            pending = next;
            resolved = String::from("/");
        }
        Ok(resolved)
    }

    pub fn access(&self, path: &str, mode: i32) -> Result<()> {
        let _gate = self.gate.read();
        let path = self.mount_path(path)?;
        Ok(self.backend.current().access(&path, mode)?)
    }

    pub fn faccessat(&self, dirfd: Fd, path: &str, mode: i32, flags: i32) -> Result<()> {
        if flags & !(libc::AT_EACCESS | libc::AT_SYMLINK_NOFOLLOW) != 0 {
            return Err(ClientError::InvalidArgument(format!("faccessat flags {:#x}", flags)));
        }
        let _gate = self.gate.read();
        let path = self.at_path(dirfd, path)?;
        Ok(self.backend.current().access(&path, mode)?)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.set_attr(path, SetAttr { mode: Some(mode), ..SetAttr::default() })
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.set_attr(path, SetAttr { uid: Some(uid), gid: Some(gid), ..SetAttr::default() })
    }

    /// chown(2) on the link itself.
    pub fn lchown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let attr = SetAttr { uid: Some(uid), gid: Some(gid), ..SetAttr::default() };
        self.set_attr_at(libc::AT_FDCWD, path, attr, libc::AT_SYMLINK_NOFOLLOW)
    }

    pub fn utimens(&self, path: &str, atime: Option<i64>, mtime: Option<i64>) -> Result<()> {
        self.set_attr(path, SetAttr { atime, mtime, ..SetAttr::default() })
    }

    pub fn set_attr(&self, path: &str, attr: SetAttr) -> Result<()> {
        self.set_attr_at(libc::AT_FDCWD, path, attr, 0)
    }

    pub fn fchmodat(&self, dirfd: Fd, path: &str, mode: u32, flags: i32) -> Result<()> {
        self.set_attr_at(dirfd, path, SetAttr { mode: Some(mode), ..SetAttr::default() }, flags)
    }

    pub fn fchownat(&self, dirfd: Fd, path: &str, uid: u32, gid: u32, flags: i32) -> Result<()> {
        let attr = SetAttr { uid: Some(uid), gid: Some(gid), ..SetAttr::default() };
        self.set_attr_at(dirfd, path, attr, flags)
    }

    pub fn utimensat(&self, dirfd: Fd, path: &str, atime: Option<i64>, mtime: Option<i64>, flags: i32) -> Result<()> {
        self.set_attr_at(dirfd, path, SetAttr { atime, mtime, ..SetAttr::default() }, flags)
    }

    /// Attribute change relative to `dirfd`. `AT_EMPTY_PATH` targets the
    /// descriptor itself and `AT_SYMLINK_NOFOLLOW` the final link.
    pub fn set_attr_at(&self, dirfd: Fd, path: &str, attr: SetAttr, flags: i32) -> Result<()> {
        if flags & !(libc::AT_SYMLINK_NOFOLLOW | libc::AT_EMPTY_PATH) != 0 {
            return Err(ClientError::InvalidArgument(format!("attribute flags {:#x}", flags)));
        }
        if path.is_empty() && flags & libc::AT_EMPTY_PATH != 0 {
            return self.fset_attr(dirfd, attr);
        }
        let _gate = self.gate.read();
        let path = self.at_path(dirfd, path)?;
        let follow = flags & libc::AT_SYMLINK_NOFOLLOW == 0;
        Ok(self.backend.current().set_attr(&path, attr, follow)?)
    }

    pub fn fchmod(&self, fd: Fd, mode: u32) -> Result<()> {
        self.fset_attr(fd, SetAttr { mode: Some(mode), ..SetAttr::default() })
    }

    pub fn fchown(&self, fd: Fd, uid: u32, gid: u32) -> Result<()> {
        self.fset_attr(fd, SetAttr { uid: Some(uid), gid: Some(gid), ..SetAttr::default() })
    }

    pub fn futimens(&self, fd: Fd, atime: Option<i64>, mtime: Option<i64>) -> Result<()> {
        self.fset_attr(fd, SetAttr { atime, mtime, ..SetAttr::default() })
    }

    pub fn fset_attr(&self, fd: Fd, attr: SetAttr) -> Result<()> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        Ok(self.backend.current().fset_attr(file.fd, attr)?)
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> Result<()> {
        self.path_xattr(path, |b, p| b.set_xattr(p, name, value, flags, true))
    }

    pub fn lsetxattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> Result<()> {
        self.path_xattr(path, |b, p| b.set_xattr(p, name, value, flags, false))
    }

    pub fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        self.path_xattr(path, |b, p| b.get_xattr(p, name, true))
    }

    pub fn lgetxattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        self.path_xattr(path, |b, p| b.get_xattr(p, name, false))
    }

    pub fn listxattr(&self, path: &str) -> Result<Vec<String>> {
        self.path_xattr(path, |b, p| b.list_xattr(p, true))
    }

    pub fn llistxattr(&self, path: &str) -> Result<Vec<String>> {
        self.path_xattr(path, |b, p| b.list_xattr(p, false))
    }

    pub fn removexattr(&self, path: &str, name: &str) -> Result<()> {
        self.path_xattr(path, |b, p| b.remove_xattr(p, name, true))
    }

    pub fn lremovexattr(&self, path: &str, name: &str) -> Result<()> {
        self.path_xattr(path, |b, p| b.remove_xattr(p, name, false))
    }

    fn path_xattr<T>(
        &self,
        path: &str,
        op: impl FnOnce(&dyn StorageBackend, &str) -> BackendResult<T>,
    ) -> Result<T> {
        let _gate = self.gate.read();
        let path = self.mount_path(path)?;
        Ok(op(&*self.backend.current(), &path)?)
    }

    /// Extended attributes by descriptor resolve through the path the file
    /// was opened with.
    pub fn fgetxattr(&self, fd: Fd, name: &str) -> Result<Vec<u8>> {
        self.fd_xattr(fd, |b, p| b.get_xattr(p, name, true))
    }

    pub fn fsetxattr(&self, fd: Fd, name: &str, value: &[u8], flags: i32) -> Result<()> {
        self.fd_xattr(fd, |b, p| b.set_xattr(p, name, value, flags, true))
    }

    pub fn flistxattr(&self, fd: Fd) -> Result<Vec<String>> {
        self.fd_xattr(fd, |b, p| b.list_xattr(p, true))
    }

    pub fn fremovexattr(&self, fd: Fd, name: &str) -> Result<()> {
        self.fd_xattr(fd, |b, p| b.remove_xattr(p, name, true))
    }

    fn fd_xattr<T>(
        &self,
        fd: Fd,
        op: impl FnOnce(&dyn StorageBackend, &str) -> BackendResult<T>,
    ) -> Result<T> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        Ok(op(&*self.backend.current(), &file.path)?)
    }

    // -----------------------------------------------------------------------
    // Working directory
    // -----------------------------------------------------------------------

    pub fn chdir(&self, path: &str) -> Result<()> {
        let _gate = self.gate.read();
        let path = self.mount_path(path)?;
        let st = self.backend.current().stat(&path, true)?;
        if !st.is_dir() {
            return Err(Errno::ENOTDIR.into());
        }
        *self.cwd.write() = Cwd::mount(path);
        Ok(())
    }

    pub fn fchdir(&self, fd: Fd) -> Result<()> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        let st = self.backend.current().fstat(file.fd)?;
        if !st.is_dir() {
            return Err(Errno::ENOTDIR.into());
        }
        *self.cwd.write() = Cwd::mount(file.path.clone());
        Ok(())
    }

    /// Record a working directory change performed natively.
    pub fn note_native_chdir(&self, path: &str) {
        *self.cwd.write() = Cwd::native(path);
    }

    /// The working directory as the process should see it, when it is in
    /// the mount.
    pub fn getcwd(&self) -> Result<String> {
        let cwd = self.cwd.read();
        if !cwd.in_mount {
            return Err(ClientError::Passthrough);
        }
        Ok(self.classifier.process_path(&cwd.path))
    }

    pub fn cwd(&self) -> Cwd {
        self.cwd.read().clone()
    }

    /// Inode state behind a visible descriptor.
    pub fn inode_of(&self, fd: Fd) -> Result<Arc<InodeInfo>> {
        Ok(Arc::clone(&self.open_file(fd)?.inode))
    }

    /// Write back every dirty block of every open inode.
    pub fn flush_all(&self) -> Result<()> {
        let _gate = self.gate.read();
        self.flush_all_locked()
    }

    pub(crate) fn flush_all_locked(&self) -> Result<()> {
        let backend = self.backend.current();
        for inode in self.inodes.all() {
            inode.flush(&*backend)?;
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop_flusher();
        if let Err(e) = self.flush_all_locked() {
            warn!("flush on client teardown failed: {}", e);
        }
    }
}
