//! The storage SDK boundary.
//!
//! Everything the interception core needs from the distributed storage client
//! is expressed by [`StorageBackend`]; the direct extent fetch path used by
//! the data path is [`ExtentReader`]. Failures are plain errno values so they
//! can be reported to the intercepted caller unchanged.

pub mod memory;

use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub type Fd = i32;
pub type Ino = u64;

pub type BackendResult<T> = std::result::Result<T, Errno>;

/// What the SDK reports about a freshly opened descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub ino: Ino,
    pub size: u64,
    pub mode: u32,
    pub client_id: i64,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub ino: Ino,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: Ino,
    pub name: String,
    pub kind: u8,
}

/// Attribute changes applied by chmod/chown/utimens. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
    Unlock,
}

/// A POSIX record lock as carried by `F_SETLK`/`F_GETLK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLock {
    pub kind: LockKind,
    pub start: u64,
    /// Zero means "to end of file".
    pub len: u64,
    pub pid: i32,
}

/// One read request against a single extent, as planned by the SDK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentRequest {
    pub file_offset: u64,
    pub size: usize,
    /// Zero marks a hole that reads back as zeroes.
    pub partition_id: u64,
    pub extent_id: u64,
    pub extent_offset: u64,
    pub host: String,
    pub port: u16,
}

impl ExtentRequest {
    pub fn is_hole(&self) -> bool {
        self.partition_id == 0
    }
}

/// The storage SDK as seen by the interception core.
///
/// Descriptors handed out by `open` are SDK descriptors; the core tags them
/// before exposing them to the process. `alloc_fd`/`release_fd` manage bare
/// descriptor slots used for dup aliases.
pub trait StorageBackend: Send + Sync {
    fn open(&self, path: &str, flags: i32, mode: u32) -> BackendResult<Fd>;
    fn file_info(&self, fd: Fd) -> BackendResult<FileInfo>;
    fn close(&self, fd: Fd) -> BackendResult<()>;

    /// Reserve the lowest free descriptor slot that is `>= min`.
    fn alloc_fd(&self, min: Fd) -> BackendResult<Fd>;
    fn release_fd(&self, fd: Fd);

    fn stat(&self, path: &str, follow: bool) -> BackendResult<FileStat>;
    fn fstat(&self, fd: Fd) -> BackendResult<FileStat>;

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> BackendResult<usize>;
    fn pwrite(&self, fd: Fd, data: &[u8], offset: u64) -> BackendResult<usize>;

    fn preadv(&self, fd: Fd, bufs: &mut [IoSliceMut<'_>], offset: u64) -> BackendResult<usize> {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let want = buf.len();
            let n = self.pread(fd, buf, offset + total as u64)?;
            total += n;
            if n < want {
                break;
            }
        }
        Ok(total)
    }

    fn pwritev(&self, fd: Fd, bufs: &[IoSlice<'_>], offset: u64) -> BackendResult<usize> {
        let mut total = 0;
        for buf in bufs {
            let n = self.pwrite(fd, buf, offset + total as u64)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Write to an inode without going through a descriptor. Used to write
    /// back dirty cache blocks, which are keyed by inode.
    fn pwrite_inode(&self, ino: Ino, data: &[u8], offset: u64) -> BackendResult<usize>;

    /// Push anything the SDK buffers for `fd` to the cluster.
    fn flush(&self, fd: Fd) -> BackendResult<()>;

    /// Re-fetch the extent map of an inode and return its authoritative size.
    fn refresh_extents(&self, ino: Ino) -> BackendResult<u64>;

    /// Plan the per-extent requests that cover `[offset, offset + len)`.
    fn read_requests(&self, fd: Fd, offset: u64, len: usize) -> BackendResult<Vec<ExtentRequest>>;

    fn truncate(&self, path: &str, len: u64) -> BackendResult<()>;
    fn ftruncate(&self, fd: Fd, len: u64) -> BackendResult<()>;
    fn fallocate(&self, fd: Fd, mode: i32, offset: u64, len: u64) -> BackendResult<()>;

    fn unlink(&self, path: &str) -> BackendResult<()>;
    fn rename(&self, from: &str, to: &str) -> BackendResult<()>;
    fn mkdir(&self, path: &str, mode: u32) -> BackendResult<()>;
    fn rmdir(&self, path: &str) -> BackendResult<()>;
    /// Entries of an open directory starting at index `start`.
    fn readdir(&self, fd: Fd, start: usize, max: usize) -> BackendResult<Vec<DirEntry>>;
    fn link(&self, from: &str, to: &str) -> BackendResult<()>;
    fn symlink(&self, target: &str, link: &str) -> BackendResult<()>;
    fn readlink(&self, path: &str) -> BackendResult<String>;
    fn access(&self, path: &str, mode: i32) -> BackendResult<()>;
    /// `follow` decides whether a final symlink is changed or followed.
    fn set_attr(&self, path: &str, attr: SetAttr, follow: bool) -> BackendResult<()>;
    fn fset_attr(&self, fd: Fd, attr: SetAttr) -> BackendResult<()>;

    fn set_xattr(&self, path: &str, name: &str, value: &[u8], flags: i32, follow: bool) -> BackendResult<()>;
    fn get_xattr(&self, path: &str, name: &str, follow: bool) -> BackendResult<Vec<u8>>;
    fn list_xattr(&self, path: &str, follow: bool) -> BackendResult<Vec<String>>;
    fn remove_xattr(&self, path: &str, name: &str, follow: bool) -> BackendResult<()>;

    fn set_lock(&self, fd: Fd, lock: FileLock) -> BackendResult<()>;
    fn get_lock(&self, fd: Fd, lock: FileLock) -> BackendResult<Option<FileLock>>;

    /// Opaque SDK state carried across a hot reload.
    fn export_state(&self) -> BackendResult<Vec<u8>>;
}

/// Direct per-extent read path, bypassing the SDK's own read logic.
pub trait ExtentReader: Send + Sync {
    fn read_extent(&self, req: &ExtentRequest, buf: &mut [u8]) -> BackendResult<usize>;
}

/// The currently connected backend. Cloned handles observe a hot swap.
#[derive(Clone)]
pub struct BackendSlot(Arc<RwLock<Arc<dyn StorageBackend>>>);

impl BackendSlot {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self(Arc::new(RwLock::new(backend)))
    }

    pub fn current(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.0.read())
    }

    /// Install a new backend and hand back the old one.
    pub fn replace(&self, backend: Arc<dyn StorageBackend>) -> Arc<dyn StorageBackend> {
        std::mem::replace(&mut *self.0.write(), backend)
    }
}
