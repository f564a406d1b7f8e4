//! Dual-write consistency checking.
//!
//! In verification mode every operation on the mount is repeated against a
//! local directory tree and the outcomes are compared. A mismatch is logged
//! with the differing byte ranges and reported as
//! [`ClientError::Divergence`].

use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use super::passthrough::{fallocate_local, open_local, read_full_at, write_full_at};
use crate::backend::Fd;
use crate::error::{ClientError, Result};

/// Differing ranges printed per divergence.
const MAX_REPORTED_RANGES: usize = 16;

/// Byte ranges where `a` and `b` differ, compared over their common length.
pub fn diff_ranges(a: &[u8], b: &[u8]) -> Vec<Range<usize>> {
    let n = a.len().min(b.len());
    let mut ranges = Vec::new();
    let mut start: Option<usize> = None;
    for i in 0..n {
        match (a[i] != b[i], start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                ranges.push(s..i);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        ranges.push(s..n);
    }
    ranges
}

fn divergence(path: &str, offset: u64, detail: String) -> ClientError {
    error!("divergence on {} at offset {}: {}", path, offset, detail);
    ClientError::Divergence {
        path: path.to_string(),
        offset,
        detail,
    }
}

/// Flags for the local mirror: positional I/O must not append and need not
/// be aligned.
fn mirror_flags(flags: i32) -> i32 {
    flags & !(libc::O_APPEND | libc::O_DIRECT)
}

pub struct Replica {
    root: PathBuf,
    files: DashMap<Fd, Arc<File>>,
}

impl Replica {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        debug!("consistency checker mirroring into {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            files: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn local_path(&self, in_mount: &str) -> PathBuf {
        self.root.join(in_mount.trim_start_matches('/'))
    }

    /// Compare whether the remote and local sides of an operation agreed on
    /// success.
    pub fn compare_outcome<T>(
        &self,
        op: &str,
        path: &str,
        remote: &Result<T>,
        local: std::io::Result<()>,
    ) -> Result<()> {
        match (remote, local) {
            (Ok(_), Ok(())) => Ok(()),
            (Err(r), Err(l)) if r.errno() == l.raw_os_error().unwrap_or(libc::EIO) => Ok(()),
            (Err(r), Err(l)) => Err(divergence(
                path,
                0,
                format!("{}: remote failed with {} but local failed with {}", op, r, l),
            )),
            (Ok(_), Err(l)) => Err(divergence(
                path,
                0,
                format!("{}: remote succeeded but local failed with {}", op, l),
            )),
            (Err(r), Ok(())) => Err(divergence(
                path,
                0,
                format!("{}: local succeeded but remote failed with {}", op, r),
            )),
        }
    }

    fn open_mirror(&self, path: &str, flags: i32, mode: u32) -> Result<File> {
        open_local(&self.local_path(path), mirror_flags(flags), mode)
            .map_err(|e| divergence(path, 0, format!("open: remote succeeded but local failed with {}", e)))
    }

    /// Open the mirror of `path` for the SDK descriptor `sdk_fd`.
    pub fn open(&self, sdk_fd: Fd, path: &str, flags: i32, mode: u32) -> Result<()> {
        let file = self.open_mirror(path, flags, mode)?;
        self.files.insert(sdk_fd, Arc::new(file));
        Ok(())
    }

    /// Open an existing mirror for a descriptor being restored, without
    /// creating or truncating it. Nothing is installed until
    /// [`Replica::replace_all`].
    pub fn reopen(&self, path: &str, flags: i32) -> Result<File> {
        let flags = flags & !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);
        self.open_mirror(path, flags, 0)
    }

    pub fn replace_all(&self, mirrors: Vec<(Fd, File)>) {
        self.files.clear();
        for (sdk_fd, file) in mirrors {
            self.files.insert(sdk_fd, Arc::new(file));
        }
    }

    pub fn close(&self, sdk_fd: Fd) {
        self.files.remove(&sdk_fd);
    }

    fn file(&self, sdk_fd: Fd) -> Option<Arc<File>> {
        self.files.get(&sdk_fd).map(|f| Arc::clone(f.value()))
    }

    /// Read the same range locally and compare the prefix both sides returned.
    pub fn check_read(&self, sdk_fd: Fd, path: &str, offset: u64, requested: usize, remote: &[u8]) -> Result<()> {
        let Some(file) = self.file(sdk_fd) else {
            return Ok(());
        };
        let mut local = vec![0u8; requested];
        let got = read_full_at(&file, &mut local, offset)?;
        let n = remote.len().min(got);
        let diffs = diff_ranges(&remote[..n], &local[..n]);
        if diffs.is_empty() {
            return Ok(());
        }
        for range in diffs.iter().take(MAX_REPORTED_RANGES) {
            error!(
                "{}: bytes [{}, {}) differ from local mirror",
                path,
                offset + range.start as u64,
                offset + range.end as u64
            );
        }
        let first = diffs[0].start as u64;
        Err(divergence(
            path,
            offset + first,
            format!("read returned {} differing ranges", diffs.len()),
        ))
    }

    /// Repeat a write locally and compare byte counts.
    pub fn mirror_write(&self, sdk_fd: Fd, path: &str, offset: u64, data: &[u8], remote_written: usize) -> Result<()> {
        let Some(file) = self.file(sdk_fd) else {
            return Ok(());
        };
        let local = write_full_at(&file, data, offset)?;
        if local != remote_written {
            return Err(divergence(
                path,
                offset,
                format!("write of {} bytes: remote wrote {}, local wrote {}", data.len(), remote_written, local),
            ));
        }
        Ok(())
    }

    pub fn fallocate(&self, sdk_fd: Fd, mode: i32, offset: u64, len: u64) -> std::io::Result<()> {
        match self.file(sdk_fd) {
            Some(file) => fallocate_local(&file, mode, offset, len),
            None => Ok(()),
        }
    }

    pub fn ftruncate(&self, sdk_fd: Fd, len: u64) -> std::io::Result<()> {
        match self.file(sdk_fd) {
            Some(file) => file.set_len(len),
            None => Ok(()),
        }
    }

    pub fn truncate(&self, path: &str, len: u64) -> std::io::Result<()> {
        std::fs::OpenOptions::new()
            .write(true)
            .open(self.local_path(path))?
            .set_len(len)
    }

    pub fn unlink(&self, path: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.local_path(path))
    }

    pub fn rename(&self, from: &str, to: &str) -> std::io::Result<()> {
        std::fs::rename(self.local_path(from), self.local_path(to))
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> std::io::Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new().mode(mode).create(self.local_path(path))
    }

    pub fn rmdir(&self, path: &str) -> std::io::Result<()> {
        std::fs::remove_dir(self.local_path(path))
    }

    pub fn link(&self, from: &str, to: &str) -> std::io::Result<()> {
        std::fs::hard_link(self.local_path(from), self.local_path(to))
    }

    /// `target` is either relative to the link or an in-mount absolute path,
    /// which is pointed at the mirror tree.
    pub fn symlink(&self, target: &str, link: &str) -> std::io::Result<()> {
        let local_target = if target.starts_with('/') {
            self.local_path(target)
        } else {
            PathBuf::from(target)
        };
        std::os::unix::fs::symlink(local_target, self.local_path(link))
    }
}
