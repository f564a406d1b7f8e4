//! Read/write data path: page cache first, then the direct extent path or
//! the SDK, keeping the cached size and descriptor cursors current.

use std::io::{IoSlice, IoSliceMut};

use nix::errno::Errno;
use tracing::debug;

use super::handles::{FileType, OpenFile};
use super::passthrough::{read_native, write_native};
use super::Client;
use crate::backend::{ExtentReader, ExtentRequest, Fd, StorageBackend};
use crate::cache::CachePolicy;
use crate::error::{ClientError, Result};

/// Retries of a single extent read that failed with EAGAIN or EINTR.
const TRANSIENT_RETRIES: u32 = 3;

/// Bytes `sendfile` moves per round.
const SENDFILE_CHUNK: usize = 128 * 1024;

fn check_offset(offset: i64) -> Result<u64> {
    u64::try_from(offset).map_err(|_| ClientError::InvalidArgument(format!("negative offset {}", offset)))
}

fn check_readable(file: &OpenFile, flags: i32) -> Result<()> {
    if flags & libc::O_ACCMODE == libc::O_WRONLY {
        return Err(ClientError::BadFd(file.visible_fd()));
    }
    Ok(())
}

fn check_writable(file: &OpenFile, flags: i32) -> Result<()> {
    if flags & libc::O_ACCMODE == libc::O_RDONLY {
        return Err(ClientError::BadFd(file.visible_fd()));
    }
    Ok(())
}

/// Writes on descriptors opened for synchronous or direct I/O skip write-back.
fn forces_write_through(flags: i32) -> bool {
    flags & (libc::O_SYNC | libc::O_DSYNC | libc::O_DIRECT) != 0
}

/// Cache policy of one write: the inode's, unless the descriptor demands
/// synchronous writes.
fn write_policy(policy: CachePolicy, flags: i32) -> CachePolicy {
    if forces_write_through(flags) {
        policy
            .difference(CachePolicy::WRITE_BACK)
            .union(CachePolicy::WRITE_THROUGH)
    } else {
        policy
    }
}

fn read_one(reader: &dyn ExtentReader, req: &ExtentRequest, buf: &mut [u8]) -> Result<usize> {
    if req.is_hole() {
        buf.fill(0);
        return Ok(buf.len());
    }
    let mut attempt = 0;
    loop {
        match reader.read_extent(req, buf) {
            Err(Errno::EAGAIN | Errno::EINTR) if attempt < TRANSIENT_RETRIES => attempt += 1,
            other => return Ok(other?),
        }
    }
}

/// Fetch `[offset, offset + buf.len())` with one request per extent, issued
/// in parallel. Stops counting at the first short extent.
fn read_extents(
    reader: &dyn ExtentReader,
    backend: &dyn StorageBackend,
    fd: Fd,
    buf: &mut [u8],
    offset: u64,
) -> Result<usize> {
    let reqs = backend.read_requests(fd, offset, buf.len())?;
    let mut parts: Vec<(&ExtentRequest, &mut [u8])> = Vec::with_capacity(reqs.len());
    let mut rest = buf;
    let mut pos = offset;
    for req in &reqs {
        if req.file_offset != pos || req.size > rest.len() {
            return Err(Errno::EIO.into());
        }
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(req.size);
        parts.push((req, head));
        rest = tail;
        pos += req.size as u64;
    }

    let results: Vec<Result<usize>> = if parts.len() <= 1 {
        parts.into_iter().map(|(req, part)| read_one(reader, req, part)).collect()
    } else {
        std::thread::scope(|s| {
            let handles: Vec<_> = parts
                .into_iter()
                .map(|(req, part)| s.spawn(move || read_one(reader, req, part)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(Errno::EIO.into())))
                .collect()
        })
    };

    let mut total = 0;
    for (req, result) in reqs.iter().zip(results) {
        let n = result?;
        total += n;
        if n < req.size {
            break;
        }
    }
    Ok(total)
}

impl Client {
    /// Read through the cache at an explicit offset. Does not touch the
    /// cursor.
    pub(crate) fn read_at(
        &self,
        file: &OpenFile,
        buf: &mut [u8],
        offset: u64,
        backend: &dyn StorageBackend,
    ) -> Result<usize> {
        let count = buf.len();
        if count == 0 {
            return Ok(0);
        }
        if file.file_type == FileType::Other {
            return Ok(backend.pread(file.fd, buf, offset)?);
        }
        let inode = &file.inode;
        let served = match &inode.cache {
            Some(cache) => cache.read(inode.ino, offset, buf),
            None => 0,
        };
        if served == count {
            return Ok(count);
        }

        let mut size = inode.size();
        let mut refreshed = false;
        // Binlog readers poll fixed windows; refreshing on each poll would
        // hammer the metadata service.
        if offset + count as u64 >= size && file.file_type != FileType::BinLog {
            inode.flush(backend)?;
            backend.flush(file.fd)?;
            let fresh = backend.refresh_extents(inode.ino)?;
            size = inode.grow_to(fresh);
            refreshed = true;
            debug!("ino {}: refreshed size {}", inode.ino, size);
        }

        if offset + served as u64 >= size {
            return Ok(served);
        }

        if !refreshed {
            inode.flush_range(offset, count as u64, backend)?;
            backend.flush(file.fd)?;
        }
        let want = (size - offset).min(count as u64) as usize;
        let epoch = inode.epoch();
        let n = self.fetch(file, &mut buf[..want], offset, refreshed, backend)?;
        if let Some(cache) = &inode.cache {
            cache.populate(inode.ino, offset, &buf[..n], inode.policy, || inode.epoch() == epoch);
        }
        Ok(n)
    }

    /// Network read: the direct extent path when available, otherwise or on
    /// failure the SDK's own read.
    fn fetch(
        &self,
        file: &OpenFile,
        buf: &mut [u8],
        offset: u64,
        refreshed: bool,
        backend: &dyn StorageBackend,
    ) -> Result<usize> {
        if let Some(reader) = self.extent_reader() {
            match read_extents(&*reader, backend, file.fd, buf, offset) {
                Ok(n) if n == buf.len() || refreshed => return Ok(n),
                Ok(n) => debug!(
                    "fd {}: direct read returned {} of {} bytes, falling back",
                    file.fd,
                    n,
                    buf.len()
                ),
                Err(e) => debug!("fd {}: direct read failed ({}), falling back", file.fd, e),
            }
        }
        Ok(backend.pread(file.fd, buf, offset)?)
    }

    /// Write through the cache at an explicit offset and raise the cached
    /// size. Does not touch the cursor.
    pub(crate) fn write_at(
        &self,
        file: &OpenFile,
        flags: i32,
        data: &[u8],
        offset: u64,
        backend: &dyn StorageBackend,
    ) -> Result<usize> {
        let len = data.len();
        if len == 0 {
            return Ok(0);
        }
        if file.file_type == FileType::Other {
            return Ok(backend.pwrite(file.fd, data, offset)?);
        }
        let inode = &file.inode;
        let policy = write_policy(inode.policy, flags);
        let accepted = match &inode.cache {
            Some(cache) => cache.write(inode.ino, offset, data, policy, backend),
            None => 0,
        };

        let through = policy.contains(CachePolicy::WRITE_THROUGH);
        let written = if through || accepted < len {
            let bypassed = accepted < len;
            if bypassed {
                inode.flush_range(offset, len as u64, backend)?;
                inode.clear_range(offset, len as u64);
            }
            let result = backend.pwrite(file.fd, data, offset);
            if bypassed {
                // A read racing the backend write may have cached the old bytes.
                inode.clear_range(offset, len as u64);
            }
            match result {
                Ok(n) => {
                    if n < len && !bypassed {
                        inode.clear_range(offset + n as u64, (len - n) as u64);
                    }
                    n
                }
                Err(e) => {
                    if !bypassed {
                        inode.clear_range(offset, len as u64);
                    }
                    return Err(e.into());
                }
            }
        } else {
            accepted
        };

        inode.grow_to(offset + written as u64);
        Ok(written)
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        let backend = self.backend.current();
        let mut state = file.lock();
        check_readable(&file, state.flags)?;
        let offset = state.pos;
        let n = self.read_at(&file, buf, offset, &*backend)?;
        if let Some(replica) = &self.replica {
            replica.check_read(file.fd, &file.path, offset, buf.len(), &buf[..n])?;
        }
        state.pos += n as u64;
        debug!("read fd={} offset={} count={} -> {}", fd, offset, buf.len(), n);
        Ok(n)
    }

    pub fn pread(&self, fd: Fd, buf: &mut [u8], offset: i64) -> Result<usize> {
        let _gate = self.gate.read();
        let offset = check_offset(offset)?;
        let file = self.open_file(fd)?;
        check_readable(&file, file.flags())?;
        let backend = self.backend.current();
        let n = self.read_at(&file, buf, offset, &*backend)?;
        if let Some(replica) = &self.replica {
            replica.check_read(file.fd, &file.path, offset, buf.len(), &buf[..n])?;
        }
        debug!("pread fd={} offset={} count={} -> {}", fd, offset, buf.len(), n);
        Ok(n)
    }

    pub fn write(&self, fd: Fd, data: &[u8]) -> Result<usize> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        let backend = self.backend.current();
        let mut state = file.lock();
        check_writable(&file, state.flags)?;
        if state.flags & libc::O_APPEND != 0 {
            state.pos = file.inode.size();
        }
        let offset = state.pos;
        let n = self.write_at(&file, state.flags, data, offset, &*backend)?;
        state.pos += n as u64;
        if let Some(replica) = &self.replica {
            replica.mirror_write(file.fd, &file.path, offset, data, n)?;
        }
        debug!("write fd={} offset={} count={} -> {}", fd, offset, data.len(), n);
        Ok(n)
    }

    pub fn pwrite(&self, fd: Fd, data: &[u8], offset: i64) -> Result<usize> {
        let _gate = self.gate.read();
        let offset = check_offset(offset)?;
        let file = self.open_file(fd)?;
        let flags = file.flags();
        check_writable(&file, flags)?;
        let backend = self.backend.current();
        let n = self.write_at(&file, flags, data, offset, &*backend)?;
        if let Some(replica) = &self.replica {
            replica.mirror_write(file.fd, &file.path, offset, data, n)?;
        }
        debug!("pwrite fd={} offset={} count={} -> {}", fd, offset, data.len(), n);
        Ok(n)
    }

    fn read_vectored_at(
        &self,
        file: &OpenFile,
        bufs: &mut [IoSliceMut<'_>],
        offset: u64,
        backend: &dyn StorageBackend,
    ) -> Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        file.inode.flush_range(offset, total as u64, backend)?;
        let n = backend.preadv(file.fd, bufs, offset)?;
        if let Some(replica) = &self.replica {
            let mut gathered = Vec::with_capacity(n);
            for buf in bufs.iter() {
                let take = buf.len().min(n - gathered.len());
                gathered.extend_from_slice(&buf[..take]);
            }
            replica.check_read(file.fd, &file.path, offset, total, &gathered)?;
        }
        Ok(n)
    }

    fn write_vectored_at(
        &self,
        file: &OpenFile,
        bufs: &[IoSlice<'_>],
        offset: u64,
        backend: &dyn StorageBackend,
    ) -> Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let inode = &file.inode;
        inode.flush_range(offset, total as u64, backend)?;
        inode.clear_range(offset, total as u64);
        let result = backend.pwritev(file.fd, bufs, offset);
        inode.clear_range(offset, total as u64);
        let n = result?;
        inode.grow_to(offset + n as u64);
        if let Some(replica) = &self.replica {
            let gathered: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
            replica.mirror_write(file.fd, &file.path, offset, &gathered, n)?;
        }
        Ok(n)
    }

    pub fn readv(&self, fd: Fd, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        let backend = self.backend.current();
        let mut state = file.lock();
        check_readable(&file, state.flags)?;
        let n = self.read_vectored_at(&file, bufs, state.pos, &*backend)?;
        state.pos += n as u64;
        Ok(n)
    }

    pub fn preadv(&self, fd: Fd, bufs: &mut [IoSliceMut<'_>], offset: i64) -> Result<usize> {
        let _gate = self.gate.read();
        let offset = check_offset(offset)?;
        let file = self.open_file(fd)?;
        check_readable(&file, file.flags())?;
        let backend = self.backend.current();
        self.read_vectored_at(&file, bufs, offset, &*backend)
    }

    pub fn writev(&self, fd: Fd, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        let backend = self.backend.current();
        let mut state = file.lock();
        check_writable(&file, state.flags)?;
        if state.flags & libc::O_APPEND != 0 {
            state.pos = file.inode.size();
        }
        let n = self.write_vectored_at(&file, bufs, state.pos, &*backend)?;
        state.pos += n as u64;
        Ok(n)
    }

    pub fn pwritev(&self, fd: Fd, bufs: &[IoSlice<'_>], offset: i64) -> Result<usize> {
        let _gate = self.gate.read();
        let offset = check_offset(offset)?;
        let file = self.open_file(fd)?;
        check_writable(&file, file.flags())?;
        let backend = self.backend.current();
        self.write_vectored_at(&file, bufs, offset, &*backend)
    }

    /// Reposition the cursor using only the locally cached cursor and size.
    pub fn lseek(&self, fd: Fd, offset: i64, whence: i32) -> Result<u64> {
        let _gate = self.gate.read();
        let file = self.open_file(fd)?;
        let mut state = file.lock();
        let base = match whence {
            libc::SEEK_SET => 0,
            libc::SEEK_CUR => state.pos as i64,
            libc::SEEK_END => file.inode.size() as i64,
            _ => return Err(ClientError::InvalidArgument(format!("whence {}", whence))),
        };
        let target = base
            .checked_add(offset)
            .filter(|t| *t >= 0)
            .ok_or_else(|| ClientError::InvalidArgument(format!("seek to {} + {}", base, offset)))?;
        state.pos = target as u64;
        Ok(state.pos)
    }

    /// Copy up to `count` bytes from `in_fd` to `out_fd`. Either side may be
    /// a native descriptor. With `offset`, the input is read from there and
    /// `offset` is advanced instead of the input cursor.
    pub fn sendfile(&self, out_fd: Fd, in_fd: Fd, mut offset: Option<&mut i64>, count: usize) -> Result<usize> {
        let in_mount_in = self.is_in_scope(in_fd);
        let in_mount_out = self.is_in_scope(out_fd);
        if !in_mount_in && !in_mount_out {
            return Err(ClientError::Passthrough);
        }

        let mut buf = vec![0u8; SENDFILE_CHUNK.min(count)];
        let mut sent = 0;
        while sent < count {
            let want = (count - sent).min(buf.len());
            let chunk = &mut buf[..want];
            let at = offset.as_deref().copied();
            let n = match (in_mount_in, at) {
                (true, Some(at)) => self.pread(in_fd, chunk, at)?,
                (true, None) => self.read(in_fd, chunk)?,
                (false, at) => {
                    let at = at.map(check_offset).transpose()?;
                    read_native(in_fd, chunk, at)?
                }
            };
            if n == 0 {
                break;
            }
            let written = if in_mount_out {
                self.write(out_fd, &chunk[..n])?
            } else {
                write_native(out_fd, &chunk[..n])?
            };
            sent += written;
            if let Some(at) = offset.as_deref_mut() {
                *at += written as i64;
            }
            if written < n {
                break;
            }
        }
        debug!("sendfile {} -> {} count={} -> {}", in_fd, out_fd, count, sent);
        Ok(sent)
    }
}
