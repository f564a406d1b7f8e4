//! Helpers for talking to the native filesystem directly: the consistency
//! checker drives its local mirror with them, and calls spanning a native
//! and an in-mount descriptor use them for the native side.

use std::fs::File;
use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;

/// open(2) with raw flags and mode.
pub fn open_local(path: &Path, flags: i32, mode: u32) -> std::io::Result<File> {
    let c_path = path_to_cstring(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Positional read that keeps going until `buf` is full or EOF.
pub fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Positional write that keeps going until everything is written or the
/// kernel accepts nothing more.
pub fn write_full_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    let mut done = 0;
    while done < data.len() {
        match file.write_at(&data[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// View a descriptor owned by the process as a `File` without taking it over.
fn borrow_native(fd: i32) -> ManuallyDrop<File> {
    ManuallyDrop::new(unsafe { File::from_raw_fd(fd) })
}

/// read(2), or pread(2) when `offset` is given, on a native descriptor.
pub fn read_native(fd: i32, buf: &mut [u8], offset: Option<u64>) -> std::io::Result<usize> {
    let native = borrow_native(fd);
    let mut file: &File = &native;
    match offset {
        Some(offset) => file.read_at(buf, offset),
        None => file.read(buf),
    }
}

/// write(2) on a native descriptor.
pub fn write_native(fd: i32, data: &[u8]) -> std::io::Result<usize> {
    let native = borrow_native(fd);
    let mut file: &File = &native;
    file.write(data)
}

/// fallocate(2) on an open local file.
pub fn fallocate_local(file: &File, mode: i32, offset: u64, len: u64) -> std::io::Result<()> {
    let offset = libc::off_t::try_from(offset)
        .map_err(|_| std::io::Error::from_raw_os_error(libc::EFBIG))?;
    let len = libc::off_t::try_from(len).map_err(|_| std::io::Error::from_raw_os_error(libc::EFBIG))?;
    if unsafe { libc::fallocate(file.as_raw_fd(), mode, offset, len) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

pub fn path_to_cstring(path: &Path) -> std::io::Result<std::ffi::CString> {
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null byte"))
}
