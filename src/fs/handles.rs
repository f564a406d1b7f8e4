use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::fdspace::tag_fd;
use super::inodes::{InodeInfo, InodeRegistry};
use crate::backend::{Fd, StorageBackend};
use crate::error::{ClientError, Result};

/// What kind of file a descriptor refers to. Decides the caching policy of
/// its inode and whether reads near EOF refresh the extent map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    BinLog,
    RedoLog,
    RelayLog,
    Other,
}

impl FileType {
    /// Classify by file name, following the naming of database log files:
    /// `<base>-bin.000123` and `binlog.000123` are binlogs,
    /// `<base>-relay-bin.000123` are relay logs, and `ib_logfile*`/`#ib_redo*`
    /// are redo logs.
    pub fn classify(path: &str, is_dir: bool) -> Self {
        if is_dir {
            return FileType::Other;
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        if name.starts_with("ib_logfile") || name.starts_with("#ib_redo") {
            return FileType::RedoLog;
        }
        let Some((stem, seq)) = name.rsplit_once('.') else {
            return FileType::Regular;
        };
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return FileType::Regular;
        }
        if stem.ends_with("relay-bin") || stem.ends_with("relay-log") {
            FileType::RelayLog
        } else if stem.ends_with("-bin") || stem == "binlog" {
            FileType::BinLog
        } else {
            FileType::Regular
        }
    }
}

/// Mutable per-descriptor state, guarded by the descriptor's own mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub pos: u64,
    pub flags: i32,
    /// Number of visible descriptors (primary plus dup aliases) sharing this
    /// open file.
    pub dup_ref: u32,
    pub primary_open: bool,
}

/// One open SDK descriptor and everything the data path needs about it.
pub struct OpenFile {
    /// The SDK descriptor.
    pub fd: Fd,
    pub file_type: FileType,
    /// In-mount path at open time.
    pub path: String,
    pub inode: Arc<InodeInfo>,
    state: Mutex<FileState>,
}

impl OpenFile {
    pub fn new(fd: Fd, path: String, flags: i32, file_type: FileType, inode: Arc<InodeInfo>) -> Self {
        Self::with_state(
            fd,
            path,
            file_type,
            inode,
            FileState {
                pos: 0,
                flags,
                dup_ref: 1,
                primary_open: true,
            },
        )
    }

    pub fn with_state(
        fd: Fd,
        path: String,
        file_type: FileType,
        inode: Arc<InodeInfo>,
        state: FileState,
    ) -> Self {
        Self {
            fd,
            file_type,
            path,
            inode,
            state: Mutex::new(state),
        }
    }

    /// The descriptor number the process sees for the primary descriptor.
    pub fn visible_fd(&self) -> Fd {
        tag_fd(self.fd)
    }

    /// Lock the descriptor for a cursor-relative operation.
    pub fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock()
    }

    pub fn state(&self) -> FileState {
        *self.state.lock()
    }

    pub fn flags(&self) -> i32 {
        self.state.lock().flags
    }

    pub fn is_append(&self) -> bool {
        self.flags() & libc::O_APPEND != 0
    }
}

/// All open descriptors of the client, keyed by SDK descriptor.
pub struct FileTable {
    files: RwLock<HashMap<Fd, Arc<OpenFile>>>,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, file: OpenFile) -> Arc<OpenFile> {
        let file = Arc::new(file);
        self.files.write().insert(file.fd, Arc::clone(&file));
        file
    }

    pub fn get(&self, fd: Fd) -> Option<Arc<OpenFile>> {
        self.files.read().get(&fd).cloned()
    }

    /// Count one more visible descriptor against `fd`.
    pub fn add_ref(&self, fd: Fd) -> Result<()> {
        let files = self.files.read();
        let file = files.get(&fd).ok_or(ClientError::BadFd(tag_fd(fd)))?;
        file.lock().dup_ref += 1;
        Ok(())
    }

    /// Drop one visible descriptor of `fd`. `primary` marks the close of the
    /// tagged primary descriptor rather than a dup alias. The last reference
    /// removes the entry, runs `on_last`, releases the inode and closes the SDK
    /// descriptor; the removed file is returned in that case.
    pub fn close(
        &self,
        fd: Fd,
        primary: bool,
        inodes: &InodeRegistry,
        backend: &dyn StorageBackend,
        on_last: impl FnOnce(&OpenFile),
    ) -> Result<Option<Arc<OpenFile>>> {
        let last = {
            let mut files = self.files.write();
            let file = files.get(&fd).cloned().ok_or(ClientError::BadFd(tag_fd(fd)))?;
            let mut state = file.lock();
            if primary {
                if !state.primary_open {
                    return Err(ClientError::BadFd(tag_fd(fd)));
                }
                state.primary_open = false;
            }
            state.dup_ref = state.dup_ref.saturating_sub(1);
            if state.dup_ref > 0 {
                debug!("fd {} closed, {} references left", fd, state.dup_ref);
                return Ok(None);
            }
            drop(state);
            files.remove(&fd);
            file
        };

        on_last(&last);
        let flushed = inodes.release(&last.inode, backend);
        let closed = backend.close(fd);
        debug!("fd {} closed (ino {})", fd, last.inode.ino);
        flushed?;
        closed?;
        Ok(Some(last))
    }

    pub fn all(&self) -> Vec<Arc<OpenFile>> {
        self.files.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace every entry with `files`.
    pub fn replace_all(&self, files: Vec<OpenFile>) {
        let mut table = self.files.write();
        table.clear();
        for file in files {
            table.insert(file.fd, Arc::new(file));
        }
    }
}
