//! Client state snapshots and hot reload of the storage backend.
//!
//! A [`ClientState`] carries everything needed to rebuild the descriptor
//! tables of a [`Client`] on top of a freshly connected backend: the working
//! directory, every open file with its cursor and cached size, the dup alias
//! table and the backend's own exported session.

use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{Fd, Ino, StorageBackend};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::fs::fdspace::{tag_fd, untag_fd, Alias, FdSpace};
use crate::fs::handles::{FileState, FileType, OpenFile};
use crate::fs::inodes::InodeInfo;
use crate::fs::path::Cwd;
use crate::fs::Client;

/// One open file as captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub visible_fd: Fd,
    pub flags: i32,
    pub file_type: FileType,
    pub dup_ref: u32,
    pub pos: u64,
    pub primary_open: bool,
    pub path: String,
    pub ino: Ino,
    pub size: u64,
    pub client_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub taken_at: DateTime<Utc>,
    pub cwd: Cwd,
    pub files: Vec<FileRecord>,
    pub aliases: Vec<(Fd, Alias)>,
    /// Visible descriptors with `FD_CLOEXEC` set.
    pub cloexec: Vec<Fd>,
    /// Opaque session state exported by the backend.
    pub sdk_state: Option<Vec<u8>>,
}

/// Rebuilt tables waiting to be installed.
struct Restoration {
    files: Vec<OpenFile>,
    inodes: Vec<Arc<InodeInfo>>,
    mirrors: Vec<(Fd, File)>,
}

impl ClientState {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ClientError::State(format!("cannot encode snapshot: {}", e)))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ClientError::State(format!("cannot decode snapshot: {}", e)))
    }

    pub fn file(&self, visible_fd: Fd) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.visible_fd == visible_fd)
    }
}

impl Client {
    /// Build a client, rebuilding its tables from `state` when given.
    pub fn with_state(
        config: ClientConfig,
        backend: Arc<dyn StorageBackend>,
        state: Option<&ClientState>,
    ) -> Result<Self> {
        let client = Self::new(config, backend)?;
        if let Some(state) = state {
            client.restore(state)?;
        }
        Ok(client)
    }

    /// Capture the descriptor tables. Cached data is not included; callers
    /// that hand the state to another process flush first.
    pub fn snapshot(&self) -> Result<ClientState> {
        let _gate = self.gate.write();
        self.snapshot_locked()
    }

    pub(crate) fn snapshot_locked(&self) -> Result<ClientState> {
        let mut files: Vec<FileRecord> = self
            .files
            .all()
            .into_iter()
            .map(|file| {
                let state = file.state();
                FileRecord {
                    visible_fd: file.visible_fd(),
                    flags: state.flags,
                    file_type: file.file_type,
                    dup_ref: state.dup_ref,
                    pos: state.pos,
                    primary_open: state.primary_open,
                    path: file.path.clone(),
                    ino: file.inode.ino,
                    size: file.inode.size(),
                    client_id: file.inode.client_id,
                }
            })
            .collect();
        files.sort_by_key(|f| f.visible_fd);

        let mut cloexec: Vec<Fd> = self
            .fd_flags
            .iter()
            .filter(|entry| *entry.value() & libc::FD_CLOEXEC != 0)
            .map(|entry| *entry.key())
            .collect();
        cloexec.sort_unstable();

        let sdk_state = self.backend.current().export_state()?;
        debug!("snapshot: {} open files, {} aliases", files.len(), self.fds.len());
        Ok(ClientState {
            taken_at: Utc::now(),
            cwd: self.cwd.read().clone(),
            files,
            aliases: self.fds.aliases(),
            cloexec,
            sdk_state: Some(sdk_state),
        })
    }

    /// Replace the descriptor tables with the ones in `state`. Nothing is
    /// read from the backend; the descriptors in the snapshot must already be
    /// valid in its session.
    pub fn restore(&self, state: &ClientState) -> Result<()> {
        let _gate = self.gate.write();
        self.restore_locked(state)
    }

    pub(crate) fn restore_locked(&self, state: &ClientState) -> Result<()> {
        let restoration = self.prepare_restore(state)?;
        self.install_restore(state, restoration);
        Ok(())
    }

    /// Everything in a restore that can fail, done before any table is
    /// touched.
    fn prepare_restore(&self, state: &ClientState) -> Result<Restoration> {
        let mut inodes: HashMap<Ino, Arc<InodeInfo>> = HashMap::new();
        for record in &state.files {
            let sdk_fd = untag_fd(record.visible_fd);
            if tag_fd(sdk_fd) != record.visible_fd {
                return Err(ClientError::State(format!(
                    "snapshot holds untagged descriptor {}",
                    record.visible_fd
                )));
            }
            FdSpace::check_sdk_fd(sdk_fd)?;
            let refs = state.files.iter().filter(|r| r.ino == record.ino).count() as u32;
            let inode = inodes.entry(record.ino).or_insert_with(|| {
                self.inodes
                    .detached(record.ino, record.file_type, record.size, record.client_id, refs)
            });
            inode.grow_to(record.size);
        }

        let mut files = Vec::with_capacity(state.files.len());
        let mut mirrors = Vec::new();
        for record in &state.files {
            let sdk_fd = untag_fd(record.visible_fd);
            if let Some(replica) = &self.replica {
                mirrors.push((sdk_fd, replica.reopen(&record.path, record.flags)?));
            }
            let inode = inodes
                .get(&record.ino)
                .cloned()
                .ok_or_else(|| ClientError::State(format!("no inode {} for {}", record.ino, record.path)))?;
            files.push(OpenFile::with_state(
                sdk_fd,
                record.path.clone(),
                record.file_type,
                inode,
                FileState {
                    pos: record.pos,
                    flags: record.flags,
                    dup_ref: record.dup_ref,
                    primary_open: record.primary_open,
                },
            ));
        }

        Ok(Restoration {
            files,
            inodes: inodes.into_values().collect(),
            mirrors,
        })
    }

    fn install_restore(&self, state: &ClientState, restoration: Restoration) {
        if !self.files.is_empty() || !self.inodes.is_empty() {
            warn!(
                "restore over {} open files; previous entries are dropped without closing",
                self.files.len()
            );
        }
        self.files.replace_all(restoration.files);
        self.inodes.replace_all(restoration.inodes);
        if let Some(replica) = &self.replica {
            replica.replace_all(restoration.mirrors);
        }
        self.fd_flags.clear();
        for fd in &state.cloexec {
            self.fd_flags.insert(*fd, libc::FD_CLOEXEC);
        }
        self.fds.restore(&state.aliases);
        *self.cwd.write() = state.cwd.clone();
        debug!(
            "restored {} open files and {} aliases",
            state.files.len(),
            state.aliases.len()
        );
    }

    /// Swap the storage backend underneath open descriptors.
    ///
    /// All operations are held off while the swap runs. `connect` receives the
    /// session exported by the current backend. If it fails, the current
    /// backend stays in place and the client keeps running on it.
    pub fn reload_backend<F>(&self, connect: F) -> Result<()>
    where
        F: FnOnce(&[u8]) -> Result<Arc<dyn StorageBackend>>,
    {
        let _gate = self.gate.write();
        self.stop_flusher();

        let prepared = self
            .flush_all_locked()
            .and_then(|()| self.snapshot_locked())
            .and_then(|state| {
                let sdk_state = state.sdk_state.clone().unwrap_or_default();
                let fresh = connect(&sdk_state)?;
                let restoration = self.prepare_restore(&state)?;
                Ok((state, fresh, restoration))
            });
        let (state, fresh, restoration) = match prepared {
            Ok(ready) => ready,
            Err(e) => {
                warn!("backend reload aborted, keeping current backend: {}", e);
                self.start_flusher()?;
                return Err(e);
            }
        };

        self.caches().clear();
        drop(self.backend.replace(fresh));
        self.install_restore(&state, restoration);
        self.start_flusher()?;
        info!(
            "backend reloaded with {} open files, {} aliases",
            state.files.len(),
            state.aliases.len()
        );
        Ok(())
    }

    /// Stop background work, write back everything and hand over the state
    /// needed to resume in a new client.
    pub fn shutdown(self) -> Result<ClientState> {
        let _gate = self.gate.write();
        self.stop_flusher();
        self.flush_all_locked()?;
        let state = self.snapshot_locked()?;
        info!("client shut down with {} open files", state.files.len());
        Ok(state)
    }
}
