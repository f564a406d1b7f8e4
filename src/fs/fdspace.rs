//! The descriptor space shared with the native kernel.
//!
//! SDK descriptors are exposed with [`FD_TAG`] set so they can never collide
//! with kernel descriptors. Descriptors created by the dup family are aliases
//! recorded in a side table that maps them back to the SDK descriptor.

use dashmap::DashMap;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::handles::FileTable;
use crate::backend::{Fd, StorageBackend};
use crate::error::{ClientError, Result};

/// Bit marking a descriptor as belonging to the distributed mount.
pub const FD_TAG: Fd = 1 << 30;

pub fn tag_fd(fd: Fd) -> Fd {
    fd | FD_TAG
}

pub fn untag_fd(fd: Fd) -> Fd {
    fd & !FD_TAG
}

/// An alias created by dup, dup2, dup3 or `F_DUPFD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    /// The SDK descriptor the alias refers to.
    pub target: Fd,
    /// Whether the alias number is a backend slot that must be returned on
    /// close.
    pub owns_slot: bool,
}

/// Where a new alias may be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasSlot {
    Any,
    /// `F_DUPFD`: the lowest free descriptor not below the bound.
    AtLeast(Fd),
    /// dup2/dup3: exactly this descriptor, already vacated by the caller.
    Exact(Fd),
}

/// Result of mapping a visible descriptor back to the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub sdk_fd: Fd,
    pub is_alias: bool,
}

fn take_slot(backend: &dyn StorageBackend, min: Fd) -> Result<Fd> {
    let slot = backend.alloc_fd(min)?;
    if slot >= FD_TAG {
        backend.release_fd(slot);
        return Err(Errno::EMFILE.into());
    }
    Ok(slot)
}

#[derive(Default)]
pub struct FdSpace {
    aliases: DashMap<Fd, Alias>,
}

impl FdSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_scope(&self, fd: Fd) -> bool {
        fd >= 0 && (fd & FD_TAG != 0 || self.aliases.contains_key(&fd))
    }

    pub fn resolve(&self, fd: Fd) -> Option<Resolved> {
        if fd < 0 {
            return None;
        }
        if let Some(alias) = self.aliases.get(&fd) {
            return Some(Resolved {
                sdk_fd: alias.target,
                is_alias: true,
            });
        }
        (fd & FD_TAG != 0).then(|| Resolved {
            sdk_fd: untag_fd(fd),
            is_alias: false,
        })
    }

    /// Create a new visible descriptor for the open file behind `target` and
    /// count it in the file's dup references.
    pub fn allocate_alias(
        &self,
        target: Fd,
        slot: AliasSlot,
        files: &FileTable,
        backend: &dyn StorageBackend,
    ) -> Result<Fd> {
        let (visible, owns_slot) = match slot {
            AliasSlot::Any => (tag_fd(take_slot(backend, 0)?), true),
            AliasSlot::AtLeast(min) => {
                let floor = if min >= FD_TAG { untag_fd(min) } else { 0 };
                (tag_fd(take_slot(backend, floor)?), true)
            }
            AliasSlot::Exact(fd) if fd & FD_TAG != 0 => {
                let want = untag_fd(fd);
                let got = backend.alloc_fd(want)?;
                if got != want {
                    backend.release_fd(got);
                    return Err(Errno::EBUSY.into());
                }
                (fd, true)
            }
            AliasSlot::Exact(fd) => (fd, false),
        };
        if let Err(e) = files.add_ref(target) {
            if owns_slot {
                backend.release_fd(untag_fd(visible));
            }
            return Err(e);
        }
        self.aliases.insert(visible, Alias { target, owns_slot });
        debug!("alias {} -> sdk fd {}", visible, target);
        Ok(visible)
    }

    pub fn remove_alias(&self, fd: Fd) -> Option<Alias> {
        self.aliases.remove(&fd).map(|(_, alias)| alias)
    }

    /// Flattened alias table, sorted by visible descriptor.
    pub fn aliases(&self) -> Vec<(Fd, Alias)> {
        let mut pairs: Vec<(Fd, Alias)> = self
            .aliases
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        pairs.sort_by_key(|(fd, _)| *fd);
        pairs
    }

    pub fn restore(&self, pairs: &[(Fd, Alias)]) {
        self.aliases.clear();
        for (fd, alias) in pairs {
            self.aliases.insert(*fd, *alias);
        }
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Reject a descriptor the backend handed out that already carries the tag.
    pub fn check_sdk_fd(fd: Fd) -> Result<Fd> {
        if fd < 0 || fd & FD_TAG != 0 {
            return Err(ClientError::Backend(Errno::EMFILE));
        }
        Ok(fd)
    }
}
