use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by the storage SDK, surfaced with its errno unchanged.
    #[error("backend error: {0}")]
    Backend(#[from] Errno),

    #[error("bad file descriptor: {0}")]
    BadFd(i32),

    /// The path or descriptor does not belong to the mount; the caller should
    /// hand the call to the native implementation.
    #[error("not handled by the distributed mount")]
    Passthrough,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("data divergence on {path} at offset {offset}: {detail}")]
    Divergence {
        path: String,
        offset: u64,
        detail: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State error: {0}")]
    State(String),
}

impl ClientError {
    /// The errno an intercepted call reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            ClientError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            ClientError::Backend(errno) => *errno as i32,
            ClientError::BadFd(_) => libc::EBADF,
            ClientError::Passthrough => libc::ENOSYS,
            ClientError::InvalidArgument(_) => libc::EINVAL,
            ClientError::Divergence { .. } => libc::EIO,
            ClientError::Config(_) => libc::EINVAL,
            ClientError::State(_) => libc::EIO,
        }
    }

    pub fn is_divergence(&self) -> bool {
        matches!(self, ClientError::Divergence { .. })
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, ClientError::Passthrough)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
