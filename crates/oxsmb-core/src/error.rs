//! Error types for the engine.
//!
//! Every operation returns [`Result`]. Failures reported by the transport
//! arrive as [`WireError`] and are classified here, with the path they
//! concerned attached for the log and the caller.

use thiserror::Error;

use crate::node::RemotePath;
use crate::transport::{WireError, WireStatus};

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-level failure. May succeed once the transport reconnects.
    #[error("Transport failure on {path}: {status}")]
    Transport {
        /// Path the request concerned.
        path: RemotePath,
        /// Underlying status.
        status: WireStatus,
    },

    /// The server refused access.
    #[error("Access denied: {0}")]
    AccessDenied(RemotePath),

    /// The node could not be repaired after a reconnect and is permanently
    /// unusable until it is looked up again.
    #[error("Handle revoked: {0}")]
    Revoked(RemotePath),

    /// A reply had an unexpected shape or could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The target does not exist.
    #[error("Not found: {0}")]
    NotFound(RemotePath),

    /// The target name is already taken.
    #[error("Already exists: {0}")]
    AlreadyExists(RemotePath),

    /// The server does not implement the request.
    #[error("Operation not supported: {0}")]
    NotSupported(RemotePath),

    /// Any other server status.
    #[error("Server returned status {code:#010x} for {path}")]
    Server {
        /// Path the request concerned.
        path: RemotePath,
        /// Raw status code.
        code: u32,
    },

    /// Token does not name a live handle on the node.
    #[error("Invalid handle token: {0}")]
    InvalidHandle(u64),

    /// Directory operation on something that is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(RemotePath),

    /// Every temporary name candidate was taken.
    #[error("No free temporary name for {0}")]
    NamesExhausted(RemotePath),

    /// Caller-supplied argument or configuration value is out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Classifies a wire failure for `path`.
    pub fn from_wire(err: WireError, path: &RemotePath) -> Self {
        let path = path.clone();
        match err.status {
            status @ (WireStatus::Disconnected | WireStatus::TimedOut) => {
                Error::Transport { path, status }
            }
            WireStatus::AccessDenied => Error::AccessDenied(path),
            WireStatus::NotFound => Error::NotFound(path),
            WireStatus::AlreadyExists => Error::AlreadyExists(path),
            WireStatus::NotSupported => Error::NotSupported(path),
            WireStatus::Malformed(detail) => Error::Protocol(format!("{path}: {detail}")),
            WireStatus::Other(code) => Error::Server { path, code },
        }
    }

    /// Whether retrying after the transport reconnects may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// Converts this error to a libc error code for the filesystem layer.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Transport { .. } | Error::Server { .. } => libc::EIO,
            Error::AccessDenied(_) => libc::EACCES,
            Error::Revoked(_) => libc::ESTALE,
            Error::Protocol(_) => libc::EPROTO,
            Error::NotFound(_) => libc::ENOENT,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::NotSupported(_) => libc::ENOTSUP,
            Error::InvalidHandle(_) => libc::EBADF,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::NamesExhausted(_) => libc::EBUSY,
            Error::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Attaches a path to wire results.
pub(crate) trait WireResultExt<T> {
    fn at(self, path: &RemotePath) -> Result<T>;
}

impl<T> WireResultExt<T> for std::result::Result<T, WireError> {
    fn at(self, path: &RemotePath) -> Result<T> {
        self.map_err(|err| Error::from_wire(err, path))
    }
}
