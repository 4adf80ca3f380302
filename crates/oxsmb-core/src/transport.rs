//! The request primitive consumed by the engine.
//!
//! Wire marshaling and connection management live outside this crate. The
//! engine only needs to send one [`Request`] and receive one correlated
//! [`Reply`], and to be told when the connection has been re-established.
//! Everything here is the contract between the engine and that layer.

use std::fmt;

use bitflags::bitflags;

use crate::entry::{FileAttributes, InfoLevel};
use crate::node::RemotePath;

/// Server status code for a handle the server no longer recognises.
pub const STATUS_INVALID_HANDLE: u32 = 0xC000_0008;

bitflags! {
    /// Access requested when opening a server handle.
    ///
    /// The empty set is a valid mode: an attribute-only open that grants
    /// neither read nor write access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessMode: u8 {
        /// Read file data.
        const READ = 0b01;
        /// Write file data.
        const WRITE = 0b10;
    }
}

bitflags! {
    /// Flags attached to paged search requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SearchFlags: u16 {
        /// Server closes the search after answering this request.
        const CLOSE_AFTER_REQUEST = 0x0001;
        /// Server closes the search once it reports end-of-search.
        const CLOSE_AT_END = 0x0002;
        /// Every returned entry carries a resume key.
        const RETURN_RESUME_KEYS = 0x0004;
    }
}

/// Opaque server handle for an open file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerHandle(pub u64);

/// Opaque server handle for an in-progress directory search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SearchHandle(pub u16);

/// One request sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Open `path` with exactly `access`.
    Open {
        /// Remote path to open.
        path: RemotePath,
        /// Requested access.
        access: AccessMode,
        /// Whether the target must be a directory.
        directory: bool,
    },
    /// Close a server handle.
    Close {
        /// Handle to close.
        handle: ServerHandle,
    },
    /// Set the end-of-file position through an open handle.
    SetEndOfFile {
        /// Handle the update is issued on.
        handle: ServerHandle,
        /// New file size in bytes.
        size: u64,
    },
    /// Ask the server to delete the file once its last handle is closed.
    SetDeleteOnClose {
        /// Handle the disposition is set on.
        handle: ServerHandle,
    },
    /// Set the hidden attribute on a path.
    SetHidden {
        /// Target path.
        path: RemotePath,
    },
    /// Fetch attributes for a path.
    QueryInfo {
        /// Target path.
        path: RemotePath,
    },
    /// Delete a path.
    Delete {
        /// Target path.
        path: RemotePath,
    },
    /// Rename `from` to `to`.
    Rename {
        /// Existing path.
        from: RemotePath,
        /// New path.
        to: RemotePath,
    },
    /// Start a paged directory search.
    FindFirst {
        /// Directory being listed.
        dir: RemotePath,
        /// Name pattern, possibly containing wildcards.
        pattern: String,
        /// Maximum entries in the reply.
        page_size: u16,
        /// Information level the entries are encoded in.
        level: InfoLevel,
        /// Search behaviour flags.
        flags: SearchFlags,
    },
    /// Continue a paged directory search.
    FindNext {
        /// Search being continued.
        search: SearchHandle,
        /// Maximum entries in the reply.
        page_size: u16,
        /// Information level the entries are encoded in.
        level: InfoLevel,
        /// Resume key of the last entry consumed from the previous page.
        resume_key: Option<u32>,
        /// Resume name latched from the previous pages.
        resume_name: Option<Vec<u8>>,
        /// Search behaviour flags.
        flags: SearchFlags,
    },
    /// Close a directory search.
    FindClose {
        /// Search to close.
        search: SearchHandle,
    },
}

/// Discriminant of a [`Request`], used for logging and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// [`Request::Open`]
    Open,
    /// [`Request::Close`]
    Close,
    /// [`Request::SetEndOfFile`]
    SetEndOfFile,
    /// [`Request::SetDeleteOnClose`]
    SetDeleteOnClose,
    /// [`Request::SetHidden`]
    SetHidden,
    /// [`Request::QueryInfo`]
    QueryInfo,
    /// [`Request::Delete`]
    Delete,
    /// [`Request::Rename`]
    Rename,
    /// [`Request::FindFirst`]
    FindFirst,
    /// [`Request::FindNext`]
    FindNext,
    /// [`Request::FindClose`]
    FindClose,
}

impl Request {
    /// Returns the kind of this request.
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Open { .. } => RequestKind::Open,
            Request::Close { .. } => RequestKind::Close,
            Request::SetEndOfFile { .. } => RequestKind::SetEndOfFile,
            Request::SetDeleteOnClose { .. } => RequestKind::SetDeleteOnClose,
            Request::SetHidden { .. } => RequestKind::SetHidden,
            Request::QueryInfo { .. } => RequestKind::QueryInfo,
            Request::Delete { .. } => RequestKind::Delete,
            Request::Rename { .. } => RequestKind::Rename,
            Request::FindFirst { .. } => RequestKind::FindFirst,
            Request::FindNext { .. } => RequestKind::FindNext,
            Request::FindClose { .. } => RequestKind::FindClose,
        }
    }
}

/// One page of directory search results.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchPage {
    /// Search handle, present in replies to [`Request::FindFirst`].
    pub search: Option<SearchHandle>,
    /// Number of entries encoded in `data`.
    pub entry_count: u16,
    /// The server has no more entries for this search.
    pub end_of_search: bool,
    /// Byte offset into `data` of the entry the server wants resumed from.
    pub last_name_offset: Option<u32>,
    /// Encoded entries, decoded by an [`EntryDecoder`](crate::EntryDecoder).
    pub data: Vec<u8>,
}

/// Successful reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A handle was opened.
    Opened(ServerHandle),
    /// The request completed with nothing to return.
    Done,
    /// Attributes of the queried path.
    Info(FileAttributes),
    /// One page of search results.
    SearchPage(SearchPage),
}

/// Status reported by the server or the transport for a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireStatus {
    /// The connection dropped before a reply arrived.
    Disconnected,
    /// No reply arrived in time.
    TimedOut,
    /// The server refused the requested access.
    AccessDenied,
    /// The target does not exist.
    NotFound,
    /// The target name is already taken.
    AlreadyExists,
    /// The server does not implement the request or information level.
    NotSupported,
    /// The reply could not be parsed.
    Malformed(String),
    /// Any other server status code.
    Other(u32),
}

impl fmt::Display for WireStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireStatus::Disconnected => f.write_str("connection lost"),
            WireStatus::TimedOut => f.write_str("request timed out"),
            WireStatus::AccessDenied => f.write_str("access denied"),
            WireStatus::NotFound => f.write_str("not found"),
            WireStatus::AlreadyExists => f.write_str("already exists"),
            WireStatus::NotSupported => f.write_str("not supported"),
            WireStatus::Malformed(detail) => write!(f, "malformed reply: {detail}"),
            WireStatus::Other(code) => write!(f, "server status {code:#010x}"),
        }
    }
}

/// A failed request.
///
/// `retransmitted` is set when the transport re-sent the request after a
/// reconnect, so the server may already have executed an earlier copy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{status} (retransmitted: {retransmitted})")]
pub struct WireError {
    /// What went wrong.
    pub status: WireStatus,
    /// The request may have been delivered once already.
    pub retransmitted: bool,
}

impl WireError {
    /// Creates an error for a request sent exactly once.
    pub fn new(status: WireStatus) -> Self {
        Self {
            status,
            retransmitted: false,
        }
    }

    /// Creates an error for a request that was re-sent after a reconnect.
    pub fn retransmitted(status: WireStatus) -> Self {
        Self {
            status,
            retransmitted: true,
        }
    }
}

impl From<WireStatus> for WireError {
    fn from(status: WireStatus) -> Self {
        Self::new(status)
    }
}

/// Callback the transport invokes after re-establishing its connection.
pub type ReconnectCallback = Box<dyn Fn() + Send + Sync>;

/// Request primitive provided by the wire layer.
///
/// Implementations may block the calling thread for the duration of the
/// round-trip and must be usable from many threads at once.
pub trait Transport: Send + Sync {
    /// Sends one request and waits for its reply.
    fn send_request(&self, request: &Request) -> Result<Reply, WireError>;

    /// Registers a callback to run after every reconnect.
    fn on_reconnect(&self, callback: ReconnectCallback);
}
