//! Client-side file handle lifecycle and directory enumeration for SMB-style
//! network filesystems.
//!
//! This crate sits between a filesystem layer (FUSE, an NFS gateway, a test
//! harness) and a wire transport. It does not marshal packets or manage
//! connections; it consumes a [`Transport`] that sends one request and
//! returns one reply, and an [`EntryDecoder`] that understands directory
//! entry layouts.
//!
//! # Components
//!
//! - [`Volume`] - per-mount façade; every operation below is a method on it
//! - [`FileNode`] / [`NodeRegistry`] - client-side identity of remote files
//! - Handle table ([`Volume::acquire`], [`Volume::release`]) - many logical
//!   opens multiplexed onto few server handles, reference counted
//! - Reconnect repair ([`Volume::ensure_usable`]) - reopens handles after the
//!   transport reconnects, or revokes the node
//! - [`DirCursor`] - paged, resumable directory listings
//! - [`Volume::mutate_with_retry_guard`] - delete/rename that tolerates a lost
//!   reply across a reconnect
//! - [`SillyNameGenerator`] / [`Volume::unlink`] - temporary names for
//!   unlinking files that are still open
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use oxsmb_core::testing::{MockServer, SimpleDecoder};
//! use oxsmb_core::{AccessMode, CloseMode, NodeKind, RemotePath, Volume, VolumeConfig};
//!
//! let server = Arc::new(MockServer::new());
//! server.add_file("notes.txt", 12);
//!
//! let volume = Volume::new(Arc::clone(&server), Arc::new(SimpleDecoder), VolumeConfig::default())?;
//! let node = volume.lookup(&RemotePath::new("notes.txt"), NodeKind::File, None);
//!
//! let token = volume.acquire(&node, AccessMode::READ)?;
//! volume.release(&node, token, CloseMode::Final)?;
//!
//! let names: Vec<String> = volume
//!     .list_dir(&volume.root())?
//!     .map(|entry| entry.map(|e| e.name))
//!     .collect::<Result<_, _>>()?;
//! assert_eq!(names, ["notes.txt"]);
//! # Ok::<(), oxsmb_core::Error>(())
//! ```

pub mod config;
pub mod entry;
pub mod enumeration;
pub mod error;
pub mod handle_table;
pub mod mutation;
pub mod node;
pub mod reconnect;
pub mod silly_rename;
pub mod stats;
pub mod testing;
pub mod transport;
pub mod volume;

pub use config::VolumeConfig;
pub use entry::{DirEntry, EntryDecoder, FileAttributes, InfoLevel};
pub use enumeration::DirCursor;
pub use error::{Error, Result};
pub use handle_table::{CloseMode, HandleToken};
pub use mutation::Mutation;
pub use node::{FileNode, NodeId, NodeKind, NodeRegistry, RemotePath, Target};
pub use reconnect::ReconnectState;
pub use silly_rename::SillyNameGenerator;
pub use stats::{VolumeStats, VolumeStatsSnapshot};
pub use transport::{
    AccessMode, ReconnectCallback, Reply, Request, RequestKind, SearchFlags, SearchHandle,
    SearchPage, ServerHandle, Transport, WireError, WireStatus,
};
pub use volume::Volume;
