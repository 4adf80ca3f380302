//! Testing utilities for code built on this crate.
//!
//! - [`MockServer`]: an in-memory share implementing [`Transport`](crate::Transport),
//!   with a request log, fault injection and a reconnect trigger
//! - [`SimpleDecoder`]: the entry layout [`MockServer`] encodes pages in
//!
//! # Usage
//!
//! ```
//! use oxsmb_core::testing::mock_volume;
//! use oxsmb_core::{RequestKind, VolumeConfig, WireStatus};
//!
//! let (server, volume) = mock_volume(VolumeConfig::default())?;
//! server.add_file("a.txt", 1);
//! server.fail_next(RequestKind::FindFirst, WireStatus::TimedOut);
//! assert!(volume.list_dir(&volume.root()).is_err());
//! # Ok::<(), oxsmb_core::Error>(())
//! ```

pub mod codec;
pub mod server;

use std::sync::Arc;

pub use codec::{ENTRY_HEADER_LEN, SimpleDecoder, encode_entry};
pub use server::{MockServer, RequestHook};

use crate::config::VolumeConfig;
use crate::error::Result;
use crate::volume::Volume;

/// Creates a [`MockServer`] and a volume mounted on it.
pub fn mock_volume(config: VolumeConfig) -> Result<(Arc<MockServer>, Volume<MockServer>)> {
    let server = Arc::new(MockServer::new());
    let volume = Volume::new(Arc::clone(&server), Arc::new(SimpleDecoder), config)?;
    Ok((server, volume))
}
