//! The per-mount façade.
//!
//! A [`Volume`] owns the transport, the node registry, configuration and
//! statistics. The filesystem layer talks only to it; the handle, reconnect,
//! enumeration, mutation and rename operations are implemented on `Volume`
//! in their own modules.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::VolumeConfig;
use crate::entry::{DirEntry, EntryDecoder};
use crate::error::{Error, Result, WireResultExt};
use crate::handle_table::Handle;
use crate::node::{FileNode, NodeId, NodeKind, NodeRegistry, ROOT_NODE_ID, RemotePath};
use crate::stats::{VolumeStats, VolumeStatsSnapshot};
use crate::transport::{AccessMode, Reply, Request, ServerHandle, Transport, WireError};

/// One mounted share.
pub struct Volume<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) decoder: Arc<dyn EntryDecoder>,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) config: VolumeConfig,
    pub(crate) stats: Arc<VolumeStats>,
}

impl<T: Transport> Volume<T> {
    /// Creates a volume over `transport`.
    ///
    /// Registers a reconnect callback that marks every node holding handles
    /// as needing a reopen. The callback takes no node lock, so the transport
    /// may run it from inside any request. It holds the registry weakly and
    /// becomes a no-op once the volume is dropped.
    pub fn new(
        transport: Arc<T>,
        decoder: Arc<dyn EntryDecoder>,
        config: VolumeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(NodeRegistry::with_root());

        let weak = Arc::downgrade(&registry);
        transport.on_reconnect(Box::new(move || {
            if let Some(registry) = weak.upgrade() {
                let generation = registry.note_reconnect();
                info!(generation, "transport reconnected, open nodes need reopen");
            }
        }));

        debug!(
            page_size = config.page_size,
            info_level = ?config.info_level,
            "volume created"
        );
        Ok(Self {
            transport,
            decoder,
            registry,
            config,
            stats: Arc::new(VolumeStats::new()),
        })
    }

    /// The share root directory.
    pub fn root(&self) -> Arc<FileNode> {
        self.registry.root()
    }

    /// Configuration the volume was created with.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Current traffic counters.
    pub fn stats(&self) -> VolumeStatsSnapshot {
        self.stats.snapshot()
    }

    /// The node registry.
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Looks up a node by ID.
    pub fn node(&self, id: NodeId) -> Option<Arc<FileNode>> {
        self.registry.get(id)
    }

    /// Returns the node for `path`, creating it if needed.
    ///
    /// An existing node is replaced by a fresh one if it is revoked, has a
    /// different kind, or carries a different server file ID (the file was
    /// replaced on the server). The replaced node leaves the registry at once
    /// if it holds no handles, otherwise when its last handle is released.
    pub fn lookup(&self, path: &RemotePath, kind: NodeKind, file_id: Option<u64>) -> Arc<FileNode> {
        if path.is_root() {
            return self.registry.root();
        }
        if let Some(existing) = self.registry.get_by_path(path) {
            let replaced = matches!(
                (existing.file_id(), file_id),
                (Some(old), Some(new)) if old != new
            );
            if existing.kind() == kind && !replaced && !existing.is_revoked() {
                return existing;
            }
            debug!(node = existing.id(), path = %path, "replacing stale node");
            existing.mark_superseded();
            if existing.open_handle_count() == 0 {
                self.registry.remove(existing.id());
            } else {
                self.registry.invalidate_path(path, existing.id());
            }
        }
        let node_path = path.clone();
        self.registry.get_or_insert_with(path, move |id| {
            FileNode::new(id, node_path.clone(), kind, file_id)
        })
    }

    /// Returns the node for an entry listed in `parent`, caching its attributes.
    pub fn lookup_entry(&self, parent: &FileNode, entry: &DirEntry) -> Arc<FileNode> {
        let kind = if entry.attributes.is_directory {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        let node = self.lookup(&parent.path().join(&entry.name), kind, entry.file_id);
        node.set_attributes(entry.attributes);
        node
    }

    /// Drops a node the filesystem layer no longer references.
    ///
    /// Refused (returns false) for the root and for nodes still holding
    /// handles.
    pub fn forget(&self, node: &FileNode) -> bool {
        if node.id() == ROOT_NODE_ID || node.open_handle_count() > 0 {
            return false;
        }
        self.registry.remove(node.id()).is_some()
    }

    pub(crate) fn send(&self, request: &Request) -> std::result::Result<Reply, WireError> {
        trace!(kind = ?request.kind(), "sending request");
        self.transport.send_request(request)
    }

    pub(crate) fn open_on_wire(
        &self,
        path: &RemotePath,
        access: AccessMode,
        directory: bool,
    ) -> Result<ServerHandle> {
        let request = Request::Open {
            path: path.clone(),
            access,
            directory,
        };
        match self.send(&request).at(path)? {
            Reply::Opened(server) => Ok(server),
            reply => Err(unexpected_reply(path, &reply)),
        }
    }

    /// Closes a handle and its lock handles. Failures are logged, not returned.
    pub(crate) fn close_on_wire(&self, path: &RemotePath, handle: &Handle) {
        for lock in &handle.lock_handles {
            self.close_quietly(path, *lock);
            self.stats.record_wire_close();
        }
        self.close_quietly(path, handle.server);
        self.stats.record_wire_close();
    }

    pub(crate) fn close_quietly(&self, path: &RemotePath, server: ServerHandle) {
        match self.send(&Request::Close { handle: server }) {
            Ok(_) => debug!(path = %path, ?server, "closed handle"),
            Err(err) => warn!(path = %path, ?server, error = %err, "close failed, dropping handle"),
        }
    }
}

impl<T: Transport> fmt::Debug for Volume<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("config", &self.config)
            .field("nodes", &self.registry.len())
            .finish_non_exhaustive()
    }
}

fn reply_name(reply: &Reply) -> &'static str {
    match reply {
        Reply::Opened(_) => "Opened",
        Reply::Done => "Done",
        Reply::Info(_) => "Info",
        Reply::SearchPage(_) => "SearchPage",
    }
}

/// Protocol error for a reply of the wrong shape.
pub(crate) fn unexpected_reply(path: &RemotePath, reply: &Reply) -> Error {
    Error::Protocol(format!("{path}: unexpected {} reply", reply_name(reply)))
}

/// Accepts only [`Reply::Done`].
pub(crate) fn expect_done(path: &RemotePath, reply: &Reply) -> Result<()> {
    match reply {
        Reply::Done => Ok(()),
        other => Err(unexpected_reply(path, other)),
    }
}
