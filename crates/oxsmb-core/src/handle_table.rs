//! Per-node handle sets and the acquire/release lifecycle.
//!
//! Callers never see a server handle directly. [`Volume::acquire`] hands out
//! a [`HandleToken`] naming a slot in the node's [`HandleSet`]; the slot keeps
//! the same number across reopens while the server value behind it changes.
//!
//! # Handle Lifecycle
//!
//! 1. **Acquire**: reuse a shareable handle whose access covers the request,
//!    or open a new one with exactly the requested access
//! 2. **Resolve**: [`Volume::server_handle`] maps the token to the current
//!    server value for I/O
//! 3. **Release**: drop one reference; the last one closes the handle on the
//!    wire (or locally, if the session that granted it is gone)
//!
//! The node lock is held across the requests these operations send. A
//! reconnect reported meanwhile is noticed once the request returns: a handle
//! opened across it is closed again and the open retried after repair.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use parking_lot::MutexGuard;
use tracing::{debug, instrument, trace, warn};

use crate::error::{Error, Result, WireResultExt};
use crate::mutation::Mutation;
use crate::node::{FileNode, NodeId, NodeState, RemotePath};
use crate::reconnect::ReconnectState;
use crate::transport::{AccessMode, Request, ServerHandle, Transport};
use crate::volume::{Volume, expect_done};

/// One server handle and the callers sharing it.
#[derive(Debug)]
pub(crate) struct Handle {
    pub(crate) server: ServerHandle,
    pub(crate) access: AccessMode,
    /// Number of outstanding tokens. Never zero while the handle is in a set.
    pub(crate) refs: u32,
    /// Directory handles are private to one caller.
    pub(crate) shareable: bool,
    /// Secondary handles opened for byte-range locking.
    pub(crate) lock_handles: Vec<ServerHandle>,
}

/// The handles one node holds, keyed by slot number.
///
/// Slot numbers start at 1; 0 is never handed out.
#[derive(Debug)]
pub(crate) struct HandleSet {
    handles: BTreeMap<u64, Handle>,
    next_slot: u64,
}

impl HandleSet {
    pub(crate) fn new() -> Self {
        Self {
            handles: BTreeMap::new(),
            next_slot: 1,
        }
    }

    /// Finds a shareable handle whose access covers `want`.
    ///
    /// A read+write handle wins over a narrower one so that callers converge
    /// on a single handle.
    pub(crate) fn find_reusable(&self, want: AccessMode) -> Option<u64> {
        let candidates = || {
            self.handles
                .iter()
                .filter(|(_, h)| h.shareable && h.access.contains(want))
        };
        candidates()
            .find(|(_, h)| h.access.contains(AccessMode::READ | AccessMode::WRITE))
            .or_else(|| candidates().next())
            .map(|(slot, _)| *slot)
    }

    /// Adds a handle with one reference and returns its slot.
    pub(crate) fn insert(&mut self, server: ServerHandle, access: AccessMode, shareable: bool) -> u64 {
        loop {
            let slot = self.next_slot;
            self.next_slot = self.next_slot.checked_add(1).unwrap_or(1);
            if slot == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.handles.entry(slot) {
                entry.insert(Handle {
                    server,
                    access,
                    refs: 1,
                    shareable,
                    lock_handles: Vec::new(),
                });
                return slot;
            }
        }
    }

    /// Adds a reference to an existing handle.
    pub(crate) fn retain(&mut self, slot: u64) -> Result<()> {
        let handle = self.get_mut(slot).ok_or(Error::InvalidHandle(slot))?;
        handle.refs += 1;
        Ok(())
    }

    /// Drops one reference. Returns the handle once its last reference is gone.
    pub(crate) fn release(&mut self, slot: u64) -> Result<Option<Handle>> {
        let handle = self.get_mut(slot).ok_or(Error::InvalidHandle(slot))?;
        handle.refs = handle.refs.saturating_sub(1);
        if handle.refs > 0 {
            return Ok(None);
        }
        Ok(self.handles.remove(&slot))
    }

    pub(crate) fn get(&self, slot: u64) -> Option<&Handle> {
        self.handles.get(&slot)
    }

    pub(crate) fn get_mut(&mut self, slot: u64) -> Option<&mut Handle> {
        self.handles.get_mut(&slot)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, &Handle)> {
        self.handles.iter().map(|(slot, h)| (*slot, h))
    }

    /// Replaces the server value behind `slot` after a reopen.
    pub(crate) fn install(&mut self, slot: u64, server: ServerHandle) -> bool {
        match self.get_mut(slot) {
            Some(handle) => {
                handle.server = server;
                true
            }
            None => false,
        }
    }

    /// A handle that can carry a delete disposition, preferring write access.
    pub(crate) fn delete_capable_handle(&self) -> Option<ServerHandle> {
        self.handles
            .values()
            .find(|h| h.access.contains(AccessMode::WRITE))
            .or_else(|| self.handles.values().next())
            .map(|h| h.server)
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub(crate) fn total_refs(&self) -> u32 {
        self.handles.values().map(|h| h.refs).sum()
    }
}

/// Proof that a caller holds one reference to a handle.
///
/// Tokens cannot be cloned; [`Volume::release`] consumes them, so one token
/// releases exactly one reference.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "a handle token must be released"]
pub struct HandleToken {
    node: NodeId,
    slot: u64,
}

impl HandleToken {
    pub(crate) fn new(node: NodeId, slot: u64) -> Self {
        Self { node, slot }
    }

    /// Node the handle belongs to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Slot of the handle within its node.
    pub fn slot(&self) -> u64 {
        self.slot
    }
}

/// How a release should treat pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseMode {
    /// Plain release.
    #[default]
    Normal,
    /// The caller's last use of the file: push any pending size first.
    Final,
}

impl<T: Transport> Volume<T> {
    /// Obtains a handle on `node` granting at least `access`.
    ///
    /// File handles are shared: if an open handle's access covers the request
    /// its count is bumped and no request is sent. Otherwise a handle with
    /// exactly `access` is opened. Directory acquisitions always open a
    /// private handle.
    #[instrument(level = "debug", skip(self, node), fields(node = node.id(), path = %node.path()))]
    pub fn acquire(&self, node: &FileNode, access: AccessMode) -> Result<HandleToken> {
        loop {
            let mut state = self.usable_state(node)?;

            if !node.is_directory()
                && let Some(slot) = state.handles.find_reusable(access)
            {
                state.handles.retain(slot)?;
                self.stats.record_handle_reuse();
                trace!(slot, "reusing open handle");
                return Ok(HandleToken::new(node.id(), slot));
            }

            // The node lock stays held across the open so two callers wanting
            // the same access end up sharing one handle.
            let path = node.path();
            let server = self.open_on_wire(&path, access, node.is_directory())?;
            self.stats.record_wire_open();
            if node.reconnected_since(&state) {
                debug!(?server, "transport reconnected during open, retrying");
                self.close_quietly(&path, server);
                self.stats.record_wire_close();
                continue;
            }
            let slot = state.handles.insert(server, access, !node.is_directory());
            debug!(slot, ?server, "opened handle");
            return Ok(HandleToken::new(node.id(), slot));
        }
    }

    /// Gives back one reference obtained from [`Volume::acquire`].
    ///
    /// The last reference closes the handle on the wire. With
    /// [`CloseMode::Final`] a size recorded by [`Volume::set_pending_size`] is
    /// pushed first; if that fails the handle is still released and the error
    /// returned.
    ///
    /// While the node is being repaired the release waits. If the node then
    /// needs a reopen or has been revoked, the handle is dropped without
    /// closing it on the wire. Two things still reach the server from such a
    /// node unless it is revoked:
    ///
    /// - a final release with a pending size repairs the node first, so the
    ///   size is pushed on a live handle
    /// - a delete recorded by [`Volume::unlink`] runs once the last handle
    ///   is gone
    ///
    /// On a revoked node both are lost and [`Error::Revoked`] is returned
    /// after the handle is dropped.
    #[instrument(level = "debug", skip(self, node, token), fields(node = node.id(), slot = token.slot))]
    pub fn release(&self, node: &FileNode, token: HandleToken, mode: CloseMode) -> Result<()> {
        if token.node != node.id() {
            return Err(Error::InvalidHandle(token.slot));
        }
        let mut state = node.lock_state();
        while state.reconnect.is_reopening() {
            node.wait_for_repair(&mut state);
        }
        if state.handles.get(token.slot).is_none() {
            return Err(Error::InvalidHandle(token.slot));
        }

        if mode == CloseMode::Final
            && state.pending_size.is_some()
            && state.reconnect == ReconnectState::NeedsReopen
        {
            drop(state);
            state = match self.usable_state(node) {
                Ok(state) => state,
                // Revoked; handled below.
                Err(_) => node.lock_state(),
            };
        }
        if !state.reconnect.is_stable() {
            return self.release_detached(node, state, token.slot, mode);
        }

        let server = state
            .handles
            .get(token.slot)
            .map(|h| h.server)
            .ok_or(Error::InvalidHandle(token.slot))?;
        let path = node.path();
        let mut result = Ok(());
        if mode == CloseMode::Final
            && let Some(size) = state.pending_size.take()
        {
            let flushed = self
                .send(&Request::SetEndOfFile {
                    handle: server,
                    size,
                })
                .at(&path)
                .and_then(|reply| expect_done(&path, &reply));
            if let Err(err) = flushed {
                warn!(error = %err, size, "failed to push end-of-file on final close");
                result = Err(err);
            }
        }

        let Some(handle) = state.handles.release(token.slot)? else {
            trace!(refs = state.handles.total_refs(), "released shared handle");
            return result;
        };
        self.close_on_wire(&path, &handle);
        result.and(self.after_last_handle(node, &mut state, &path))
    }

    /// Releases a handle whose session is gone, without closing it.
    fn release_detached(
        &self,
        node: &FileNode,
        mut state: MutexGuard<'_, NodeState>,
        slot: u64,
        mode: CloseMode,
    ) -> Result<()> {
        let path = node.path();
        let mut result = Ok(());
        if mode == CloseMode::Final
            && let Some(size) = state.pending_size.take()
        {
            warn!(size, "node revoked, end-of-file update lost");
            result = Err(Error::Revoked(path.clone()));
        }

        let Some(handle) = state.handles.release(slot)? else {
            return result;
        };
        debug!(server = ?handle.server, state = ?state.reconnect, "dropped handle from a dead session");
        result.and(self.after_last_handle(node, &mut state, &path))
    }

    /// Work owed once a node's last handle is gone: the recorded delete, and
    /// dropping a node that a lookup has replaced.
    fn after_last_handle(
        &self,
        node: &FileNode,
        state: &mut NodeState,
        path: &RemotePath,
    ) -> Result<()> {
        if !state.handles.is_empty() {
            return Ok(());
        }
        let mut result = Ok(());
        if state.delete_on_close {
            state.delete_on_close = false;
            if state.reconnect.is_revoked() {
                warn!("node revoked, delete on close abandoned");
                result = Err(Error::Revoked(path.clone()));
            } else {
                match self.mutate_with_retry_guard(&Mutation::Delete { path: path.clone() }) {
                    Ok(()) | Err(Error::NotFound(_)) => {
                        self.registry.invalidate_path(path, node.id());
                        debug!("deleted file on final close");
                    }
                    Err(err) => {
                        warn!(error = %err, "delete on final close failed");
                        result = Err(err);
                    }
                }
            }
        }
        if node.is_superseded() && self.registry.remove(node.id()).is_some() {
            debug!("dropped replaced node");
        }
        result
    }

    /// Resolves a token to the server handle to use for I/O.
    ///
    /// Passes through the usability gate, so a node that needs a reopen is
    /// repaired first and the returned value is the new one.
    pub fn server_handle(&self, node: &FileNode, token: &HandleToken) -> Result<ServerHandle> {
        if token.node != node.id() {
            return Err(Error::InvalidHandle(token.slot));
        }
        let state = self.usable_state(node)?;
        state
            .handles
            .get(token.slot)
            .map(|h| h.server)
            .ok_or(Error::InvalidHandle(token.slot))
    }

    /// Opens a secondary handle for byte-range locks on the token's handle.
    ///
    /// The lock handle has the same access as its primary and is closed with
    /// it. Nodes holding lock handles cannot be repaired after a reconnect.
    pub fn open_lock_handle(&self, node: &FileNode, token: &HandleToken) -> Result<ServerHandle> {
        if token.node != node.id() {
            return Err(Error::InvalidHandle(token.slot));
        }
        loop {
            let mut state = self.usable_state(node)?;
            let access = state
                .handles
                .get(token.slot)
                .map(|h| h.access)
                .ok_or(Error::InvalidHandle(token.slot))?;
            let path = node.path();
            let server = self.open_on_wire(&path, access, node.is_directory())?;
            self.stats.record_wire_open();
            if node.reconnected_since(&state) {
                debug!(?server, "transport reconnected during open, retrying");
                self.close_quietly(&path, server);
                self.stats.record_wire_close();
                continue;
            }
            if let Some(handle) = state.handles.get_mut(token.slot) {
                handle.lock_handles.push(server);
            }
            debug!(slot = token.slot, ?server, "opened lock handle");
            return Ok(server);
        }
    }

    /// Records an end-of-file size to push on the next final close.
    pub fn set_pending_size(&self, node: &FileNode, size: u64) -> Result<()> {
        node.check_not_revoked()?;
        let mut state = node.lock_state();
        state.pending_size = Some(size);
        if let Some(attributes) = state.attributes.as_mut() {
            attributes.size = size;
        }
        Ok(())
    }
}
