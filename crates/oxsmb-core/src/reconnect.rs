//! Handle repair after a transport reconnect.
//!
//! When the transport re-establishes its connection every server handle it
//! granted is gone. Nodes that held handles become
//! [`ReconnectState::NeedsReopen`]; the next caller to use such a node
//! reopens each handle with its original access and installs the new server
//! values under the existing slots, so outstanding tokens stay valid.
//!
//! ```text
//! Stable ──reconnect──▶ NeedsReopen ──use──▶ Reopening ──ok──▶ Stable
//!                            ▲                  │  │
//!                            └─ok, interrupted──┘  └─failure──▶ NeedsRevoke
//! ```
//!
//! A repair that another reconnect interrupts closes what it reopened and
//! starts over. Only one thread repairs a node at a time. Others arriving
//! meanwhile wait on the node's condition variable. `NeedsRevoke` is terminal.

use parking_lot::MutexGuard;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::node::{FileNode, NodeState, RemotePath};
use crate::transport::{AccessMode, ServerHandle, Transport};
use crate::volume::Volume;

/// Reconnect state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReconnectState {
    /// Handles are valid on the current connection.
    #[default]
    Stable,
    /// The connection was re-established; handles must be reopened before use.
    NeedsReopen,
    /// A caller is reopening the handles right now.
    Reopening {
        /// Another reconnect happened while the repair was running.
        interrupted: bool,
    },
    /// Repair failed. Every operation on the node fails with `Revoked`.
    NeedsRevoke,
}

impl ReconnectState {
    /// State after the transport reports a reconnect.
    #[must_use]
    pub fn after_reconnect(self) -> Self {
        match self {
            ReconnectState::Stable | ReconnectState::NeedsReopen => ReconnectState::NeedsReopen,
            ReconnectState::Reopening { .. } => ReconnectState::Reopening { interrupted: true },
            ReconnectState::NeedsRevoke => ReconnectState::NeedsRevoke,
        }
    }

    /// State after a repair attempt finishes.
    #[must_use]
    pub fn after_repair(self, succeeded: bool) -> Self {
        match (self, succeeded) {
            (_, false) | (ReconnectState::NeedsRevoke, true) => ReconnectState::NeedsRevoke,
            (ReconnectState::Reopening { interrupted: true }, true) => ReconnectState::NeedsReopen,
            (_, true) => ReconnectState::Stable,
        }
    }

    /// Handles may be used as they are.
    pub fn is_stable(self) -> bool {
        self == ReconnectState::Stable
    }

    /// A repair is in progress.
    pub fn is_reopening(self) -> bool {
        matches!(self, ReconnectState::Reopening { .. })
    }

    /// The node is permanently unusable.
    pub fn is_revoked(self) -> bool {
        self == ReconnectState::NeedsRevoke
    }
}

/// One handle to reopen, captured while the node lock was held.
#[derive(Debug, Clone, Copy)]
struct ReopenSlot {
    slot: u64,
    access: AccessMode,
    has_lock_handles: bool,
}

impl<T: Transport> Volume<T> {
    /// Marks `node` as needing a reopen. Returns the resulting state.
    pub fn mark_needs_reopen(&self, node: &FileNode) -> ReconnectState {
        let state = node.mark_needs_reopen();
        debug!(node = node.id(), ?state, "marked for reopen");
        state
    }

    /// Makes sure `node` can be used on the current connection.
    ///
    /// Repairs the node if it needs a reopen, waits if another caller is
    /// repairing it, and fails with [`Error::Revoked`] without sending
    /// anything if it has been revoked.
    pub fn ensure_usable(&self, node: &FileNode) -> Result<()> {
        self.usable_state(node).map(drop)
    }

    /// Like [`Volume::ensure_usable`], returning the locked state on success.
    ///
    /// The returned state is always [`ReconnectState::Stable`].
    pub(crate) fn usable_state<'n>(&self, node: &'n FileNode) -> Result<MutexGuard<'n, NodeState>> {
        let mut state = node.lock_state();
        loop {
            match state.reconnect {
                ReconnectState::Stable => return Ok(state),
                ReconnectState::NeedsRevoke => return Err(Error::Revoked(node.path())),
                ReconnectState::Reopening { .. } => node.wait_for_repair(&mut state),
                ReconnectState::NeedsReopen => state = self.repair(node, state)?,
            }
        }
    }

    /// Reopens every handle of `node`. The caller has seen `NeedsReopen`.
    ///
    /// Returns the state once the attempt is over. It is `NeedsReopen` again
    /// if the transport reconnected while the handles were being reopened.
    #[instrument(level = "debug", skip_all, fields(node = node.id(), path = %node.path()))]
    fn repair<'n>(
        &self,
        node: &'n FileNode,
        mut state: MutexGuard<'n, NodeState>,
    ) -> Result<MutexGuard<'n, NodeState>> {
        state.reconnect = ReconnectState::Reopening { interrupted: false };
        let plan: Vec<ReopenSlot> = state
            .handles
            .iter()
            .map(|(slot, h)| ReopenSlot {
                slot,
                access: h.access,
                has_lock_handles: !h.lock_handles.is_empty(),
            })
            .collect();
        let path = node.path();
        let directory = node.is_directory();

        let outcome = MutexGuard::unlocked(&mut state, || self.reopen_all(&path, directory, &plan));
        node.catch_up(&mut state);

        let reopened = match outcome {
            Ok(reopened) => reopened,
            Err(err) => {
                state.reconnect = state.reconnect.after_repair(false);
                self.stats.record_revoke();
                warn!(error = %err, "reopen failed, revoking node");
                node.notify_repaired();
                return Err(Error::Revoked(path));
            }
        };

        state.reconnect = state.reconnect.after_repair(true);
        node.notify_repaired();
        if state.reconnect.is_stable() {
            for (slot, server) in reopened {
                state.handles.install(slot, server);
            }
            debug!(handles = plan.len(), "node repaired");
            return Ok(state);
        }

        // Some of these may have been opened on the new connection.
        info!(handles = reopened.len(), "reconnected again during repair, starting over");
        MutexGuard::unlocked(&mut state, || {
            for (_, server) in &reopened {
                self.close_quietly(&path, *server);
            }
        });
        node.catch_up(&mut state);
        Ok(state)
    }

    /// Opens a replacement for each planned handle. Runs without the node lock.
    ///
    /// On failure, handles already reopened in this attempt are closed.
    fn reopen_all(
        &self,
        path: &RemotePath,
        directory: bool,
        plan: &[ReopenSlot],
    ) -> Result<Vec<(u64, ServerHandle)>> {
        let mut reopened = Vec::with_capacity(plan.len());
        for entry in plan {
            let attempt = if entry.has_lock_handles {
                Err(Error::NotSupported(path.clone()))
            } else {
                self.open_on_wire(path, entry.access, directory)
            };
            match attempt {
                Ok(server) => {
                    self.stats.record_reopen();
                    reopened.push((entry.slot, server));
                }
                Err(err) => {
                    for (_, server) in &reopened {
                        self.close_quietly(path, *server);
                    }
                    return Err(err);
                }
            }
        }
        Ok(reopened)
    }
}
