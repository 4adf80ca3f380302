//! Delete and rename with lost-reply disambiguation.
//!
//! If the connection drops after the server executed a delete but before its
//! reply arrived, the transport re-sends the request and the second copy
//! finds nothing to delete. The guard recognises that case (a `NotFound` on a
//! retransmitted request) and checks the server's current state to decide
//! whether the first copy landed.
//!
//! The check is a heuristic. A third party creating or removing the same
//! names in the gap can make it report success or failure wrongly.

use tracing::{debug, info, instrument};

use crate::error::{Error, Result, WireResultExt};
use crate::node::{FileNode, RemotePath};
use crate::transport::{Reply, Request, Transport, WireStatus};
use crate::volume::{Volume, unexpected_reply};

/// A destructive namespace operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Remove `path`.
    Delete {
        /// Path to remove.
        path: RemotePath,
    },
    /// Move `from` to `to`.
    Rename {
        /// Existing path.
        from: RemotePath,
        /// Destination path.
        to: RemotePath,
    },
}

impl Mutation {
    /// The path the operation acts on.
    pub fn path(&self) -> &RemotePath {
        match self {
            Mutation::Delete { path } => path,
            Mutation::Rename { from, .. } => from,
        }
    }

    fn request(&self) -> Request {
        match self {
            Mutation::Delete { path } => Request::Delete { path: path.clone() },
            Mutation::Rename { from, to } => Request::Rename {
                from: from.clone(),
                to: to.clone(),
            },
        }
    }
}

impl<T: Transport> Volume<T> {
    /// Sends `op`, treating a lost-reply `NotFound` as success when the
    /// server's state shows the operation took effect.
    ///
    /// - Delete: succeeds if the target is now absent.
    /// - Rename: succeeds if the old name is absent and the new one present.
    ///
    /// Any other outcome, including a failed re-check, returns the original
    /// error.
    #[instrument(level = "debug", skip(self), fields(path = %op.path()))]
    pub fn mutate_with_retry_guard(&self, op: &Mutation) -> Result<()> {
        let err = match self.send(&op.request()) {
            Ok(Reply::Done) => return Ok(()),
            Ok(reply) => return Err(unexpected_reply(op.path(), &reply)),
            Err(err) => err,
        };
        if err.status != WireStatus::NotFound || !err.retransmitted {
            return Err(Error::from_wire(err, op.path()));
        }

        debug!("retransmitted request reported not found, checking server state");
        if self.earlier_copy_applied(op) {
            self.stats.record_guard_absorption();
            info!("treating retransmitted mutation as applied");
            return Ok(());
        }
        Err(Error::from_wire(err, op.path()))
    }

    fn earlier_copy_applied(&self, op: &Mutation) -> bool {
        let check = match op {
            Mutation::Delete { path } => self.path_exists(path).map(|exists| !exists),
            Mutation::Rename { from, to } => self
                .path_exists(from)
                .and_then(|old| if old { Ok(false) } else { self.path_exists(to) }),
        };
        check.unwrap_or_else(|err| {
            debug!(error = %err, "state check failed");
            false
        })
    }

    /// Deletes `node` on the server and drops its path mapping.
    pub fn delete(&self, node: &FileNode) -> Result<()> {
        node.check_not_revoked()?;
        let path = node.path();
        if path.is_root() {
            return Err(Error::InvalidArgument("cannot delete the share root".into()));
        }
        self.mutate_with_retry_guard(&Mutation::Delete { path: path.clone() })?;
        self.registry.invalidate_path(&path, node.id());
        Ok(())
    }

    /// Renames `node` to `new_name` inside `new_parent`.
    ///
    /// On success the node, and every registered node beneath it, carry the
    /// new path.
    pub fn rename(&self, node: &FileNode, new_parent: &FileNode, new_name: &str) -> Result<()> {
        node.check_not_revoked()?;
        if !new_parent.is_directory() {
            return Err(Error::NotADirectory(new_parent.path()));
        }
        if new_name.is_empty() || new_name.contains(['/', '\\']) {
            return Err(Error::InvalidArgument(format!("bad file name {new_name:?}")));
        }
        let from = node.path();
        if from.is_root() {
            return Err(Error::InvalidArgument("cannot rename the share root".into()));
        }
        let to = new_parent.path().join(new_name);
        self.mutate_with_retry_guard(&Mutation::Rename {
            from,
            to: to.clone(),
        })?;
        self.registry.update_path(node, to);
        Ok(())
    }

    /// Whether `path` exists on the server.
    pub(crate) fn path_exists(&self, path: &RemotePath) -> Result<bool> {
        match self.send(&Request::QueryInfo { path: path.clone() }) {
            Ok(Reply::Info(_)) => Ok(true),
            Ok(reply) => Err(unexpected_reply(path, &reply)),
            Err(err) if err.status == WireStatus::NotFound => Ok(false),
            Err(err) => Err(err).at(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_requests() {
        let delete = Mutation::Delete {
            path: RemotePath::new("a"),
        };
        assert_eq!(delete.path(), &RemotePath::new("a"));
        assert_eq!(
            delete.request(),
            Request::Delete {
                path: RemotePath::new("a")
            }
        );

        let rename = Mutation::Rename {
            from: RemotePath::new("a"),
            to: RemotePath::new("b"),
        };
        assert_eq!(rename.path(), &RemotePath::new("a"));
        assert!(matches!(rename.request(), Request::Rename { to, .. } if to == RemotePath::new("b")));
    }
}
