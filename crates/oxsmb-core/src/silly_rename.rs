//! Temporary names for unlinking files that are still open.
//!
//! Removing a file that other callers hold open would break their handles, so
//! the file is renamed out of the way, hidden, and deleted when the last
//! handle closes.

use tracing::{debug, instrument, trace, warn};

use crate::error::{Error, Result};
use crate::mutation::Mutation;
use crate::node::{FileNode, RemotePath, Target};
use crate::transport::{Request, Transport};
use crate::volume::Volume;

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Number of counter-based names a generator produces before giving up.
pub const MAX_COUNTER_CANDIDATES: u32 = 62 * 62 * 62;

/// Produces candidate temporary names for one node.
///
/// A node with a stable file ID gets exactly one name derived from it. Other
/// nodes get `prefix + pid + ddd`, where `ddd` is a three-digit base-62
/// counter that advances on every candidate.
///
/// A candidate that could not be tried can be handed back with
/// [`SillyNameGenerator::put_back`]; the next call returns it again.
#[derive(Debug, Clone)]
pub struct SillyNameGenerator {
    prefix: String,
    process_id: u32,
    /// Counter digits, most significant first.
    digits: [u8; 3],
    issued: u32,
    returned: Option<String>,
}

impl SillyNameGenerator {
    /// Creates a generator starting at counter `000`.
    pub fn new(prefix: impl Into<String>, process_id: u32) -> Self {
        Self {
            prefix: prefix.into(),
            process_id,
            digits: [0; 3],
            issued: 0,
            returned: None,
        }
    }

    /// Returns the next candidate, or `None` once the generator is exhausted.
    pub fn next_candidate(&mut self, file_id: Option<u64>) -> Option<String> {
        if let Some(name) = self.returned.take() {
            return Some(name);
        }
        if let Some(file_id) = file_id {
            if self.issued > 0 {
                return None;
            }
            self.issued = 1;
            return Some(format!("{}{file_id:016x}", self.prefix));
        }

        if self.issued >= MAX_COUNTER_CANDIDATES {
            return None;
        }
        let suffix: String = self
            .digits
            .iter()
            .map(|d| char::from(BASE62[usize::from(*d)]))
            .collect();
        let name = format!("{}{:x}{suffix}", self.prefix, self.process_id);
        self.issued += 1;
        self.advance();
        Some(name)
    }

    /// Candidates handed out so far.
    pub fn issued(&self) -> u32 {
        self.issued
    }

    /// Returns a candidate whose attempt failed for a reason other than the
    /// name being taken.
    pub fn put_back(&mut self, candidate: String) {
        self.returned = Some(candidate);
    }

    fn advance(&mut self) {
        for digit in self.digits.iter_mut().rev() {
            *digit += 1;
            if usize::from(*digit) < BASE62.len() {
                return;
            }
            *digit = 0;
        }
    }
}

impl<T: Transport> Volume<T> {
    /// Next temporary name for `node`.
    ///
    /// The generator lives on the node, so successive calls keep advancing.
    /// Fails with [`Error::NamesExhausted`] when no candidates remain.
    pub fn next_candidate(&self, node: &FileNode) -> Result<String> {
        let mut state = node.lock_state();
        let generator = state.silly_names.get_or_insert_with(|| {
            SillyNameGenerator::new(self.config.silly_prefix.clone(), self.config.process_id)
        });
        generator
            .next_candidate(node.file_id())
            .ok_or_else(|| Error::NamesExhausted(node.path()))
    }

    /// Unlinks `node` from directory `parent`.
    ///
    /// A file nobody holds open is deleted outright. Otherwise it is renamed
    /// to a temporary name, optionally hidden, and marked delete-on-close on
    /// the server. If the server will not take the disposition, the node
    /// remembers it and the final [`Volume::release`] deletes the file.
    #[instrument(level = "debug", skip(self, parent, node), fields(path = %node.path()))]
    pub fn unlink(&self, parent: &FileNode, node: &FileNode) -> Result<()> {
        node.check_not_revoked()?;
        if !parent.is_directory() {
            return Err(Error::NotADirectory(parent.path()));
        }
        if node.open_handle_count() == 0 {
            return self.delete(node);
        }

        let renamed = self.silly_rename(parent, node)?;
        if self.config.hide_silly_renamed
            && let Err(err) = self.send(&Request::SetHidden {
                path: renamed.clone(),
            })
        {
            debug!(error = %err, "could not hide renamed file");
        }
        self.request_delete_on_close(node);
        Ok(())
    }

    fn silly_rename(&self, parent: &FileNode, node: &FileNode) -> Result<RemotePath> {
        let from = node.path();
        loop {
            let candidate = self.next_candidate(node)?;
            match self.try_silly_name(parent, node, &from, &candidate) {
                Ok(Some(to)) => return Ok(to),
                Ok(None) => trace!(candidate, "candidate name in use"),
                Err(err) => {
                    // The name was never shown to be taken.
                    if let Some(names) = node.lock_state().silly_names.as_mut() {
                        names.put_back(candidate);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Renames `node` to `candidate`. `Ok(None)` means the name is taken.
    fn try_silly_name(
        &self,
        parent: &FileNode,
        node: &FileNode,
        from: &RemotePath,
        candidate: &str,
    ) -> Result<Option<RemotePath>> {
        if self.config.probe_silly_names
            && self.query(Target::ChildOf(parent, candidate))?.is_some()
        {
            return Ok(None);
        }
        let to = parent.path().join(candidate);
        let op = Mutation::Rename {
            from: from.clone(),
            to: to.clone(),
        };
        match self.mutate_with_retry_guard(&op) {
            Ok(()) => {
                self.registry.update_path(node, to.clone());
                self.stats.record_silly_rename();
                debug!(to = %to, "renamed open file out of the way");
                Ok(Some(to))
            }
            Err(Error::AlreadyExists(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn request_delete_on_close(&self, node: &FileNode) {
        let mut state = node.lock_state();
        let server = state
            .handles
            .delete_capable_handle()
            .filter(|_| state.reconnect.is_stable());
        let requested = match server {
            Some(handle) => match self.send(&Request::SetDeleteOnClose { handle }) {
                Ok(_) => true,
                Err(err) => {
                    warn!(error = %err, "server refused delete-on-close");
                    false
                }
            },
            None => false,
        };
        if !requested {
            state.delete_on_close = true;
            debug!("delete-on-close recorded locally");
        }
    }
}
