//! File nodes and the per-volume node registry.
//!
//! A [`FileNode`] is the client-side identity of one remote file or
//! directory. It survives reconnects; the server handles it owns do not.
//! Each node keeps its handle set and reconnect state behind one mutex so
//! that "check the state, then use a handle" is atomic.
//!
//! Reconnects are counted in a generation shared by every node of a
//! registry. Bumping it never takes a node lock, so the transport may report
//! a reconnect from inside a request sent under one. Each node notices the
//! new generation the next time its state is locked.
//!
//! The [`NodeRegistry`] maps remote paths to node IDs and IDs to nodes, in
//! the same two-map layout used for inode tables.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, trace};

use crate::entry::FileAttributes;
use crate::error::{Error, Result};
use crate::handle_table::HandleSet;
use crate::reconnect::ReconnectState;
use crate::silly_rename::SillyNameGenerator;

/// Identifier of a node within one volume.
pub type NodeId = u64;

/// Node ID of the share root.
pub const ROOT_NODE_ID: NodeId = 1;

/// Slash-separated path relative to the share root.
///
/// Both `/` and `\` are accepted as separators on input; empty components are
/// dropped, so `"a//b/"` and `"\\a\\b"` name the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RemotePath(String);

impl RemotePath {
    /// Creates a normalised path.
    pub fn new(path: impl AsRef<str>) -> Self {
        let joined = path
            .as_ref()
            .split(['/', '\\'])
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self(joined)
    }

    /// The share root.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Returns true for the share root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the normalised path without a leading separator.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Appends one name component.
    pub fn join(&self, name: &str) -> Self {
        if self.is_root() {
            Self::new(name)
        } else {
            Self::new(format!("{}/{name}", self.0))
        }
    }

    /// Returns the containing directory, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind('/') {
            Some(idx) => Self(self.0[..idx].to_string()),
            None => Self::root(),
        })
    }

    /// Returns the last component, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        Some(self.0.rsplit('/').next().unwrap_or(&self.0))
    }

    /// Returns true if `self` is `prefix` or lies beneath it.
    pub fn starts_with(&self, prefix: &RemotePath) -> bool {
        prefix.is_root()
            || self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0[prefix.0.len()..].starts_with('/'))
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for RemotePath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Whether a node is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A regular file. Handles may be shared between callers.
    File,
    /// A directory. Every acquisition gets a private handle.
    Directory,
}

/// The node an operation is aimed at.
///
/// Lookups either ask about a node itself or about a named child of a
/// directory node; the two shapes take different wire paths.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// The node itself.
    SelfNode(&'a FileNode),
    /// A named entry inside a directory node.
    ChildOf(&'a FileNode, &'a str),
}

impl<'a> Target<'a> {
    /// Remote path of the target.
    pub fn path(&self) -> RemotePath {
        match self {
            Target::SelfNode(node) => node.path(),
            Target::ChildOf(parent, name) => parent.path().join(name),
        }
    }

    /// The node the target is resolved through.
    pub fn node(&self) -> &'a FileNode {
        match *self {
            Target::SelfNode(node) | Target::ChildOf(node, _) => node,
        }
    }
}

/// Mutable per-node state, guarded by the node's mutex.
#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) reconnect: ReconnectState,
    pub(crate) handles: HandleSet,
    pub(crate) attributes: Option<FileAttributes>,
    /// End-of-file size to push on the final close.
    pub(crate) pending_size: Option<u64>,
    /// Delete the file once its last handle closes.
    pub(crate) delete_on_close: bool,
    /// Created on the first silly rename of this node.
    pub(crate) silly_names: Option<SillyNameGenerator>,
    /// Reconnect generation the state was last checked against.
    pub(crate) session: u64,
}

impl NodeState {
    fn new() -> Self {
        Self {
            reconnect: ReconnectState::Stable,
            handles: HandleSet::new(),
            attributes: None,
            pending_size: None,
            delete_on_close: false,
            silly_names: None,
            session: 0,
        }
    }
}

/// One remote file or directory known to the client.
#[derive(Debug)]
pub struct FileNode {
    id: NodeId,
    kind: NodeKind,
    /// Stable server file ID, when the server exposes one.
    file_id: Option<u64>,
    path: RwLock<RemotePath>,
    state: Mutex<NodeState>,
    /// Signalled whenever the node leaves [`ReconnectState::Reopening`].
    repaired: Condvar,
    /// Reconnect counter, shared with the registry that owns the node.
    generation: Arc<AtomicU64>,
    /// Set when a lookup replaced the node under its path.
    superseded: AtomicBool,
}

impl FileNode {
    pub(crate) fn new(id: NodeId, path: RemotePath, kind: NodeKind, file_id: Option<u64>) -> Self {
        Self {
            id,
            kind,
            file_id,
            path: RwLock::new(path),
            state: Mutex::new(NodeState::new()),
            repaired: Condvar::new(),
            generation: Arc::new(AtomicU64::new(0)),
            superseded: AtomicBool::new(false),
        }
    }

    /// Ties the node to a registry's reconnect counter.
    fn attach(mut self, generation: &Arc<AtomicU64>) -> Self {
        self.state.get_mut().session = generation.load(Ordering::Acquire);
        self.generation = Arc::clone(generation);
        self
    }

    /// Node ID within the volume.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// File or directory.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Returns true for directory nodes.
    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Stable server file ID, if known.
    pub fn file_id(&self) -> Option<u64> {
        self.file_id
    }

    /// Current remote path. Changes when the node is renamed.
    pub fn path(&self) -> RemotePath {
        self.path.read().clone()
    }

    pub(crate) fn set_path(&self, path: RemotePath) {
        *self.path.write() = path;
    }

    /// Current reconnect state.
    pub fn reconnect_state(&self) -> ReconnectState {
        self.lock_state().reconnect
    }

    /// Returns true once the node has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.lock_state().reconnect.is_revoked()
    }

    /// Number of distinct server handles held for the node.
    pub fn open_handle_count(&self) -> usize {
        self.lock_state().handles.len()
    }

    /// Sum of reference counts over all held handles.
    pub fn handle_refs(&self) -> u32 {
        self.lock_state().handles.total_refs()
    }

    /// Last cached attribute snapshot.
    pub fn attributes(&self) -> Option<FileAttributes> {
        self.lock_state().attributes
    }

    pub(crate) fn set_attributes(&self, attributes: FileAttributes) {
        self.lock_state().attributes = Some(attributes);
    }

    /// Returns true if the file will be deleted locally on its final close.
    pub fn delete_on_close_pending(&self) -> bool {
        self.lock_state().delete_on_close
    }

    /// Records that the transport reconnected and returns the new state.
    ///
    /// A stable node must reopen its handles before next use. A node that is
    /// being repaired right now remembers the reconnect, so the repair ends in
    /// [`ReconnectState::NeedsReopen`]. Revoked nodes stay revoked.
    pub fn mark_needs_reopen(&self) -> ReconnectState {
        let mut state = self.lock_state();
        state.reconnect = state.reconnect.after_reconnect();
        trace!(node = self.id, state = ?state.reconnect, "reconnect noted");
        state.reconnect
    }

    /// Locks the node state, applying any reconnect it has not seen yet.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        let mut state = self.state.lock();
        self.catch_up(&mut state);
        state
    }

    /// Applies reconnects reported since `state` was last checked.
    ///
    /// Idle nodes only record the new generation. Nodes holding handles, or
    /// in the middle of a repair, take the reconnect transition.
    pub(crate) fn catch_up(&self, state: &mut NodeState) {
        let current = self.generation.load(Ordering::Acquire);
        if state.session == current {
            return;
        }
        state.session = current;
        if !state.handles.is_empty() || state.reconnect.is_reopening() {
            state.reconnect = state.reconnect.after_reconnect();
            trace!(node = self.id, state = ?state.reconnect, "reconnect noted");
        }
    }

    /// Returns true if the transport reconnected since `state` was checked.
    pub(crate) fn reconnected_since(&self, state: &NodeState) -> bool {
        self.generation.load(Ordering::Acquire) != state.session
    }

    pub(crate) fn wait_for_repair(&self, guard: &mut MutexGuard<'_, NodeState>) {
        self.repaired.wait(guard);
        self.catch_up(guard);
    }

    pub(crate) fn mark_superseded(&self) {
        self.superseded.store(true, Ordering::Release);
    }

    /// Returns true once a lookup registered a newer node at this path.
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }

    pub(crate) fn notify_repaired(&self) {
        self.repaired.notify_all();
    }

    /// Fails fast with [`Error::Revoked`] for revoked nodes.
    pub(crate) fn check_not_revoked(&self) -> Result<()> {
        if self.is_revoked() {
            return Err(Error::Revoked(self.path()));
        }
        Ok(())
    }
}

/// Thread-safe bidirectional mapping between remote paths and nodes.
///
/// - `path_to_id`: RemotePath → NodeId
/// - `nodes`: NodeId → node
///
/// The root node is registered at construction and can never be removed.
#[derive(Debug)]
pub struct NodeRegistry {
    path_to_id: DashMap<RemotePath, NodeId>,
    nodes: DashMap<NodeId, Arc<FileNode>>,
    next_id: AtomicU64,
    /// Bumped on every transport reconnect.
    generation: Arc<AtomicU64>,
    root: Arc<FileNode>,
}

impl NodeRegistry {
    /// Creates a registry holding only the root directory.
    pub fn with_root() -> Self {
        let generation = Arc::new(AtomicU64::new(0));
        let root = Arc::new(
            FileNode::new(ROOT_NODE_ID, RemotePath::root(), NodeKind::Directory, None)
                .attach(&generation),
        );
        let registry = Self {
            path_to_id: DashMap::new(),
            nodes: DashMap::new(),
            next_id: AtomicU64::new(ROOT_NODE_ID + 1),
            generation,
            root: Arc::clone(&root),
        };
        registry.path_to_id.insert(RemotePath::root(), ROOT_NODE_ID);
        registry.nodes.insert(ROOT_NODE_ID, root);
        registry
    }

    #[inline]
    fn allocate_id(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the node registered at `path`, creating it with `make` if absent.
    pub fn get_or_insert_with<F>(&self, path: &RemotePath, make: F) -> Arc<FileNode>
    where
        F: Fn(NodeId) -> FileNode,
    {
        loop {
            let mut created = None;
            let id = *self.path_to_id.entry(path.clone()).or_insert_with(|| {
                let id = self.allocate_id();
                let node = Arc::new(make(id).attach(&self.generation));
                self.nodes.insert(id, Arc::clone(&node));
                created = Some(node);
                id
            });
            if let Some(node) = created {
                debug!(node = id, path = %path, "registered node");
                return node;
            }
            if let Some(node) = self.get(id) {
                return node;
            }
            // Raced with a removal; drop the dangling mapping and retry.
            self.path_to_id.remove_if(path, |_, mapped| *mapped == id);
        }
    }

    /// Looks up a node by ID.
    pub fn get(&self, id: NodeId) -> Option<Arc<FileNode>> {
        self.nodes.get(&id).map(|node| Arc::clone(node.value()))
    }

    /// Looks up a node by path.
    pub fn get_by_path(&self, path: &RemotePath) -> Option<Arc<FileNode>> {
        let id = self.path_to_id.get(path).map(|id| *id)?;
        self.get(id)
    }

    /// The share root node.
    pub fn root(&self) -> Arc<FileNode> {
        Arc::clone(&self.root)
    }

    /// Moves `node` to `new_path`, along with every registered node beneath it.
    pub fn update_path(&self, node: &FileNode, new_path: RemotePath) {
        let old_path = node.path();
        let moved: Vec<(RemotePath, NodeId)> = self
            .path_to_id
            .iter()
            .filter(|e| e.key().starts_with(&old_path))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        for (path, id) in moved {
            self.path_to_id.remove_if(&path, |_, mapped| *mapped == id);
            let suffix = &path.as_str()[old_path.as_str().len()..];
            let rebased = RemotePath::new(format!("{}{suffix}", new_path.as_str()));
            if let Some(moved_node) = self.get(id) {
                moved_node.set_path(rebased.clone());
            }
            self.path_to_id.insert(rebased, id);
        }
        if node.path() != new_path {
            node.set_path(new_path.clone());
            self.path_to_id.insert(new_path, node.id());
        }
    }

    /// Drops the path mapping if it still points at `id`.
    ///
    /// The node itself stays alive until it is removed; callers may still
    /// hold handles on it.
    pub fn invalidate_path(&self, path: &RemotePath, id: NodeId) {
        self.path_to_id.remove_if(path, |_, mapped| *mapped == id);
    }

    /// Removes a node. The root is never removed.
    pub fn remove(&self, id: NodeId) -> Option<Arc<FileNode>> {
        if id == ROOT_NODE_ID {
            return None;
        }
        let (_, node) = self.nodes.remove(&id)?;
        self.invalidate_path(&node.path(), id);
        Some(node)
    }

    /// Snapshot of every registered node.
    pub fn nodes(&self) -> Vec<Arc<FileNode>> {
        self.nodes.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Records a transport reconnect and returns the new generation.
    ///
    /// Every node holding handles needs a reopen from now on. No node lock is
    /// taken; each node applies the reconnect when its state is next locked.
    pub fn note_reconnect(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of reconnects recorded so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of registered nodes, including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if only the root is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AccessMode, ServerHandle};
    use std::thread;

    fn file(registry: &NodeRegistry, path: &str) -> Arc<FileNode> {
        let path = RemotePath::new(path);
        let p = path.clone();
        registry.get_or_insert_with(&path, move |id| {
            FileNode::new(id, p.clone(), NodeKind::File, None)
        })
    }

    #[test]
    fn test_remote_path_normalisation() {
        assert_eq!(RemotePath::new("/a//b/").as_str(), "a/b");
        assert_eq!(RemotePath::new("\\a\\b"), RemotePath::new("a/b"));
        assert!(RemotePath::new("/").is_root());
        assert_eq!(RemotePath::root().to_string(), "/");
        assert_eq!(RemotePath::new("a/b").to_string(), "/a/b");
    }

    #[test]
    fn test_remote_path_components() {
        let path = RemotePath::new("docs/report.txt");
        assert_eq!(path.file_name(), Some("report.txt"));
        assert_eq!(path.parent(), Some(RemotePath::new("docs")));
        assert_eq!(RemotePath::new("top").parent(), Some(RemotePath::root()));
        assert_eq!(RemotePath::root().parent(), None);
        assert_eq!(RemotePath::root().join("x"), RemotePath::new("x"));
        assert_eq!(RemotePath::new("a").join("b"), RemotePath::new("a/b"));
    }

    #[test]
    fn test_remote_path_starts_with() {
        let dir = RemotePath::new("a/b");
        assert!(RemotePath::new("a/b/c").starts_with(&dir));
        assert!(RemotePath::new("a/b").starts_with(&dir));
        assert!(!RemotePath::new("a/bc").starts_with(&dir));
        assert!(RemotePath::new("anything").starts_with(&RemotePath::root()));
    }

    #[test]
    fn test_root_registered() {
        let registry = NodeRegistry::with_root();
        let root = registry.root();
        assert_eq!(root.id(), ROOT_NODE_ID);
        assert!(root.is_directory());
        assert!(registry.is_empty());
        assert!(registry.remove(ROOT_NODE_ID).is_none());
    }

    #[test]
    fn test_get_or_insert_returns_same_node() {
        let registry = NodeRegistry::with_root();
        let a = file(&registry, "a.txt");
        let b = file(&registry, "a.txt");
        assert_eq!(a.id(), b.id());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_update_path_moves_children() {
        let registry = NodeRegistry::with_root();
        let dir_path = RemotePath::new("old");
        let p = dir_path.clone();
        let dir = registry.get_or_insert_with(&dir_path, move |id| {
            FileNode::new(id, p.clone(), NodeKind::Directory, None)
        });
        let child = file(&registry, "old/inner.txt");

        registry.update_path(&dir, RemotePath::new("new"));

        assert_eq!(dir.path(), RemotePath::new("new"));
        assert_eq!(child.path(), RemotePath::new("new/inner.txt"));
        assert!(registry.get_by_path(&RemotePath::new("old")).is_none());
        assert_eq!(
            registry
                .get_by_path(&RemotePath::new("new/inner.txt"))
                .map(|n| n.id()),
            Some(child.id())
        );
    }

    #[test]
    fn test_invalidate_path_keeps_node() {
        let registry = NodeRegistry::with_root();
        let node = file(&registry, "gone.txt");
        registry.invalidate_path(&node.path(), node.id());
        assert!(registry.get_by_path(&node.path()).is_none());
        assert!(registry.get(node.id()).is_some());
    }

    #[test]
    fn test_remove_node() {
        let registry = NodeRegistry::with_root();
        let node = file(&registry, "x");
        assert!(registry.remove(node.id()).is_some());
        assert!(registry.get(node.id()).is_none());
        assert!(registry.get_by_path(&RemotePath::new("x")).is_none());
    }

    #[test]
    fn test_mark_needs_reopen_states() {
        let node = FileNode::new(2, RemotePath::new("f"), NodeKind::File, None);
        assert_eq!(node.mark_needs_reopen(), ReconnectState::NeedsReopen);
        assert_eq!(node.mark_needs_reopen(), ReconnectState::NeedsReopen);
    }

    #[test]
    fn test_reconnect_marks_only_open_nodes() {
        let registry = NodeRegistry::with_root();
        let idle = file(&registry, "idle");
        let busy = file(&registry, "busy");
        busy.lock_state()
            .handles
            .insert(ServerHandle(9), AccessMode::READ, true);

        assert_eq!(registry.note_reconnect(), 1);
        assert_eq!(idle.reconnect_state(), ReconnectState::Stable);
        assert_eq!(busy.reconnect_state(), ReconnectState::NeedsReopen);
    }

    #[test]
    fn test_reconnect_noted_while_state_locked() {
        let registry = NodeRegistry::with_root();
        let busy = file(&registry, "busy");
        let mut state = busy.lock_state();
        state.handles.insert(ServerHandle(3), AccessMode::READ, true);

        registry.note_reconnect();
        assert!(busy.reconnected_since(&state));
        busy.catch_up(&mut state);
        assert!(!busy.reconnected_since(&state));
        assert_eq!(state.reconnect, ReconnectState::NeedsReopen);
    }

    #[test]
    fn test_new_nodes_start_at_current_generation() {
        let registry = NodeRegistry::with_root();
        registry.note_reconnect();
        let late = file(&registry, "late");
        assert!(!late.reconnected_since(&late.lock_state()));
    }

    #[test]
    fn test_target_paths() {
        let dir = FileNode::new(5, RemotePath::new("d"), NodeKind::Directory, None);
        assert_eq!(Target::SelfNode(&dir).path(), RemotePath::new("d"));
        assert_eq!(Target::ChildOf(&dir, "x").path(), RemotePath::new("d/x"));
        assert_eq!(Target::ChildOf(&dir, "x").node().id(), 5);
    }

    #[test]
    fn test_concurrent_get_or_insert() {
        let registry = Arc::new(NodeRegistry::with_root());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || file(&registry, "shared").id())
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.len(), 2);
    }
}
