//! In-memory server implementing [`Transport`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::codec::encode_entry;
use crate::entry::{DirEntry, FileAttributes, InfoLevel};
use crate::node::RemotePath;
use crate::transport::{
    AccessMode, ReconnectCallback, Reply, Request, RequestKind, STATUS_INVALID_HANDLE,
    SearchFlags, SearchHandle, SearchPage, ServerHandle, Transport, WireError, WireStatus,
};

/// Status for deleting a directory that still has children.
pub const STATUS_DIRECTORY_NOT_EMPTY: u32 = 0xC000_0101;
/// Status for opening a file as a directory.
pub const STATUS_NOT_A_DIRECTORY: u32 = 0xC000_0103;
/// Status for a resume name that does not match the resume key.
pub const STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;

/// Called with every request before the server processes it.
pub type RequestHook = Arc<dyn Fn(&Request) + Send + Sync>;

#[derive(Debug, Clone)]
struct MockFile {
    file_id: u64,
    attributes: FileAttributes,
    delete_pending: bool,
}

#[derive(Debug, Clone)]
struct OpenFile {
    path: RemotePath,
    access: AccessMode,
}

#[derive(Debug)]
struct MockSearch {
    dir: RemotePath,
    names: Vec<String>,
    position: usize,
}

#[derive(Debug, Clone)]
struct Fault {
    kind: RequestKind,
    status: WireStatus,
    /// Execute the request before failing it.
    apply: bool,
    retransmitted: bool,
}

#[derive(Debug, Default)]
struct ServerState {
    files: BTreeMap<RemotePath, MockFile>,
    handles: HashMap<ServerHandle, OpenFile>,
    searches: HashMap<SearchHandle, MockSearch>,
    next_handle: u64,
    next_search: u16,
    next_file_id: u64,
    log: Vec<Request>,
    faults: VecDeque<Fault>,
    denied: HashSet<RemotePath>,
    rejected_levels: HashSet<InfoLevel>,
    dot_entries: bool,
}

/// An in-memory share.
///
/// Files and directories live in a sorted map; listings return children in
/// name order with resume keys `1..`. Every request is logged. Failures can
/// be queued per request kind, and a hook can run arbitrary code (such as a
/// reconnect) just before a request is processed.
pub struct MockServer {
    state: Mutex<ServerState>,
    callbacks: Mutex<Vec<ReconnectCallback>>,
    hook: Mutex<Option<RequestHook>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    /// Creates a server with an empty root directory.
    pub fn new() -> Self {
        let mut state = ServerState {
            next_handle: 0x100,
            next_search: 1,
            next_file_id: 1,
            ..ServerState::default()
        };
        state.insert(RemotePath::root(), true, 0);
        Self {
            state: Mutex::new(state),
            callbacks: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        }
    }

    /// Adds a file of `size` bytes, creating missing parent directories.
    /// Returns its file ID.
    pub fn add_file(&self, path: &str, size: u64) -> u64 {
        self.state.lock().insert(RemotePath::new(path), false, size)
    }

    /// Adds a directory, creating missing parents. Returns its file ID.
    pub fn add_dir(&self, path: &str) -> u64 {
        self.state.lock().insert(RemotePath::new(path), true, 0)
    }

    /// Whether `path` exists.
    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().files.contains_key(&RemotePath::new(path))
    }

    /// Current attributes of `path`.
    pub fn attributes(&self, path: &str) -> Option<FileAttributes> {
        self.state
            .lock()
            .files
            .get(&RemotePath::new(path))
            .map(|f| f.attributes)
    }

    /// File ID of `path`.
    pub fn file_id(&self, path: &str) -> Option<u64> {
        self.state
            .lock()
            .files
            .get(&RemotePath::new(path))
            .map(|f| f.file_id)
    }

    /// Whether `path` will be deleted when its last handle closes.
    pub fn delete_pending(&self, path: &str) -> bool {
        self.state
            .lock()
            .files
            .get(&RemotePath::new(path))
            .is_some_and(|f| f.delete_pending)
    }

    /// Names directly inside `dir`, in order.
    pub fn children(&self, dir: &str) -> Vec<String> {
        self.state.lock().children(&RemotePath::new(dir))
    }

    /// Include `.` and `..` in wildcard listings.
    pub fn set_dot_entries(&self, enabled: bool) {
        self.state.lock().dot_entries = enabled;
    }

    /// Refuse every open of `path` with `AccessDenied`.
    pub fn deny_access(&self, path: &str) {
        self.state.lock().denied.insert(RemotePath::new(path));
    }

    /// Lift a [`MockServer::deny_access`].
    pub fn allow_access(&self, path: &str) {
        self.state.lock().denied.remove(&RemotePath::new(path));
    }

    /// Answer searches at `level` with `NotSupported`.
    pub fn reject_info_level(&self, level: InfoLevel) {
        self.state.lock().rejected_levels.insert(level);
    }

    /// Fail the next request of `kind` with `status`, without executing it.
    pub fn fail_next(&self, kind: RequestKind, status: WireStatus) {
        self.push_fault(kind, status, false, false);
    }

    /// Like [`MockServer::fail_next`], flagging the error as retransmitted.
    pub fn fail_next_retransmitted(&self, kind: RequestKind, status: WireStatus) {
        self.push_fault(kind, status, false, true);
    }

    /// Execute the next request of `kind`, then report `status` as if the
    /// reply was lost and the re-sent request failed.
    pub fn lose_next_reply(&self, kind: RequestKind, status: WireStatus) {
        self.push_fault(kind, status, true, true);
    }

    fn push_fault(&self, kind: RequestKind, status: WireStatus, apply: bool, retransmitted: bool) {
        self.state.lock().faults.push_back(Fault {
            kind,
            status,
            apply,
            retransmitted,
        });
    }

    /// Runs `hook` before every request. The server lock is not held.
    pub fn set_hook(&self, hook: RequestHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Removes the request hook.
    pub fn clear_hook(&self) {
        *self.hook.lock() = None;
    }

    /// Simulates a dropped and re-established connection.
    ///
    /// Every open handle and search is forgotten, and files marked
    /// delete-on-close are removed as their handles go. Then the registered
    /// reconnect callbacks run.
    pub fn reconnect(&self) {
        {
            let mut state = self.state.lock();
            state.handles.clear();
            state.searches.clear();
            state.files.retain(|_, file| !file.delete_pending);
        }
        trace!("mock server reconnected");
        for callback in self.callbacks.lock().iter() {
            callback();
        }
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().log.clone()
    }

    /// Number of requests of `kind` received so far.
    pub fn count(&self, kind: RequestKind) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.kind() == kind)
            .count()
    }

    /// Forgets the request log.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Number of open server handles.
    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Number of searches the server still holds open.
    pub fn open_searches(&self) -> usize {
        self.state.lock().searches.len()
    }

    /// Whether `handle` is open, and with what access.
    pub fn handle_access(&self, handle: ServerHandle) -> Option<AccessMode> {
        self.state.lock().handles.get(&handle).map(|h| h.access)
    }
}

impl Transport for MockServer {
    fn send_request(&self, request: &Request) -> Result<Reply, WireError> {
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(request);
        }

        let mut state = self.state.lock();
        state.log.push(request.clone());
        if let Some(fault) = state.take_fault(request.kind()) {
            if fault.apply {
                let _ = state.apply(request);
            }
            return Err(WireError {
                status: fault.status,
                retransmitted: fault.retransmitted,
            });
        }
        state.apply(request)
    }

    fn on_reconnect(&self, callback: ReconnectCallback) {
        self.callbacks.lock().push(callback);
    }
}

fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    match (pattern.split_first(), name.split_first()) {
        (None, None) => true,
        (Some((b'*', rest)), _) => {
            glob_match(rest, name) || (!name.is_empty() && glob_match(pattern, &name[1..]))
        }
        (Some((b'?', rest)), Some((_, name_rest))) => glob_match(rest, name_rest),
        (Some((p, rest)), Some((n, name_rest))) => p == n && glob_match(rest, name_rest),
        _ => false,
    }
}

impl ServerState {
    fn insert(&mut self, path: RemotePath, directory: bool, size: u64) -> u64 {
        if let Some(parent) = path.parent()
            && !self.files.contains_key(&parent)
        {
            self.insert(parent, true, 0);
        }
        let file_id = self.next_file_id;
        self.next_file_id += 1;
        self.files.insert(
            path,
            MockFile {
                file_id,
                attributes: FileAttributes {
                    size,
                    modified: 1_700_000_000 + file_id,
                    is_directory: directory,
                    hidden: false,
                },
                delete_pending: false,
            },
        );
        file_id
    }

    fn take_fault(&mut self, kind: RequestKind) -> Option<Fault> {
        let idx = self.faults.iter().position(|f| f.kind == kind)?;
        self.faults.remove(idx)
    }

    fn children(&self, dir: &RemotePath) -> Vec<String> {
        self.files
            .keys()
            .filter(|path| path.parent().as_ref() == Some(dir))
            .filter_map(|path| path.file_name().map(str::to_string))
            .collect()
    }

    fn open_file(&self, handle: ServerHandle) -> Result<&OpenFile, WireError> {
        self.handles
            .get(&handle)
            .ok_or(WireError::new(WireStatus::Other(STATUS_INVALID_HANDLE)))
    }

    fn apply(&mut self, request: &Request) -> Result<Reply, WireError> {
        match request {
            Request::Open {
                path,
                access,
                directory,
            } => {
                if self.denied.contains(path) {
                    return Err(WireStatus::AccessDenied.into());
                }
                let file = self.files.get(path).ok_or(WireStatus::NotFound)?;
                if *directory && !file.attributes.is_directory {
                    return Err(WireStatus::Other(STATUS_NOT_A_DIRECTORY).into());
                }
                let handle = ServerHandle(self.next_handle);
                self.next_handle += 1;
                self.handles.insert(
                    handle,
                    OpenFile {
                        path: path.clone(),
                        access: *access,
                    },
                );
                Ok(Reply::Opened(handle))
            }
            Request::Close { handle } => {
                let open = self
                    .handles
                    .remove(handle)
                    .ok_or(WireStatus::Other(STATUS_INVALID_HANDLE))?;
                let still_open = self.handles.values().any(|h| h.path == open.path);
                if !still_open && self.files.get(&open.path).is_some_and(|f| f.delete_pending) {
                    self.files.remove(&open.path);
                }
                Ok(Reply::Done)
            }
            Request::SetEndOfFile { handle, size } => {
                let open = self.open_file(*handle)?.clone();
                if !open.access.contains(AccessMode::WRITE) {
                    return Err(WireStatus::AccessDenied.into());
                }
                let file = self.files.get_mut(&open.path).ok_or(WireStatus::NotFound)?;
                file.attributes.size = *size;
                Ok(Reply::Done)
            }
            Request::SetDeleteOnClose { handle } => {
                let open = self.open_file(*handle)?.clone();
                if !open.access.contains(AccessMode::WRITE) {
                    return Err(WireStatus::AccessDenied.into());
                }
                let file = self.files.get_mut(&open.path).ok_or(WireStatus::NotFound)?;
                file.delete_pending = true;
                Ok(Reply::Done)
            }
            Request::SetHidden { path } => {
                let file = self.files.get_mut(path).ok_or(WireStatus::NotFound)?;
                file.attributes.hidden = true;
                Ok(Reply::Done)
            }
            Request::QueryInfo { path } => self
                .files
                .get(path)
                .map(|f| Reply::Info(f.attributes))
                .ok_or_else(|| WireStatus::NotFound.into()),
            Request::Delete { path } => {
                if path.is_root() || !self.files.contains_key(path) {
                    return Err(WireStatus::NotFound.into());
                }
                if !self.children(path).is_empty() {
                    return Err(WireStatus::Other(STATUS_DIRECTORY_NOT_EMPTY).into());
                }
                self.files.remove(path);
                Ok(Reply::Done)
            }
            Request::Rename { from, to } => self.rename(from, to),
            Request::FindFirst {
                dir,
                pattern,
                page_size,
                level,
                flags,
            } => self.find_first(dir, pattern, *page_size, *level, *flags),
            Request::FindNext {
                search,
                page_size,
                level,
                resume_key,
                resume_name,
                flags,
            } => self.find_next(
                *search,
                *page_size,
                *level,
                *resume_key,
                resume_name.as_deref(),
                *flags,
            ),
            Request::FindClose { search } => {
                self.searches
                    .remove(search)
                    .ok_or(WireStatus::Other(STATUS_INVALID_HANDLE))?;
                Ok(Reply::Done)
            }
        }
    }

    fn rename(&mut self, from: &RemotePath, to: &RemotePath) -> Result<Reply, WireError> {
        if from.is_root() || !self.files.contains_key(from) {
            return Err(WireStatus::NotFound.into());
        }
        if self.files.contains_key(to) {
            return Err(WireStatus::AlreadyExists.into());
        }
        let parent_ok = to
            .parent()
            .and_then(|p| self.files.get(&p))
            .is_some_and(|p| p.attributes.is_directory);
        if !parent_ok {
            return Err(WireStatus::NotFound.into());
        }
        let moved: Vec<RemotePath> = self
            .files
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for old in moved {
            let suffix = &old.as_str()[from.as_str().len()..];
            let new = RemotePath::new(format!("{}{suffix}", to.as_str()));
            if let Some(file) = self.files.remove(&old) {
                self.files.insert(new.clone(), file);
            }
            for open in self.handles.values_mut().filter(|h| h.path == old) {
                open.path = new.clone();
            }
        }
        Ok(Reply::Done)
    }

    fn find_first(
        &mut self,
        dir: &RemotePath,
        pattern: &str,
        page_size: u16,
        level: InfoLevel,
        flags: SearchFlags,
    ) -> Result<Reply, WireError> {
        if self.rejected_levels.contains(&level) {
            return Err(WireStatus::NotSupported.into());
        }
        if !self.files.get(dir).is_some_and(|d| d.attributes.is_directory) {
            return Err(WireStatus::NotFound.into());
        }
        let mut names: Vec<String> = Vec::new();
        if self.dot_entries {
            names.extend([".".to_string(), "..".to_string()]);
        }
        names.extend(self.children(dir));
        names.retain(|n| glob_match(pattern.as_bytes(), n.as_bytes()));
        if names.is_empty() {
            return Err(WireStatus::NotFound.into());
        }

        let handle = SearchHandle(self.next_search);
        self.next_search = self.next_search.checked_add(1).unwrap_or(1);
        let mut search = MockSearch {
            dir: dir.clone(),
            names,
            position: 0,
        };
        let mut page = self.page(&mut search, page_size, level);
        page.search = Some(handle);
        let closed = flags.contains(SearchFlags::CLOSE_AFTER_REQUEST)
            || (page.end_of_search && flags.contains(SearchFlags::CLOSE_AT_END));
        if !closed {
            self.searches.insert(handle, search);
        }
        Ok(Reply::SearchPage(page))
    }

    fn find_next(
        &mut self,
        handle: SearchHandle,
        page_size: u16,
        level: InfoLevel,
        resume_key: Option<u32>,
        resume_name: Option<&[u8]>,
        flags: SearchFlags,
    ) -> Result<Reply, WireError> {
        let mut search = self
            .searches
            .remove(&handle)
            .ok_or(WireStatus::Other(STATUS_INVALID_HANDLE))?;
        let by_name = resume_name.and_then(|name| {
            search
                .names
                .iter()
                .position(|n| n.as_bytes() == name)
                .map(|idx| idx + 1)
        });
        let position = match (resume_key, by_name) {
            (Some(key), Some(pos)) if usize::try_from(key).ok() != Some(pos) => {
                self.searches.insert(handle, search);
                return Err(WireStatus::Other(STATUS_INVALID_PARAMETER).into());
            }
            (Some(key), _) => usize::try_from(key).unwrap_or(usize::MAX),
            (None, Some(pos)) => pos,
            (None, None) => search.position,
        };
        search.position = position.min(search.names.len());
        let page = self.page(&mut search, page_size, level);
        if !(page.end_of_search && flags.contains(SearchFlags::CLOSE_AT_END)) {
            self.searches.insert(handle, search);
        }
        Ok(Reply::SearchPage(page))
    }

    fn page(&self, search: &mut MockSearch, page_size: u16, level: InfoLevel) -> SearchPage {
        let end = (search.position + usize::from(page_size)).min(search.names.len());
        let mut data = Vec::new();
        let mut last_offset = None;
        for idx in search.position..end {
            let name = &search.names[idx];
            let file = self.files.get(&search.dir.join(name));
            let entry = DirEntry {
                name: name.clone(),
                resume_key: u32::try_from(idx + 1).ok(),
                file_id: file
                    .filter(|_| level.has_file_ids())
                    .map(|f| f.file_id),
                attributes: file.map_or(
                    FileAttributes {
                        is_directory: true,
                        ..FileAttributes::default()
                    },
                    |f| f.attributes,
                ),
            };
            last_offset = u32::try_from(encode_entry(&mut data, &entry)).ok();
        }
        let count = end - search.position;
        search.position = end;
        SearchPage {
            search: None,
            entry_count: u16::try_from(count).unwrap_or(u16::MAX),
            end_of_search: end == search.names.len(),
            last_name_offset: last_offset,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"*.txt", b"a.txt"));
        assert!(!glob_match(b"*.txt", b"a.log"));
        assert!(glob_match(b"f?le", b"file"));
        assert!(glob_match(b"exact", b"exact"));
        assert!(!glob_match(b"exact", b"exactly"));
    }

    #[test]
    fn test_add_file_creates_parents() {
        let server = MockServer::new();
        server.add_file("a/b/c.txt", 3);
        assert!(server.exists("a"));
        assert!(server.exists("a/b"));
        assert_eq!(server.children("a/b"), vec!["c.txt".to_string()]);
        assert_eq!(server.attributes("a/b/c.txt").map(|a| a.size), Some(3));
    }

    #[test]
    fn test_delete_on_close_removes_at_last_close() {
        let server = MockServer::new();
        server.add_file("f", 1);
        let open = |access| {
            match server.send_request(&Request::Open {
                path: RemotePath::new("f"),
                access,
                directory: false,
            }) {
                Ok(Reply::Opened(h)) => h,
                other => panic!("open failed: {other:?}"),
            }
        };
        let a = open(AccessMode::WRITE);
        let b = open(AccessMode::READ);
        server
            .send_request(&Request::SetDeleteOnClose { handle: a })
            .unwrap();
        server.send_request(&Request::Close { handle: a }).unwrap();
        assert!(server.exists("f"));
        server.send_request(&Request::Close { handle: b }).unwrap();
        assert!(!server.exists("f"));
    }

    #[test]
    fn test_faults_are_consumed_in_order() {
        let server = MockServer::new();
        server.fail_next(RequestKind::QueryInfo, WireStatus::TimedOut);
        let query = Request::QueryInfo {
            path: RemotePath::root(),
        };
        let err = server.send_request(&query).unwrap_err();
        assert_eq!(err.status, WireStatus::TimedOut);
        assert!(!err.retransmitted);
        assert!(server.send_request(&query).is_ok());
        assert_eq!(server.count(RequestKind::QueryInfo), 2);
    }

    #[test]
    fn test_lost_reply_applies_request() {
        let server = MockServer::new();
        server.add_file("gone", 0);
        server.lose_next_reply(RequestKind::Delete, WireStatus::NotFound);
        let err = server
            .send_request(&Request::Delete {
                path: RemotePath::new("gone"),
            })
            .unwrap_err();
        assert!(err.retransmitted);
        assert!(!server.exists("gone"));
    }
}
