//! Paged directory listings.
//!
//! A listing is a server-side search: the first request opens it and returns
//! the first page, each continuation returns the next page, and the server
//! closes it on its own once it has reported end-of-search. [`DirCursor`]
//! drives that exchange lazily, one page at a time, as the caller pulls
//! entries.
//!
//! Continuations carry the resume key of the last entry decoded and, when
//! the server pointed at an entry in the page, that entry's name.

use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use crate::entry::{DirEntry, EntryDecoder, FileAttributes, InfoLevel};
use crate::error::{Error, Result};
use crate::node::{FileNode, NodeRegistry, RemotePath, Target};
use crate::stats::VolumeStats;
use crate::transport::{Reply, Request, SearchFlags, SearchHandle, SearchPage, Transport, WireStatus};
use crate::volume::{Volume, unexpected_reply};

/// Characters that make a pattern match more than one name.
const WILDCARDS: [char; 5] = ['*', '?', '<', '>', '"'];

/// Returns true if `pattern` can match more than one name.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains(WILDCARDS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchMode {
    /// Wildcard listing, paged until end-of-search.
    Full,
    /// Exact-name lookup: one page of one entry, closed by the server.
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Open,
    Failed,
    Closed,
}

/// Decoding position within the current page.
#[derive(Debug, Default)]
struct PageBuffer {
    data: Vec<u8>,
    offset: usize,
    remaining: u16,
    last_name_offset: Option<u32>,
    name_latched: bool,
}

/// Lazy iterator over one directory listing.
///
/// Obtained from [`Volume::open_dir`]. Entries `.` and `..` are skipped. The
/// cursor cannot be restarted; once it returns `None` or an error it stays
/// finished. Dropping it closes the search if the server has not already.
pub struct DirCursor<T: Transport> {
    transport: Arc<T>,
    decoder: Arc<dyn EntryDecoder>,
    registry: Arc<NodeRegistry>,
    stats: Arc<VolumeStats>,
    dir: RemotePath,
    mode: SearchMode,
    page_size: u16,
    level: InfoLevel,
    search: Option<SearchHandle>,
    end_of_search: bool,
    resume_key: Option<u32>,
    resume_name: Option<Vec<u8>>,
    page: PageBuffer,
    state: CursorState,
}

impl<T: Transport> DirCursor<T> {
    fn start(
        volume: &Volume<T>,
        dir: RemotePath,
        pattern: &str,
        page_size: u16,
    ) -> Result<Self> {
        let mode = if is_wildcard(pattern) {
            SearchMode::Full
        } else {
            SearchMode::Single
        };
        let mut cursor = Self {
            transport: Arc::clone(&volume.transport),
            decoder: Arc::clone(&volume.decoder),
            registry: Arc::clone(&volume.registry),
            stats: Arc::clone(&volume.stats),
            dir,
            mode,
            page_size: match mode {
                SearchMode::Full => page_size,
                SearchMode::Single => 1,
            },
            level: volume.config.info_level,
            search: None,
            end_of_search: false,
            resume_key: None,
            resume_name: None,
            page: PageBuffer::default(),
            state: CursorState::Open,
        };
        match cursor.find_first(pattern)? {
            Some(page) => cursor.install_page(page),
            None => cursor.end_of_search = true,
        }
        Ok(cursor)
    }

    fn first_flags(&self) -> SearchFlags {
        match self.mode {
            SearchMode::Full => SearchFlags::CLOSE_AT_END | SearchFlags::RETURN_RESUME_KEYS,
            SearchMode::Single => {
                SearchFlags::CLOSE_AFTER_REQUEST
                    | SearchFlags::CLOSE_AT_END
                    | SearchFlags::RETURN_RESUME_KEYS
            }
        }
    }

    /// Opens the search. `Ok(None)` means nothing matched.
    fn find_first(&mut self, pattern: &str) -> Result<Option<SearchPage>> {
        loop {
            let request = Request::FindFirst {
                dir: self.dir.clone(),
                pattern: pattern.to_string(),
                page_size: self.page_size,
                level: self.level,
                flags: self.first_flags(),
            };
            match self.transport.send_request(&request) {
                Ok(Reply::SearchPage(page)) => return Ok(Some(page)),
                Ok(reply) => return Err(unexpected_reply(&self.dir, &reply)),
                Err(err) if err.status == WireStatus::NotFound => {
                    debug!(dir = %self.dir, pattern, "no matching entries");
                    return Ok(None);
                }
                Err(err)
                    if err.status == WireStatus::NotSupported
                        && self.level != InfoLevel::Standard =>
                {
                    debug!(level = ?self.level, "info level rejected, falling back to standard");
                    self.level = InfoLevel::Standard;
                }
                Err(err) => return Err(Error::from_wire(err, &self.dir)),
            }
        }
    }

    fn find_next(&mut self) -> Result<()> {
        let search = self.search.ok_or_else(|| {
            Error::Protocol(format!("{}: search reply carried no handle", self.dir))
        })?;
        let request = Request::FindNext {
            search,
            page_size: self.page_size,
            level: self.level,
            resume_key: self.resume_key,
            resume_name: self.resume_name.clone(),
            flags: SearchFlags::CLOSE_AT_END | SearchFlags::RETURN_RESUME_KEYS,
        };
        match self.transport.send_request(&request) {
            Ok(Reply::SearchPage(page)) => {
                self.install_page(page);
                Ok(())
            }
            Ok(reply) => Err(unexpected_reply(&self.dir, &reply)),
            Err(err) if err.status == WireStatus::NotFound => {
                debug!(dir = %self.dir, "continuation found no more entries");
                self.end_of_search = true;
                Ok(())
            }
            Err(err) => Err(Error::from_wire(err, &self.dir)),
        }
    }

    fn install_page(&mut self, page: SearchPage) {
        self.stats.record_page();
        if self.search.is_none() {
            self.search = page.search;
        }
        let empty = page.entry_count == 0;
        if empty && !page.end_of_search {
            debug!(dir = %self.dir, "empty page without end-of-search, treating as end");
        }
        self.end_of_search |= page.end_of_search || empty || self.mode == SearchMode::Single;
        trace!(
            entries = page.entry_count,
            bytes = page.data.len(),
            end_of_search = self.end_of_search,
            "received search page"
        );
        self.page = PageBuffer {
            data: page.data,
            offset: 0,
            remaining: page.entry_count,
            last_name_offset: page.last_name_offset,
            name_latched: false,
        };
    }

    /// Decodes the next raw entry from the page buffer.
    fn decode_next(&mut self) -> Result<DirEntry> {
        let start = self.page.offset;
        let rest = self.page.data.get(start..).unwrap_or_default();
        if rest.is_empty() {
            return Err(Error::Protocol(format!(
                "{}: page ended with {} entries outstanding",
                self.dir, self.page.remaining
            )));
        }
        let available = rest.len();
        let (entry, used) = self.decoder.decode_entry(rest, self.level)?;
        if used == 0 || used > available {
            return Err(Error::Protocol(format!(
                "{}: decoder consumed {used} of {available} bytes",
                self.dir
            )));
        }
        self.page.offset += used;
        self.page.remaining -= 1;

        if let Some(key) = entry.resume_key {
            self.resume_key = Some(key);
        }
        if !self.page.name_latched
            && let Some(target) = self.page.last_name_offset
            && usize::try_from(target).is_ok_and(|t| (start..start + used).contains(&t))
        {
            self.resume_name = Some(entry.name.as_bytes().to_vec());
            self.page.name_latched = true;
        }
        Ok(entry)
    }

    fn advance(&mut self) -> Result<Option<DirEntry>> {
        loop {
            if self.page.remaining == 0 {
                if self.end_of_search {
                    return Ok(None);
                }
                self.find_next()?;
                continue;
            }
            let entry = self.decode_next()?;
            if entry.is_dot_entry() {
                continue;
            }
            self.refresh_registered(&entry);
            return Ok(Some(entry));
        }
    }

    fn refresh_registered(&self, entry: &DirEntry) {
        if let Some(node) = self.registry.get_by_path(&self.dir.join(&entry.name)) {
            let same_file = match (node.file_id(), entry.file_id) {
                (Some(known), Some(listed)) => known == listed,
                _ => true,
            };
            if same_file {
                node.set_attributes(entry.attributes);
            }
        }
    }

    /// Returns the next entry, or `None` at the end of the listing.
    pub fn next_entry(&mut self) -> Result<Option<DirEntry>> {
        if self.state != CursorState::Open {
            return Ok(None);
        }
        self.advance().inspect_err(|_| self.state = CursorState::Failed)
    }

    /// Information level entries are being decoded at.
    pub fn info_level(&self) -> InfoLevel {
        self.level
    }

    /// Whether the server has reported the end of the search.
    pub fn is_end_of_search(&self) -> bool {
        self.end_of_search
    }

    /// Resume key that the next continuation would send.
    pub fn resume_key(&self) -> Option<u32> {
        self.resume_key
    }

    /// Resume name that the next continuation would send.
    pub fn resume_name(&self) -> Option<&[u8]> {
        self.resume_name.as_deref()
    }

    /// Ends the listing, closing the search on the server if still open.
    ///
    /// Never fails; a close error is only logged.
    pub fn close(mut self) {
        self.close_search();
    }

    fn close_search(&mut self) {
        if self.state == CursorState::Closed {
            return;
        }
        self.state = CursorState::Closed;
        let Some(search) = self.search.take() else {
            return;
        };
        if self.end_of_search {
            trace!(dir = %self.dir, "search already closed by server");
            return;
        }
        match self.transport.send_request(&Request::FindClose { search }) {
            Ok(_) => debug!(dir = %self.dir, ?search, "closed search"),
            Err(err) => warn!(dir = %self.dir, ?search, error = %err, "failed to close search"),
        }
    }
}

impl<T: Transport> Iterator for DirCursor<T> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl<T: Transport> Drop for DirCursor<T> {
    fn drop(&mut self) {
        self.close_search();
    }
}

impl<T: Transport> Volume<T> {
    /// Starts listing entries of `dir` matching `pattern`.
    ///
    /// A pattern without wildcards is treated as an exact-name lookup: one
    /// entry is requested and no continuation is ever sent. Nothing matching
    /// yields an empty cursor rather than an error.
    #[instrument(level = "debug", skip(self, dir), fields(dir = %dir.path()))]
    pub fn open_dir(&self, dir: &FileNode, pattern: &str, page_size: u16) -> Result<DirCursor<T>> {
        if !dir.is_directory() {
            return Err(Error::NotADirectory(dir.path()));
        }
        if page_size == 0 {
            return Err(Error::InvalidArgument("page size must be at least 1".into()));
        }
        self.ensure_usable(dir)?;
        DirCursor::start(self, dir.path(), pattern, page_size)
    }

    /// Lists every entry of `dir` with the configured page size.
    pub fn list_dir(&self, dir: &FileNode) -> Result<DirCursor<T>> {
        self.open_dir(dir, "*", self.config.page_size)
    }

    /// Fetches the directory entry for `name` inside `dir`.
    pub fn lookup_child(&self, dir: &FileNode, name: &str) -> Result<Option<DirEntry>> {
        if name.is_empty() || is_wildcard(name) || name.contains(['/', '\\']) {
            return Err(Error::InvalidArgument(format!("bad file name {name:?}")));
        }
        let mut cursor = self.open_dir(dir, name, 1)?;
        let entry = cursor.next_entry()?;
        cursor.close();
        Ok(entry)
    }

    /// Fetches current attributes for a node or a named child of a directory.
    ///
    /// Returns `None` if the target does not exist. Querying a node itself
    /// also refreshes its cached attributes.
    pub fn query(&self, target: Target<'_>) -> Result<Option<FileAttributes>> {
        target.node().check_not_revoked()?;
        match target {
            Target::SelfNode(node) => {
                let path = node.path();
                match self.send(&Request::QueryInfo { path: path.clone() }) {
                    Ok(Reply::Info(attributes)) => {
                        node.set_attributes(attributes);
                        Ok(Some(attributes))
                    }
                    Ok(reply) => Err(unexpected_reply(&path, &reply)),
                    Err(err) if err.status == WireStatus::NotFound => Ok(None),
                    Err(err) => Err(Error::from_wire(err, &path)),
                }
            }
            Target::ChildOf(dir, name) => Ok(self.lookup_child(dir, name)?.map(|e| e.attributes)),
        }
    }
}
