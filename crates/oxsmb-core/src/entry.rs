//! Directory entries and the per-level decoder seam.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Information level a search page is encoded in.
///
/// Each level is a different entry layout. The engine never looks inside the
/// bytes; it only tells the [`EntryDecoder`] which layout to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoLevel {
    /// Oldest level, understood by every server. Carries no file IDs.
    Standard,
    /// Names plus full attributes.
    #[default]
    BothDirectory,
    /// Like [`InfoLevel::BothDirectory`] with the server's stable file ID.
    IdBothDirectory,
}

impl InfoLevel {
    /// Whether entries at this level carry a stable file ID.
    pub fn has_file_ids(self) -> bool {
        matches!(self, InfoLevel::IdBothDirectory)
    }
}

/// Cached attribute snapshot for a remote file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileAttributes {
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, seconds since the Unix epoch.
    pub modified: u64,
    /// The entry is a directory.
    pub is_directory: bool,
    /// The entry carries the hidden attribute.
    pub hidden: bool,
}

/// One decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name, without any directory component.
    pub name: String,
    /// Position marker the server accepts to resume after this entry.
    pub resume_key: Option<u32>,
    /// Server file ID, when the information level provides one.
    pub file_id: Option<u64>,
    /// Attributes reported with the entry.
    pub attributes: FileAttributes,
}

impl DirEntry {
    /// Returns true for the synthetic `.` and `..` entries.
    pub fn is_dot_entry(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Decoder for one information level's entry layout.
///
/// `page` starts at the entry to decode and runs to the end of the page. The
/// decoder returns the entry and the number of bytes it consumed, which must
/// be non-zero and no larger than `page.len()`.
pub trait EntryDecoder: Send + Sync {
    /// Decodes the entry at the start of `page`.
    fn decode_entry(&self, page: &[u8], level: InfoLevel) -> Result<(DirEntry, usize)>;
}
