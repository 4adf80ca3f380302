//! A length-prefixed entry layout for tests.
//!
//! ```text
//! offset  size  field
//!      0     2  entry length, including this header (little endian)
//!      2     4  resume key (0 = none)
//!      6     8  file ID (0 = none)
//!     14     8  size
//!     22     8  modified
//!     30     1  flags: bit 0 directory, bit 1 hidden
//!     31     2  name length
//!     33     n  UTF-8 name
//! ```
//!
//! File IDs are only reported at [`InfoLevel::IdBothDirectory`].

use crate::entry::{DirEntry, EntryDecoder, FileAttributes, InfoLevel};
use crate::error::{Error, Result};

/// Size of the fixed part of an encoded entry.
pub const ENTRY_HEADER_LEN: usize = 33;

const FLAG_DIRECTORY: u8 = 0x01;
const FLAG_HIDDEN: u8 = 0x02;

/// Appends `entry` to `page`. Returns the offset it was written at.
///
/// # Panics
///
/// Panics if the name is too long for the length fields.
pub fn encode_entry(page: &mut Vec<u8>, entry: &DirEntry) -> usize {
    let offset = page.len();
    let name = entry.name.as_bytes();
    let total = u16::try_from(ENTRY_HEADER_LEN + name.len()).expect("entry too long");
    let name_len = u16::try_from(name.len()).expect("name too long");

    let mut flags = 0;
    if entry.attributes.is_directory {
        flags |= FLAG_DIRECTORY;
    }
    if entry.attributes.hidden {
        flags |= FLAG_HIDDEN;
    }

    page.extend_from_slice(&total.to_le_bytes());
    page.extend_from_slice(&entry.resume_key.unwrap_or(0).to_le_bytes());
    page.extend_from_slice(&entry.file_id.unwrap_or(0).to_le_bytes());
    page.extend_from_slice(&entry.attributes.size.to_le_bytes());
    page.extend_from_slice(&entry.attributes.modified.to_le_bytes());
    page.push(flags);
    page.extend_from_slice(&name_len.to_le_bytes());
    page.extend_from_slice(name);
    offset
}

/// [`EntryDecoder`] for the layout written by [`encode_entry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleDecoder;

fn field<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut raw = [0u8; N];
    raw.copy_from_slice(&bytes[at..at + N]);
    raw
}

impl EntryDecoder for SimpleDecoder {
    fn decode_entry(&self, page: &[u8], level: InfoLevel) -> Result<(DirEntry, usize)> {
        if page.len() < ENTRY_HEADER_LEN {
            return Err(Error::Protocol(format!(
                "truncated entry header: {} bytes",
                page.len()
            )));
        }
        let total = usize::from(u16::from_le_bytes(field(page, 0)));
        if total < ENTRY_HEADER_LEN || total > page.len() {
            return Err(Error::Protocol(format!(
                "entry length {total} outside page of {} bytes",
                page.len()
            )));
        }
        let name_len = usize::from(u16::from_le_bytes(field(page, 31)));
        if ENTRY_HEADER_LEN + name_len > total {
            return Err(Error::Protocol(format!(
                "name length {name_len} overruns entry of {total} bytes"
            )));
        }
        let name = std::str::from_utf8(&page[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + name_len])
            .map_err(|e| Error::Protocol(format!("entry name is not UTF-8: {e}")))?;

        let resume_key = u32::from_le_bytes(field(page, 2));
        let file_id = u64::from_le_bytes(field(page, 6));
        let flags = page[30];
        let entry = DirEntry {
            name: name.to_string(),
            resume_key: (resume_key != 0).then_some(resume_key),
            file_id: (level.has_file_ids() && file_id != 0).then_some(file_id),
            attributes: FileAttributes {
                size: u64::from_le_bytes(field(page, 14)),
                modified: u64::from_le_bytes(field(page, 22)),
                is_directory: flags & FLAG_DIRECTORY != 0,
                hidden: flags & FLAG_HIDDEN != 0,
            },
        };
        Ok((entry, total))
    }
}
