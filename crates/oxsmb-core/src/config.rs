//! Per-volume configuration.
//!
//! Loading configuration from disk or the command line belongs to the mount
//! layer. This module only defines the knobs the engine reads and their
//! defaults, and lets the mount layer deserialize them with serde.

use serde::{Deserialize, Serialize};

use crate::entry::InfoLevel;
use crate::error::{Error, Result};

/// Default number of entries requested per search page.
pub const DEFAULT_PAGE_SIZE: u16 = 128;

/// Default prefix for silly-rename temporary names.
pub const DEFAULT_SILLY_PREFIX: &str = ".smbdelete";

/// Configuration for one mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Entries requested per search page for full listings.
    ///
    /// Default: 128.
    pub page_size: u16,

    /// Information level requested for directory listings.
    ///
    /// Falls back to [`InfoLevel::Standard`] if the server rejects it.
    pub info_level: InfoLevel,

    /// Prefix of temporary names used when unlinking open files.
    pub silly_prefix: String,

    /// Set the hidden attribute on silly-renamed files.
    pub hide_silly_renamed: bool,

    /// Look up each silly-rename candidate before renaming onto it, instead
    /// of relying on the rename to report a collision.
    pub probe_silly_names: bool,

    /// Process ID mixed into counter-based temporary names.
    pub process_id: u32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            info_level: InfoLevel::default(),
            silly_prefix: DEFAULT_SILLY_PREFIX.to_string(),
            hide_silly_renamed: true,
            probe_silly_names: false,
            process_id: std::process::id(),
        }
    }
}

impl VolumeConfig {
    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::InvalidArgument("page_size must be at least 1".into()));
        }
        if self.silly_prefix.is_empty() {
            return Err(Error::InvalidArgument(
                "silly_prefix must not be empty".into(),
            ));
        }
        if self.silly_prefix.contains(['/', '\\']) {
            return Err(Error::InvalidArgument(
                "silly_prefix must not contain path separators".into(),
            ));
        }
        Ok(())
    }

    /// Sets the search page size.
    #[must_use]
    pub fn page_size(mut self, page_size: u16) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the listing information level.
    #[must_use]
    pub fn info_level(mut self, level: InfoLevel) -> Self {
        self.info_level = level;
        self
    }

    /// Sets the silly-rename prefix.
    #[must_use]
    pub fn silly_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.silly_prefix = prefix.into();
        self
    }

    /// Sets whether silly-renamed files are hidden.
    #[must_use]
    pub fn hide_silly_renamed(mut self, hide: bool) -> Self {
        self.hide_silly_renamed = hide;
        self
    }

    /// Sets whether silly-rename candidates are probed before use.
    #[must_use]
    pub fn probe_silly_names(mut self, probe: bool) -> Self {
        self.probe_silly_names = probe;
        self
    }

    /// Sets the process ID used in temporary names.
    #[must_use]
    pub fn process_id(mut self, pid: u32) -> Self {
        self.process_id = pid;
        self
    }
}
