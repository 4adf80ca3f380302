//! Wire-traffic counters for a volume.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for handle and listing traffic.
///
/// Thread-safe counters using atomic operations for lock-free updates.
#[derive(Debug, Default)]
pub struct VolumeStats {
    /// Handles opened on the wire by `acquire`
    pub wire_opens: AtomicU64,

    /// Acquisitions satisfied by an already-open handle
    pub handle_reuses: AtomicU64,

    /// Handles closed on the wire
    pub wire_closes: AtomicU64,

    /// Handles re-established after a reconnect
    pub reopens: AtomicU64,

    /// Nodes moved to the revoked state
    pub revokes: AtomicU64,

    /// Search pages received
    pub pages_fetched: AtomicU64,

    /// Lost-reply `NotFound` results turned into success
    pub guard_absorptions: AtomicU64,

    /// Files renamed to a temporary name on unlink
    pub silly_renames: AtomicU64,
}

impl VolumeStats {
    /// Create new empty counters
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_wire_open(&self) {
        self.wire_opens.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_handle_reuse(&self) {
        self.handle_reuses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_wire_close(&self) {
        self.wire_closes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reopen(&self) {
        self.reopens.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_revoke(&self) {
        self.revokes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_page(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_guard_absorption(&self) {
        self.guard_absorptions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_silly_rename(&self) {
        self.silly_renames.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of the counters
    pub fn snapshot(&self) -> VolumeStatsSnapshot {
        VolumeStatsSnapshot {
            wire_opens: self.wire_opens.load(Ordering::Relaxed),
            handle_reuses: self.handle_reuses.load(Ordering::Relaxed),
            wire_closes: self.wire_closes.load(Ordering::Relaxed),
            reopens: self.reopens.load(Ordering::Relaxed),
            revokes: self.revokes.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            guard_absorptions: self.guard_absorptions.load(Ordering::Relaxed),
            silly_renames: self.silly_renames.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        self.wire_opens.store(0, Ordering::Relaxed);
        self.handle_reuses.store(0, Ordering::Relaxed);
        self.wire_closes.store(0, Ordering::Relaxed);
        self.reopens.store(0, Ordering::Relaxed);
        self.revokes.store(0, Ordering::Relaxed);
        self.pages_fetched.store(0, Ordering::Relaxed);
        self.guard_absorptions.store(0, Ordering::Relaxed);
        self.silly_renames.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`VolumeStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VolumeStatsSnapshot {
    pub wire_opens: u64,
    pub handle_reuses: u64,
    pub wire_closes: u64,
    pub reopens: u64,
    pub revokes: u64,
    pub pages_fetched: u64,
    pub guard_absorptions: u64,
    pub silly_renames: u64,
}

impl VolumeStatsSnapshot {
    /// Handles opened on the wire and not yet closed.
    ///
    /// Handles dropped locally after a reconnect or revoke are not counted as
    /// closes, so this is an upper bound once either has happened.
    pub fn open_handles(&self) -> u64 {
        self.wire_opens.saturating_sub(self.wire_closes)
    }
}
