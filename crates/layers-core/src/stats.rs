use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::models::ChangeKind;

/// Counters for the realtime listener
#[derive(Debug, Default, Clone)]
pub struct SyncStats {
    /// Notifications received, by kind
    pub received_by_kind: HashMap<ChangeKind, u64>,
    /// Inserts dropped because the item was already present (own echoes)
    pub echoes_dropped: u64,
    /// Temp entries replaced by their confirmed copy
    pub temps_confirmed: u64,
    /// Updates that moved an item out of the listener's view
    pub left_view: u64,
    /// Notifications for other users or a disabled store
    pub ignored: u64,
    /// Lines the decoder could not parse
    pub decode_errors: u64,
    /// Successful subscriptions after the first
    pub resubscriptions: u64,
    pub total: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: ChangeKind) {
        self.total += 1;
        *self.received_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn received(&self, kind: ChangeKind) -> u64 {
        self.received_by_kind.get(&kind).copied().unwrap_or(0)
    }
}

/// Thread-safe wrapper for sync stats
#[derive(Debug, Clone)]
pub struct SharedSyncStats {
    inner: Arc<RwLock<SyncStats>>,
}

impl Default for SharedSyncStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedSyncStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SyncStats::new())),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut SyncStats)) {
        if let Ok(mut stats) = self.inner.write() {
            f(&mut stats);
        }
    }

    pub fn record(&self, kind: ChangeKind) {
        self.update(|stats| stats.record(kind));
    }

    pub fn snapshot(&self) -> SyncStats {
        self.inner.read().map(|s| s.clone()).unwrap_or_default()
    }
}
