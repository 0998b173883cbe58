use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Mutex-guarded identifier → send-time correlation table.
///
/// One entry exists per dispatched-but-unreported schedule identifier.
/// The value stays `None` until the probe worker observes the authoritative
/// send event. All methods take the lock briefly and never touch I/O while
/// holding it; store writes happen strictly after the lock is released.
#[derive(Default)]
pub struct PendingTracker {
    entries: parking_lot::Mutex<HashMap<u64, Option<DateTime<Utc>>>>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an identifier as dispatched, if not already present.
    ///
    /// Returns true when the identifier was newly inserted. A false return
    /// means the row was seen on an earlier cycle and must not be handed to
    /// a measurement service again.
    pub fn mark_dispatched(&self, identifier: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.entry(identifier) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(None);
                true
            }
            std::collections::hash_map::Entry::Occupied(_) => false,
        }
    }

    /// Store the authoritative send time for an identifier.
    ///
    /// Insert-or-update: a result may arrive before the dispatching cycle
    /// got around to `mark_dispatched`, and a failed store transaction puts
    /// taken times back through this same path.
    pub fn record_send_time(&self, identifier: u64, send_time: DateTime<Utc>) {
        self.entries.lock().insert(identifier, Some(send_time));
    }

    /// Remove and return the send time for an identifier, if one is recorded.
    ///
    /// Entries still waiting on their probe (value `None`) are left alone.
    pub fn take_if_ready(&self, identifier: u64) -> Option<DateTime<Utc>> {
        let mut entries = self.entries.lock();
        match entries.get(&identifier) {
            Some(Some(_)) => entries.remove(&identifier).flatten(),
            _ => None,
        }
    }

    /// Whether the identifier is currently tracked (in either state).
    pub fn contains(&self, identifier: u64) -> bool {
        self.entries.lock().contains_key(&identifier)
    }

    /// Number of tracked identifiers.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
