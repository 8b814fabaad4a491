//! In-flight tracking: receipt handles dispatched but not yet acknowledged.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::time::Instant;

use crate::domain::ids::{MessageId, ReceiptHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightEntry {
    pub handle: ReceiptHandle,
    pub message_id: MessageId,
    pub since: Instant,
}

/// One per worker. A handle is inserted at dispatch and removed once its
/// acknowledgement action has completed; whatever is left at shutdown was
/// never acknowledged.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    entries: Mutex<HashMap<ReceiptHandle, InFlightEntry>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: ReceiptHandle, message_id: MessageId) {
        let entry = InFlightEntry {
            handle: handle.clone(),
            message_id,
            since: Instant::now(),
        };
        self.lock().insert(handle, entry);
    }

    pub fn remove(&self, handle: &ReceiptHandle) -> Option<InFlightEntry> {
        self.lock().remove(handle)
    }

    pub fn contains(&self, handle: &ReceiptHandle) -> bool {
        self.lock().contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes and returns every entry, oldest first.
    pub fn drain(&self) -> Vec<InFlightEntry> {
        let mut entries: Vec<_> = self.lock().drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.since);
        entries
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ReceiptHandle, InFlightEntry>> {
        // no invariant spans the map, so a poisoned lock is still usable
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
