//! Status - consumer の統計カウンタ
//!
//! Workers, the dispatcher and the coordinator bump these counters; callers
//! read a consistent-enough copy through [`ConsumerStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    acknowledged: AtomicU64,
    deferred: AtomicU64,
    dead_lettered: AtomicU64,
    duplicates_skipped: AtomicU64,
    duplicates_deferred: AtomicU64,
    stale_handles: AtomicU64,
    ack_errors: AtomicU64,
    dead_letter_errors: AtomicU64,
    receive_errors: AtomicU64,
    panics: AtomicU64,
    timeouts: AtomicU64,
    returned_on_shutdown: AtomicU64,
    requeued: AtomicU64,
    dedup_errors: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub acknowledged: u64,
    pub deferred: u64,
    pub dead_lettered: u64,
    /// Dedup hits acknowledged without running a handler.
    pub duplicates_skipped: u64,
    /// Deliveries deferred because the same message id was already being processed.
    pub duplicates_deferred: u64,
    pub stale_handles: u64,
    pub ack_errors: u64,
    pub dead_letter_errors: u64,
    pub receive_errors: u64,
    pub panics: u64,
    pub timeouts: u64,
    pub returned_on_shutdown: u64,
    /// FIFO group members put back unprocessed because an earlier message of
    /// the group did not complete.
    pub requeued: u64,
    pub dedup_errors: u64,
}

impl StatsSnapshot {
    /// Deliveries that reached an acknowledgement action.
    pub fn finished(&self) -> u64 {
        self.acknowledged + self.deferred + self.dead_lettered
    }
}

macro_rules! counters {
    ($($field:ident => $incr:ident),* $(,)?) => {
        impl ConsumerStats {
            $(
                pub(crate) fn $incr(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    received => record_received,
    acknowledged => record_acknowledged,
    deferred => record_deferred,
    dead_lettered => record_dead_lettered,
    duplicates_skipped => record_duplicate_skipped,
    duplicates_deferred => record_duplicate_deferred,
    stale_handles => record_stale_handle,
    ack_errors => record_ack_error,
    dead_letter_errors => record_dead_letter_error,
    receive_errors => record_receive_error,
    panics => record_panic,
    timeouts => record_timeout,
    returned_on_shutdown => record_returned,
    requeued => record_requeued,
    dedup_errors => record_dedup_error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = ConsumerStats::default();
        stats.record_received();
        stats.record_received();
        stats.record_acknowledged();
        stats.record_deferred();
        stats.record_stale_handle();

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.acknowledged, 1);
        assert_eq!(snap.deferred, 1);
        assert_eq!(snap.stale_handles, 1);
        assert_eq!(snap.finished(), 2);
        assert_eq!(snap.dead_lettered, 0);
    }

    #[test]
    fn snapshot_serializes_as_flat_json() {
        let stats = ConsumerStats::default();
        stats.record_dead_lettered();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["dead_lettered"], 1);
        assert_eq!(json["returned_on_shutdown"], 0);
    }
}
