//! In-memory dedup store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::dedup::DedupRecord;
use crate::domain::errors::DedupError;
use crate::domain::ids::MessageId;
use crate::ports::{Clock, DedupStore, SystemClock};

/// Dedup records in a map behind one lock, expiring against `Clock`.
pub struct InMemoryDedupStore {
    records: Mutex<HashMap<MessageId, DedupRecord>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Records currently stored, expired ones included.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, message_id: &MessageId) -> Option<DedupRecord> {
        self.records.lock().await.get(message_id).cloned()
    }
}

impl Default for InMemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn has_processed(&self, message_id: &MessageId) -> Result<bool, DedupError> {
        let now = self.clock.now();
        let records = self.records.lock().await;
        Ok(records
            .get(message_id)
            .is_some_and(|record| record.is_live_at(now)))
    }

    async fn mark_processed(
        &self,
        message_id: &MessageId,
        ttl: Duration,
    ) -> Result<(), DedupError> {
        let now = self.clock.now();
        let ttl =
            chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let record = DedupRecord::new(message_id.clone(), now, ttl);
        self.records.lock().await.insert(message_id.clone(), record);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, DedupError> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| record.is_live_at(now));
        Ok(before - records.len())
    }
}
