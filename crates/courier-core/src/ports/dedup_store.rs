//! DedupStore port - 処理済み message id の記録
//!
//! Consulted before a handler runs and written after a Success outcome.
//! Writes for the same id are atomic; the last one wins.
//!
//! Store failures are reported, not hidden: the dispatcher treats a failed
//! read as "not processed" and a failed write as a missing record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::DedupError;
use crate::domain::ids::MessageId;

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// True while a live record exists for `message_id`.
    async fn has_processed(&self, message_id: &MessageId) -> Result<bool, DedupError>;

    /// Records `message_id` as processed for `ttl`, replacing any earlier record.
    async fn mark_processed(&self, message_id: &MessageId, ttl: Duration)
    -> Result<(), DedupError>;

    /// Drops expired records and returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, DedupError>;
}

#[async_trait]
impl<S: DedupStore + ?Sized> DedupStore for Arc<S> {
    async fn has_processed(&self, message_id: &MessageId) -> Result<bool, DedupError> {
        (**self).has_processed(message_id).await
    }

    async fn mark_processed(
        &self,
        message_id: &MessageId,
        ttl: Duration,
    ) -> Result<(), DedupError> {
        (**self).mark_processed(message_id, ttl).await
    }

    async fn purge_expired(&self) -> Result<usize, DedupError> {
        (**self).purge_expired().await
    }
}
