//! Dedup record: proof that a message id was processed successfully.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::MessageId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub message_id: MessageId,
    pub processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DedupRecord {
    pub fn new(message_id: MessageId, processed_at: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            message_id,
            processed_at,
            expires_at: processed_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// A record is live strictly before `expires_at`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
