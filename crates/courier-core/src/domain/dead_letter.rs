//! Dead-letter entry: the terminal record of a message that could not be processed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;

/// One failed processing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub reason: String,
    pub receive_count: u32,
}

impl FailureRecord {
    pub fn new(at: DateTime<Utc>, reason: impl Into<String>, receive_count: u32) -> Self {
        Self {
            at,
            reason: reason.into(),
            receive_count,
        }
    }
}

/// Everything known about a message when it is dead-lettered.
///
/// The JSON form of this struct is the body written to a dead-letter queue.
/// `failure_history` is ordered oldest first and includes the final failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: Message,
    pub failure_history: Vec<FailureRecord>,
    pub final_reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        message: Message,
        failure_history: Vec<FailureRecord>,
        final_reason: impl Into<String>,
        dead_lettered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message,
            failure_history,
            final_reason: final_reason.into(),
            dead_lettered_at,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Number of recorded failed attempts.
    pub fn attempts(&self) -> usize {
        self.failure_history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{MessageId, ReceiptHandle};
    use chrono::TimeZone;

    #[test]
    fn entry_json_carries_message_and_history() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let message = Message::new(MessageId::new("m-1"), ReceiptHandle::new("r-3"), "{\"x\":1}")
            .with_receive_count(3);
        let history = vec![
            FailureRecord::new(at, "db busy", 1),
            FailureRecord::new(at, "db busy", 2),
            FailureRecord::new(at, "db busy", 3),
        ];
        let entry = DeadLetterEntry::new(message, history, "db busy", at);

        let json = entry.to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["message"]["id"], "m-1");
        assert_eq!(v["message"]["body"], "{\"x\":1}");
        assert_eq!(v["failure_history"].as_array().unwrap().len(), 3);
        assert_eq!(v["failure_history"][2]["receive_count"], 3);
        assert_eq!(v["final_reason"], "db busy");

        let back = DeadLetterEntry::from_json(&json).unwrap();
        assert_eq!(back.attempts(), 3);
    }
}
