//! Message model: what a receive returns and what a send takes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, ReceiptHandle};

/// Attribute carrying the payload type name for typed handlers and matchers.
pub const MESSAGE_TYPE_ATTRIBUTE: &str = "message_type";

/// One delivery of a message.
///
/// `receipt_handle` identifies this delivery only; `id` is the same on every
/// redelivery. `receive_count` is the provider's approximate receive count and
/// starts at 1 on the first delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub body: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    pub receipt_handle: ReceiptHandle,

    pub receive_count: u32,

    /// FIFO message group, if the queue is a FIFO queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(id: MessageId, receipt_handle: ReceiptHandle, body: impl Into<String>) -> Self {
        Self {
            id,
            body: body.into(),
            attributes: BTreeMap::new(),
            receipt_handle,
            receive_count: 1,
            group_id: None,
            sent_at: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_receive_count(mut self, receive_count: u32) -> Self {
        self.receive_count = receive_count;
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.attribute(MESSAGE_TYPE_ATTRIBUTE)
    }

    /// 1-indexed attempt number of this delivery.
    pub fn attempt(&self) -> u32 {
        self.receive_count.max(1)
    }
}

/// A message to be sent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub body: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    /// Required by FIFO queues, ignored by standard queues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// FIFO deduplication id. Without it the queue must have content-based
    /// deduplication enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication_id: Option<String>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_deduplication_id(mut self, id: impl Into<String>) -> Self {
        self.deduplication_id = Some(id.into());
        self
    }
}
