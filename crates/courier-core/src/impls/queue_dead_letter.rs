//! Dead-letter sink backed by a queue: the entry's JSON becomes the body of
//! a message on the dead-letter queue.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::dead_letter::DeadLetterEntry;
use crate::domain::errors::SinkError;
use crate::domain::message::{MESSAGE_TYPE_ATTRIBUTE, OutgoingMessage};
use crate::ports::{DeadLetterSink, QueueClient};

/// `message_type` attribute value on dead-letter messages.
pub const DEAD_LETTER_MESSAGE_TYPE: &str = "courier.dead_letter.v1";

pub struct QueueDeadLetterSink {
    queue: Arc<dyn QueueClient>,
}

impl QueueDeadLetterSink {
    pub fn new(queue: Arc<dyn QueueClient>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl DeadLetterSink for QueueDeadLetterSink {
    async fn write(&self, entry: &DeadLetterEntry) -> Result<(), SinkError> {
        let body = entry.to_json()?;
        let mut outgoing = OutgoingMessage::new(body)
            .with_attribute(MESSAGE_TYPE_ATTRIBUTE, DEAD_LETTER_MESSAGE_TYPE)
            .with_attribute("source_message_id", entry.message.id.as_str());
        // keep FIFO dead-letter queues ordered by the source group
        if let Some(group) = &entry.message.group_id {
            outgoing = outgoing
                .with_group(group.clone())
                .with_deduplication_id(entry.message.id.as_str());
        }

        let id = self.queue.send(outgoing).await?;
        debug!(
            message_id = %entry.message.id,
            dead_letter_id = %id,
            "Dead-letter entry written"
        );
        Ok(())
    }
}
