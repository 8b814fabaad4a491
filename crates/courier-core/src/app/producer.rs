//! Producer - メッセージ送信側
//!
//! `send_many` splits its input into queue-sized batches (at most 10 per
//! request).

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::errors::QueueError;
use crate::domain::ids::MessageId;
use crate::domain::message::OutgoingMessage;
use crate::ports::{MAX_BATCH_SIZE, QueueClient};
use crate::typed::{CodecError, Payload, PayloadCodec};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A batch failed part-way; `sent` holds the ids of the earlier batches.
    #[error("send_many stopped after {} messages: {source}", sent.len())]
    SendMany {
        sent: Vec<MessageId>,
        #[source]
        source: QueueError,
    },
}

#[derive(Clone)]
pub struct Producer {
    queue: Arc<dyn QueueClient>,
}

impl Producer {
    pub fn new(queue: Arc<dyn QueueClient>) -> Self {
        Self { queue }
    }

    pub async fn send(&self, message: OutgoingMessage) -> Result<MessageId, ProducerError> {
        let id = self.queue.send(message).await?;
        debug!(message_id = %id, "Message sent");
        Ok(id)
    }

    pub async fn send_body(&self, body: impl Into<String>) -> Result<MessageId, ProducerError> {
        self.send(OutgoingMessage::new(body)).await
    }

    /// JSON-encodes `payload` and tags it with `T::TYPE`.
    pub async fn send_typed<T: Payload>(&self, payload: &T) -> Result<MessageId, ProducerError> {
        let message = PayloadCodec::encode(payload)?;
        self.send(message).await
    }

    /// Sends every message, [`MAX_BATCH_SIZE`] per request, in order.
    pub async fn send_many(
        &self,
        messages: Vec<OutgoingMessage>,
    ) -> Result<Vec<MessageId>, ProducerError> {
        let total = messages.len();
        let mut sent = Vec::with_capacity(total);
        let mut pending = messages.into_iter().peekable();

        while pending.peek().is_some() {
            let batch: Vec<_> = pending.by_ref().take(MAX_BATCH_SIZE).collect();
            match self.queue.send_batch(batch).await {
                Ok(ids) => sent.extend(ids),
                Err(source) => {
                    warn!(sent = sent.len(), total, error = %source, "send_many failed");
                    return Err(ProducerError::SendMany { sent, source });
                }
            }
        }
        debug!(count = sent.len(), "Messages sent");
        Ok(sent)
    }

    pub async fn send_many_typed<T: Payload>(
        &self,
        payloads: &[T],
    ) -> Result<Vec<MessageId>, ProducerError> {
        let messages = payloads
            .iter()
            .map(PayloadCodec::encode)
            .collect::<Result<Vec<_>, _>>()?;
        self.send_many(messages).await
    }
}
