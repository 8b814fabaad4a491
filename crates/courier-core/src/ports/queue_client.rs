//! QueueClient port - SQS 互換キューへのアクセス
//!
//! Receive / delete / change-visibility / send, nothing more. Implementations
//! must clamp their arguments to the limits below instead of failing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::backoff::MAX_VISIBILITY_SECS;
use crate::domain::errors::QueueError;
use crate::domain::ids::{MessageId, ReceiptHandle};
use crate::domain::message::{Message, OutgoingMessage};

/// Most messages one receive (or one send batch) may carry.
pub const MAX_BATCH_SIZE: usize = 10;

/// Longest long-poll wait SQS supports.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

pub fn clamp_batch_size(max_messages: usize) -> usize {
    max_messages.clamp(1, MAX_BATCH_SIZE)
}

pub fn clamp_wait_time(wait_time: Duration) -> Duration {
    wait_time.min(MAX_WAIT_TIME)
}

pub fn clamp_visibility(seconds: u32) -> u32 {
    seconds.min(MAX_VISIBILITY_SECS as u32)
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Long-polls for up to `max_messages` messages.
    ///
    /// Returns an empty batch once `wait_time` elapses with nothing to
    /// deliver. Every returned message is in flight (invisible to other
    /// consumers) until deleted, deferred or its visibility timeout expires.
    async fn receive_batch(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Message>, QueueError>;

    /// Deletes the delivery. `NotFound` if the handle is stale.
    async fn delete(&self, receipt_handle: &ReceiptHandle) -> Result<(), QueueError>;

    /// Makes the delivery visible again after `seconds`. `0` returns it at once.
    async fn change_visibility(
        &self,
        receipt_handle: &ReceiptHandle,
        seconds: u32,
    ) -> Result<(), QueueError>;

    async fn send(&self, message: OutgoingMessage) -> Result<MessageId, QueueError>;

    /// Sends up to [`MAX_BATCH_SIZE`] messages. The default implementation
    /// sends them one by one and stops at the first error.
    async fn send_batch(
        &self,
        messages: Vec<OutgoingMessage>,
    ) -> Result<Vec<MessageId>, QueueError> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.send(message).await?);
        }
        Ok(ids)
    }
}

#[async_trait]
impl<Q: QueueClient + ?Sized> QueueClient for Arc<Q> {
    async fn receive_batch(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        (**self).receive_batch(max_messages, wait_time).await
    }

    async fn delete(&self, receipt_handle: &ReceiptHandle) -> Result<(), QueueError> {
        (**self).delete(receipt_handle).await
    }

    async fn change_visibility(
        &self,
        receipt_handle: &ReceiptHandle,
        seconds: u32,
    ) -> Result<(), QueueError> {
        (**self).change_visibility(receipt_handle, seconds).await
    }

    async fn send(&self, message: OutgoingMessage) -> Result<MessageId, QueueError> {
        (**self).send(message).await
    }

    async fn send_batch(
        &self,
        messages: Vec<OutgoingMessage>,
    ) -> Result<Vec<MessageId>, QueueError> {
        (**self).send_batch(messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex;

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(7, 7)]
    #[case(10, 10)]
    #[case(64, 10)]
    fn batch_size_is_clamped(#[case] requested: usize, #[case] expected: usize) {
        assert_eq!(clamp_batch_size(requested), expected);
    }

    #[test]
    fn wait_and_visibility_are_clamped() {
        assert_eq!(clamp_wait_time(Duration::from_secs(2)), Duration::from_secs(2));
        assert_eq!(clamp_wait_time(Duration::from_secs(90)), MAX_WAIT_TIME);
        assert_eq!(clamp_visibility(30), 30);
        assert_eq!(clamp_visibility(u32::MAX), 43_200);
    }

    /// Records sends and fails on a chosen body.
    struct SendOnly {
        sent: Mutex<Vec<String>>,
        fail_on: &'static str,
    }

    #[async_trait]
    impl QueueClient for SendOnly {
        async fn receive_batch(&self, _: usize, _: Duration) -> Result<Vec<Message>, QueueError> {
            Ok(Vec::new())
        }

        async fn delete(&self, _: &ReceiptHandle) -> Result<(), QueueError> {
            Ok(())
        }

        async fn change_visibility(&self, _: &ReceiptHandle, _: u32) -> Result<(), QueueError> {
            Ok(())
        }

        async fn send(&self, message: OutgoingMessage) -> Result<MessageId, QueueError> {
            if message.body == self.fail_on {
                return Err(QueueError::Rejected("bad body".into()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(message.body);
            Ok(MessageId::new(format!("id-{}", sent.len())))
        }
    }

    #[tokio::test]
    async fn default_send_batch_sends_in_order_and_stops_on_error() {
        let client = Arc::new(SendOnly {
            sent: Mutex::new(Vec::new()),
            fail_on: "c",
        });

        let ids = client
            .send_batch(vec![OutgoingMessage::new("a"), OutgoingMessage::new("b")])
            .await
            .unwrap();
        assert_eq!(ids, vec![MessageId::new("id-1"), MessageId::new("id-2")]);

        let err = client
            .send_batch(vec![
                OutgoingMessage::new("c"),
                OutgoingMessage::new("d"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Rejected(_)));
        assert_eq!(*client.sent.lock().unwrap(), vec!["a", "b"]);
    }
}
