//! Adapter-level retries for transient queue errors.
//!
//! `Transport` and `Throttling` failures are retried with jittered
//! exponential backoff. `NotFound` and `Rejected` go straight back to the
//! caller. These retries are invisible to the message: they never touch its
//! receive count or its retry budget.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::warn;

use crate::domain::errors::QueueError;
use crate::domain::ids::{MessageId, ReceiptHandle};
use crate::domain::message::{Message, OutgoingMessage};
use crate::ports::QueueClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Upper bound of the first delay (jitter picks below it).
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// delays: base, 2*base, 4*base, ... each jittered, capped at `max_delay`.
    fn strategy(&self) -> impl Iterator<Item = Duration> + Send + use<> {
        // from_millis(2) doubles per step; the factor scales the first step to base
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries)
    }
}

/// Wraps any `QueueClient` with transient-error retries.
pub struct RetryingQueueClient<Q> {
    inner: Q,
    config: RetryConfig,
}

impl<Q: QueueClient> RetryingQueueClient<Q> {
    pub fn new(inner: Q, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, action: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, QueueError>> + Send,
        T: Send,
    {
        RetryIf::spawn(self.config.strategy(), action, |e: &QueueError| {
            let retry = e.is_retryable();
            if retry {
                warn!(operation, error = %e, "Transient queue error, retrying");
            }
            retry
        })
        .await
    }
}

#[async_trait]
impl<Q: QueueClient> QueueClient for RetryingQueueClient<Q> {
    async fn receive_batch(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        self.retry("receive", || self.inner.receive_batch(max_messages, wait_time))
            .await
    }

    async fn delete(&self, receipt_handle: &ReceiptHandle) -> Result<(), QueueError> {
        self.retry("delete", || self.inner.delete(receipt_handle)).await
    }

    async fn change_visibility(
        &self,
        receipt_handle: &ReceiptHandle,
        seconds: u32,
    ) -> Result<(), QueueError> {
        self.retry("change_visibility", || {
            self.inner.change_visibility(receipt_handle, seconds)
        })
        .await
    }

    async fn send(&self, message: OutgoingMessage) -> Result<MessageId, QueueError> {
        self.retry("send", || self.inner.send(message.clone())).await
    }

    /// A failed batch is resent whole, so a partially applied batch may
    /// produce duplicates (at-least-once).
    async fn send_batch(
        &self,
        messages: Vec<OutgoingMessage>,
    ) -> Result<Vec<MessageId>, QueueError> {
        self.retry("send_batch", || self.inner.send_batch(messages.clone()))
            .await
    }
}
