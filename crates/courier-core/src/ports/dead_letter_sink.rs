//! DeadLetterSink port - DLQ への書き込み

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::dead_letter::DeadLetterEntry;
use crate::domain::errors::SinkError;

/// Destination for messages that will not be processed.
///
/// The coordinator deletes the source message only after `write` returned
/// `Ok`, so a failing sink leads to redelivery instead of loss.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn write(&self, entry: &DeadLetterEntry) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: DeadLetterSink + ?Sized> DeadLetterSink for Arc<S> {
    async fn write(&self, entry: &DeadLetterEntry) -> Result<(), SinkError> {
        (**self).write(entry).await
    }
}
