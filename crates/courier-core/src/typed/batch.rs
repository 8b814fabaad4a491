//! Batch handlers: one call for a whole received batch, one outcome per message.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::domain::message::Message;
use crate::domain::outcome::ProcessingOutcome;

#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Returns one outcome per message, in the same order.
    async fn handle_batch(&self, messages: &[Message]) -> Vec<ProcessingOutcome>;
}

pub struct FnBatchHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wraps an async closure taking the batch by value.
pub fn batch_fn<F, Fut>(f: F) -> FnBatchHandler<F, Fut>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<ProcessingOutcome>> + Send + 'static,
{
    FnBatchHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> BatchHandler for FnBatchHandler<F, Fut>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<ProcessingOutcome>> + Send + 'static,
{
    async fn handle_batch(&self, messages: &[Message]) -> Vec<ProcessingOutcome> {
        (self.f)(messages.to_vec()).await
    }
}

/// Pads or truncates `outcomes` to `expected` entries. Missing outcomes
/// become retryable failures so the messages come back.
pub(crate) fn align_outcomes(
    mut outcomes: Vec<ProcessingOutcome>,
    expected: usize,
) -> Vec<ProcessingOutcome> {
    let got = outcomes.len();
    if got != expected {
        let reason = format!("batch handler returned {got} outcomes for {expected} messages");
        outcomes.truncate(expected);
        outcomes.resize_with(expected, || ProcessingOutcome::retryable(reason.clone()));
    }
    outcomes
}
