//! Dispatcher - 1 配送の処理パイプライン
//!
//! dedup 確認 → handler 実行（panic / timeout 捕捉）→ dedup 記録 → coordinator
//!
//! Handler panics and timeouts become `RetryableFailure`, so whatever a
//! handler does, the delivery still reaches exactly one acknowledgement action.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, warn};

use super::coordinator::{AckCoordinator, Delivery};
use super::status::ConsumerStats;
use crate::domain::ids::MessageId;
use crate::domain::message::Message;
use crate::domain::outcome::ProcessingOutcome;
use crate::domain::state::DeliveryState;
use crate::ports::DedupStore;
use crate::typed::HandlerRegistry;

/// Visibility given to a delivery whose message id is already being
/// processed by another task.
pub const IN_PROGRESS_DEFER_SECS: u32 = 5;

pub struct Dispatcher {
    registry: HandlerRegistry,
    dedup: Arc<dyn DedupStore>,
    coordinator: Arc<AckCoordinator>,
    stats: Arc<ConsumerStats>,
    handler_timeout: Option<Duration>,
    dedup_ttl: Duration,
    claims: Mutex<HashSet<MessageId>>,
}

impl Dispatcher {
    pub fn new(
        registry: HandlerRegistry,
        dedup: Arc<dyn DedupStore>,
        coordinator: Arc<AckCoordinator>,
        stats: Arc<ConsumerStats>,
        dedup_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            dedup,
            coordinator,
            stats,
            handler_timeout: None,
            dedup_ttl,
            claims: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<AckCoordinator> {
        &self.coordinator
    }

    /// Processes one delivery through its first matching route.
    pub async fn process_one(&self, message: Message) -> DeliveryState {
        self.stats.record_received();
        let delivery = Delivery::received(message);
        let Some(_claim) = Claim::acquire(&self.claims, &delivery.message().id) else {
            return self
                .coordinator
                .defer_duplicate(delivery, IN_PROGRESS_DEFER_SECS)
                .await;
        };
        let mut delivery = match self.admit(delivery).await {
            Admission::Process(delivery) => delivery,
            Admission::Done(state) => return state,
        };

        delivery.start_processing();
        let outcome = self
            .guarded(self.registry.dispatch(delivery.message()))
            .await
            .unwrap_or_else(ProcessingOutcome::RetryableFailure);
        self.settle(delivery, &outcome).await
    }

    /// Processes deliveries routed to the same batch route with one handler
    /// call. Dedup hits and in-progress duplicates are settled individually
    /// and never reach the handler.
    pub async fn process_batch(&self, route: usize, messages: Vec<Message>) -> Vec<DeliveryState> {
        let mut states = Vec::with_capacity(messages.len());
        let mut pending = Vec::with_capacity(messages.len());
        let mut claims = Vec::with_capacity(messages.len());

        for message in messages {
            self.stats.record_received();
            let delivery = Delivery::received(message);
            let Some(claim) = Claim::acquire(&self.claims, &delivery.message().id) else {
                states.push(
                    self.coordinator
                        .defer_duplicate(delivery, IN_PROGRESS_DEFER_SECS)
                        .await,
                );
                continue;
            };
            match self.admit(delivery).await {
                Admission::Process(delivery) => {
                    claims.push(claim);
                    pending.push(delivery);
                }
                Admission::Done(state) => states.push(state),
            }
        }
        if pending.is_empty() {
            return states;
        }

        for delivery in &mut pending {
            delivery.start_processing();
        }
        let batch: Vec<Message> = pending.iter().map(|d| d.message().clone()).collect();
        debug!(route, size = batch.len(), "Dispatching batch");

        let outcomes = match self.guarded(self.registry.dispatch_batch(route, &batch)).await {
            Ok(outcomes) => outcomes,
            Err(reason) => vec![ProcessingOutcome::RetryableFailure(reason); batch.len()],
        };
        for (delivery, outcome) in pending.into_iter().zip(outcomes) {
            states.push(self.settle(delivery, &outcome).await);
        }
        drop(claims);
        states
    }

    /// Dedup check. Callers hold the claim for the id, so no other delivery
    /// can mark it processed between this read and the handler run.
    async fn admit(&self, delivery: Delivery) -> Admission {
        let id = &delivery.message().id;
        let processed = match self.dedup.has_processed(id).await {
            Ok(processed) => processed,
            Err(e) => {
                // 読めないときは未処理扱い
                warn!(message_id = %id, error = %e, "Dedup lookup failed, processing anyway");
                self.stats.record_dedup_error();
                false
            }
        };
        if processed {
            return Admission::Done(self.coordinator.acknowledge_duplicate(delivery).await);
        }
        Admission::Process(delivery)
    }

    async fn settle(&self, delivery: Delivery, outcome: &ProcessingOutcome) -> DeliveryState {
        if outcome.is_success() {
            // marked before the delete so a lost delete cannot run the handler again
            let id = &delivery.message().id;
            if let Err(e) = self.dedup.mark_processed(id, self.dedup_ttl).await {
                warn!(message_id = %id, error = %e, "Failed to record processed message");
                self.stats.record_dedup_error();
            }
        }
        self.coordinator.finish(delivery, outcome).await
    }

    /// Runs handler code, turning a panic or an overrun into an error reason.
    async fn guarded<T, F>(&self, fut: F) -> Result<T, String>
    where
        F: Future<Output = T>,
    {
        let fut = AssertUnwindSafe(fut).catch_unwind();
        let result = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "Handler timed out");
                    self.stats.record_timeout();
                    return Err("handler timed out".to_string());
                }
            },
            None => fut.await,
        };
        result.map_err(|panic| {
            let detail = panic_message(panic.as_ref());
            error!(panic = %detail, "Handler panicked");
            self.stats.record_panic();
            format!("handler panicked: {detail}")
        })
    }
}

enum Admission {
    Process(Delivery),
    Done(DeliveryState),
}

/// Marks a message id as in progress until dropped.
struct Claim<'a> {
    claims: &'a Mutex<HashSet<MessageId>>,
    id: MessageId,
}

impl<'a> Claim<'a> {
    fn acquire(claims: &'a Mutex<HashSet<MessageId>>, id: &MessageId) -> Option<Self> {
        lock(claims).insert(id.clone()).then(|| Self {
            claims,
            id: id.clone(),
        })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        lock(self.claims).remove(&self.id);
    }
}

fn lock(claims: &Mutex<HashSet<MessageId>>) -> MutexGuard<'_, HashSet<MessageId>> {
    claims.lock().unwrap_or_else(|e| e.into_inner())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
