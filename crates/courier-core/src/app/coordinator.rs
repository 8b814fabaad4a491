//! AckCoordinator - 処理結果を acknowledgement action に変換して実行
//!
//! # フロー
//! 1. Decider が outcome と receive_count から AckDecision を決める
//! 2. Acknowledge → delete
//! 3. Defer → change_visibility(backoff)
//! 4. DeadLetter → DeadLetterSink::write → delete（write 失敗時は delete しない）
//!
//! `Delivery` は `finish` で消費されるので、同じ配送を二度 ack することはできない。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use super::status::ConsumerStats;
use crate::domain::backoff::BackoffPolicy;
use crate::domain::dead_letter::{DeadLetterEntry, FailureRecord};
use crate::domain::decision::{AckDecision, Decider};
use crate::domain::errors::QueueError;
use crate::domain::ids::{MessageId, ReceiptHandle};
use crate::domain::message::Message;
use crate::domain::outcome::ProcessingOutcome;
use crate::domain::state::DeliveryState;
use crate::ports::{Clock, DeadLetterSink, QueueClient};

/// Message ids whose failure history is kept between deliveries.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

/// One received delivery on its way to an acknowledgement action.
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    state: DeliveryState,
}

impl Delivery {
    pub fn received(message: Message) -> Self {
        Self {
            message,
            state: DeliveryState::Received,
        }
    }

    pub fn start_processing(&mut self) {
        self.transition(DeliveryState::Processing);
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    fn transition(&mut self, next: DeliveryState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid delivery transition {:?} -> {next:?}",
            self.state
        );
        self.state = next;
    }
}

pub struct AckCoordinator {
    queue: Arc<dyn QueueClient>,
    sink: Arc<dyn DeadLetterSink>,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    /// Used to defer a message whose dead-letter write failed.
    backoff: BackoffPolicy,
    history: Mutex<HashMap<MessageId, Vec<FailureRecord>>>,
    history_capacity: usize,
    stats: Arc<ConsumerStats>,
}

impl AckCoordinator {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        sink: Arc<dyn DeadLetterSink>,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            queue,
            sink,
            decider,
            clock,
            backoff,
            history: Mutex::new(HashMap::new()),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            stats,
        }
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    /// Decides and executes the acknowledgement action for a processed
    /// delivery. Returns the state the delivery ended in.
    pub async fn finish(&self, mut delivery: Delivery, outcome: &ProcessingOutcome) -> DeliveryState {
        let decision = self.decider.decide(&delivery.message, outcome);
        debug!(
            message_id = %delivery.message.id,
            receive_count = delivery.message.receive_count,
            outcome = ?outcome.kind(),
            decision = decision.label(),
            "Delivery processed"
        );

        match decision {
            AckDecision::Acknowledge => {
                self.delete(&delivery.message, "acknowledge").await;
                self.clear_history(&delivery.message.id);
                self.stats.record_acknowledged();
                delivery.transition(DeliveryState::Acknowledged);
            }
            AckDecision::Defer {
                delay,
                visibility_secs,
                reason,
            } => {
                self.record_failure(&delivery.message, &reason);
                info!(
                    message_id = %delivery.message.id,
                    receive_count = delivery.message.receive_count,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Deferring message for retry"
                );
                self.change_visibility(&delivery.message, visibility_secs, "defer").await;
                self.stats.record_deferred();
                delivery.transition(DeliveryState::Deferred);
            }
            AckDecision::DeadLetter { reason } => {
                self.record_failure(&delivery.message, &reason);
                let state = self.dead_letter(&delivery.message, reason).await;
                delivery.transition(state);
            }
        }
        delivery.state
    }

    /// Deletes a delivery the dedup store already saw processed.
    pub async fn acknowledge_duplicate(&self, mut delivery: Delivery) -> DeliveryState {
        info!(
            message_id = %delivery.message.id,
            receive_count = delivery.message.receive_count,
            "Skipping already processed message"
        );
        self.delete(&delivery.message, "acknowledge duplicate").await;
        self.stats.record_duplicate_skipped();
        delivery.transition(DeliveryState::Acknowledged);
        delivery.state
    }

    /// Puts back a delivery whose message id is being processed right now
    /// by another task.
    pub async fn defer_duplicate(&self, mut delivery: Delivery, seconds: u32) -> DeliveryState {
        debug!(
            message_id = %delivery.message.id,
            "Same message already in progress, deferring"
        );
        self.change_visibility(&delivery.message, seconds, "defer duplicate").await;
        self.stats.record_duplicate_deferred();
        delivery.transition(DeliveryState::Deferred);
        delivery.state
    }

    /// Makes an unacknowledged delivery visible again right away. False when
    /// the queue did not take it back (stale handle or transport error).
    pub async fn return_to_queue(&self, handle: &ReceiptHandle, message_id: &MessageId) -> bool {
        let returned = self.release(handle, message_id, "return on shutdown").await;
        if returned {
            info!(message_id = %message_id, "Returned in-flight message to queue");
            self.stats.record_returned();
        }
        returned
    }

    /// Puts back a FIFO group member that never reached a handler because an
    /// earlier message of its group did not complete.
    pub async fn requeue(&self, message: &Message) -> bool {
        let requeued = self
            .release(&message.receipt_handle, &message.id, "requeue group member")
            .await;
        if requeued {
            debug!(
                message_id = %message.id,
                group_id = message.group_id.as_deref().unwrap_or("-"),
                "Requeued group member behind a deferred message"
            );
            self.stats.record_requeued();
        }
        requeued
    }

    async fn release(
        &self,
        handle: &ReceiptHandle,
        message_id: &MessageId,
        action: &'static str,
    ) -> bool {
        match self.queue.change_visibility(handle, 0).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => {
                debug!(message_id = %message_id, action, "Handle already gone");
                self.stats.record_stale_handle();
                false
            }
            Err(e) => {
                warn!(message_id = %message_id, action, error = %e, "Failed to release message");
                self.stats.record_ack_error();
                false
            }
        }
    }

    /// Recorded failures for a message id, oldest first.
    pub fn failure_history(&self, message_id: &MessageId) -> Vec<FailureRecord> {
        self.lock_history().get(message_id).cloned().unwrap_or_default()
    }

    async fn dead_letter(&self, message: &Message, reason: String) -> DeliveryState {
        let history = self.failure_history(&message.id);
        let entry = DeadLetterEntry::new(message.clone(), history, reason, self.clock.now());

        if let Err(e) = self.sink.write(&entry).await {
            let secs = self.backoff.as_visibility_seconds(message.attempt());
            error!(
                message_id = %message.id,
                error = %e,
                retry_in_secs = secs,
                "Dead-letter write failed, leaving message on queue"
            );
            self.stats.record_dead_letter_error();
            self.change_visibility(message, secs, "defer after dead-letter failure").await;
            self.stats.record_deferred();
            return DeliveryState::Deferred;
        }

        warn!(
            message_id = %message.id,
            receive_count = message.receive_count,
            attempts = entry.attempts(),
            reason = %entry.final_reason,
            "Message dead-lettered"
        );
        self.delete(message, "dead-letter delete").await;
        self.clear_history(&message.id);
        self.stats.record_dead_lettered();
        DeliveryState::DeadLettered
    }

    async fn delete(&self, message: &Message, action: &'static str) {
        let result = self.queue.delete(&message.receipt_handle).await;
        self.report(message, action, result);
    }

    async fn change_visibility(&self, message: &Message, seconds: u32, action: &'static str) {
        let result = self
            .queue
            .change_visibility(&message.receipt_handle, seconds)
            .await;
        self.report(message, action, result);
    }

    fn report(&self, message: &Message, action: &'static str, result: Result<(), QueueError>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                // visibility timeout expired while processing; the message is someone else's now
                warn!(message_id = %message.id, action, error = %e, "Stale receipt handle");
                self.stats.record_stale_handle();
            }
            Err(e) => {
                error!(message_id = %message.id, action, error = %e, "Acknowledgement failed");
                self.stats.record_ack_error();
            }
        }
    }

    fn record_failure(&self, message: &Message, reason: &str) {
        let record = FailureRecord::new(self.clock.now(), reason, message.receive_count);
        let mut history = self.lock_history();
        if !history.contains_key(&message.id) && history.len() >= self.history_capacity {
            evict_oldest(&mut history);
        }
        history.entry(message.id.clone()).or_default().push(record);
    }

    fn clear_history(&self, message_id: &MessageId) {
        self.lock_history().remove(message_id);
    }

    fn lock_history(&self) -> MutexGuard<'_, HashMap<MessageId, Vec<FailureRecord>>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn evict_oldest(history: &mut HashMap<MessageId, Vec<FailureRecord>>) {
    let oldest = history
        .iter()
        .filter_map(|(id, records)| records.last().map(|r| (id, r.at)))
        .min_by_key(|(_, at)| *at)
        .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
        history.remove(&id);
    }
}
