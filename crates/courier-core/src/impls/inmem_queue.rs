//! In-memory SQS emulator.
//!
//! Behaves like a single SQS queue closely enough to drive the consumer end
//! to end without credentials:
//! - every delivery gets a fresh receipt handle; older handles go stale
//! - received messages stay invisible for the visibility timeout
//! - receive counts grow with every delivery
//! - long polls wake up on send and when a message becomes visible again
//! - FIFO groups: a group with an invisible message is not delivered again
//!   until that message is deleted or visible
//!
//! Faults can be injected per operation, and a handful of inspection helpers
//! expose what happened to the messages.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::trace;

use crate::domain::errors::QueueError;
use crate::domain::ids::{MessageId, ReceiptHandle};
use crate::domain::message::{Message, OutgoingMessage};
use crate::ports::{
    Clock, IdGenerator, QueueClient, SystemClock, UlidGenerator, clamp_batch_size,
    clamp_visibility, clamp_wait_time,
};

/// Operation a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Receive,
    Delete,
    ChangeVisibility,
    Send,
}

/// Point-in-time view of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessageView {
    pub id: MessageId,
    pub body: String,
    pub receive_count: u32,
    pub visible: bool,
    pub group_id: Option<String>,
}

/// Operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InMemoryQueueStats {
    pub sent: u64,
    pub delivered: u64,
    pub deleted: u64,
    pub visibility_changes: u64,
    pub receive_calls: u64,
}

struct StoredMessage {
    id: MessageId,
    body: String,
    attributes: BTreeMap<String, String>,
    group_id: Option<String>,
    sent_at: DateTime<Utc>,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<ReceiptHandle>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        now >= self.visible_at
    }
}

#[derive(Default)]
struct QueueState {
    /// Keyed by send sequence so iteration is delivery order.
    messages: BTreeMap<u64, StoredMessage>,
    /// Currently valid receipt handles.
    receipts: HashMap<ReceiptHandle, u64>,
    /// FIFO deduplication ids seen so far.
    dedup_ids: HashMap<String, MessageId>,
    faults: HashMap<Operation, VecDeque<QueueError>>,
    deleted: Vec<MessageId>,
    next_seq: u64,
    stats: InMemoryQueueStats,
}

impl QueueState {
    fn take_fault(&mut self, op: Operation) -> Option<QueueError> {
        self.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn insert(&mut self, message: StoredMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.insert(seq, message);
        self.stats.sent += 1;
    }

    /// Resolves a handle to its message, treating an elapsed visibility
    /// timeout as expiry.
    fn resolve(&mut self, handle: &ReceiptHandle, now: Instant) -> Result<u64, QueueError> {
        let not_found = || QueueError::NotFound(handle.to_string());
        let seq = *self.receipts.get(handle).ok_or_else(not_found)?;
        let expired = match self.messages.get(&seq) {
            Some(m) => m.is_visible(now),
            None => true,
        };
        if expired {
            self.receipts.remove(handle);
            if let Some(m) = self.messages.get_mut(&seq) {
                m.receipt = None;
            }
            return Err(not_found());
        }
        Ok(seq)
    }

    fn collect(
        &mut self,
        max: usize,
        now: Instant,
        visibility: Duration,
        ids: &dyn IdGenerator,
    ) -> Vec<Message> {
        let blocked: HashSet<String> = self
            .messages
            .values()
            .filter(|m| !m.is_visible(now))
            .filter_map(|m| m.group_id.clone())
            .collect();

        let ready: Vec<u64> = self
            .messages
            .iter()
            .filter(|(_, m)| m.is_visible(now))
            .filter(|(_, m)| m.group_id.as_ref().is_none_or(|g| !blocked.contains(g)))
            .map(|(seq, _)| *seq)
            .take(max)
            .collect();

        let mut batch = Vec::with_capacity(ready.len());
        for seq in ready {
            let handle = ids.generate_receipt_handle();
            let Some(stored) = self.messages.get_mut(&seq) else {
                continue;
            };
            if let Some(old) = stored.receipt.replace(handle.clone()) {
                self.receipts.remove(&old);
            }
            stored.receive_count += 1;
            stored.visible_at = now + visibility;
            self.receipts.insert(handle.clone(), seq);
            self.stats.delivered += 1;

            batch.push(Message {
                id: stored.id.clone(),
                body: stored.body.clone(),
                attributes: stored.attributes.clone(),
                receipt_handle: handle,
                receive_count: stored.receive_count,
                group_id: stored.group_id.clone(),
                sent_at: Some(stored.sent_at),
            });
        }
        batch
    }

    fn next_visible_at(&self, now: Instant) -> Option<Instant> {
        self.messages
            .values()
            .filter(|m| !m.is_visible(now))
            .map(|m| m.visible_at)
            .min()
    }
}

/// In-process stand-in for an SQS queue.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            clock: Arc::new(SystemClock),
            visibility_timeout: Duration::from_secs(30),
        }
    }

    /// Visibility timeout applied to received messages (queue default).
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stores a message under an existing id, the way a duplicate delivery
    /// of an at-least-once queue looks to a consumer.
    pub async fn send_with_id(&self, id: MessageId, message: OutgoingMessage) {
        let stored = self.stored(id, message);
        self.state.lock().await.insert(stored);
        self.notify.notify_waiters();
    }

    /// The next call of `op` fails with `error`. Multiple faults queue up.
    pub async fn inject_fault(&self, op: Operation, error: QueueError) {
        let mut state = self.state.lock().await;
        state.faults.entry(op).or_default().push_back(error);
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    /// Messages still stored, in send order.
    pub async fn messages(&self) -> Vec<StoredMessageView> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .messages
            .values()
            .map(|m| StoredMessageView {
                id: m.id.clone(),
                body: m.body.clone(),
                receive_count: m.receive_count,
                visible: m.is_visible(now),
                group_id: m.group_id.clone(),
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn visible_len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state.messages.values().filter(|m| m.is_visible(now)).count()
    }

    pub async fn in_flight_len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state.messages.values().filter(|m| !m.is_visible(now)).count()
    }

    /// Ids of deleted messages, in deletion order.
    pub async fn deleted_ids(&self) -> Vec<MessageId> {
        self.state.lock().await.deleted.clone()
    }

    pub async fn stats(&self) -> InMemoryQueueStats {
        self.state.lock().await.stats
    }

    /// Drains every stored message body without delivering it.
    pub async fn drain_bodies(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        state.receipts.clear();
        std::mem::take(&mut state.messages)
            .into_values()
            .map(|m| m.body)
            .collect()
    }

    fn stored(&self, id: MessageId, message: OutgoingMessage) -> StoredMessage {
        StoredMessage {
            id,
            body: message.body,
            attributes: message.attributes,
            group_id: message.group_id,
            sent_at: self.clock.now(),
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn receive_batch(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        let max = clamp_batch_size(max_messages);
        let deadline = Instant::now() + clamp_wait_time(wait_time);
        let mut counted = false;

        loop {
            // Register interest before looking, so a send between the check
            // and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                if !counted {
                    state.stats.receive_calls += 1;
                    counted = true;
                    if let Some(err) = state.take_fault(Operation::Receive) {
                        return Err(err);
                    }
                }

                let now = Instant::now();
                let batch = state.collect(max, now, self.visibility_timeout, self.ids.as_ref());
                if !batch.is_empty() || now >= deadline {
                    trace!(count = batch.len(), "in-memory receive");
                    return Ok(batch);
                }
                state
                    .next_visible_at(now)
                    .map_or(deadline, |t| t.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt_handle: &ReceiptHandle) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_fault(Operation::Delete) {
            return Err(err);
        }
        let seq = state.resolve(receipt_handle, Instant::now())?;
        state.receipts.remove(receipt_handle);
        if let Some(m) = state.messages.remove(&seq) {
            state.deleted.push(m.id);
            state.stats.deleted += 1;
        }
        drop(state);
        // a FIFO group may have been unblocked
        self.notify.notify_waiters();
        Ok(())
    }

    async fn change_visibility(
        &self,
        receipt_handle: &ReceiptHandle,
        seconds: u32,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_fault(Operation::ChangeVisibility) {
            return Err(err);
        }
        let now = Instant::now();
        let seq = state.resolve(receipt_handle, now)?;
        let seconds = clamp_visibility(seconds);
        if let Some(m) = state.messages.get_mut(&seq) {
            m.visible_at = now + Duration::from_secs(u64::from(seconds));
        }
        if seconds == 0 {
            // visible again: the handle is done
            state.receipts.remove(receipt_handle);
            if let Some(m) = state.messages.get_mut(&seq) {
                m.receipt = None;
            }
        }
        state.stats.visibility_changes += 1;
        drop(state);
        if seconds == 0 {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<MessageId, QueueError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_fault(Operation::Send) {
            return Err(err);
        }
        if let Some(dedup_id) = &message.deduplication_id
            && let Some(existing) = state.dedup_ids.get(dedup_id)
        {
            return Ok(existing.clone());
        }

        let id = self.ids.generate_message_id();
        if let Some(dedup_id) = &message.deduplication_id {
            state.dedup_ids.insert(dedup_id.clone(), id.clone());
        }
        let stored = self.stored(id.clone(), message);
        state.insert(stored);
        drop(state);

        self.notify.notify_waiters();
        Ok(id)
    }
}
