//! WorkerLoop - 受信ループ
//!
//! # フロー
//! 1. shutdown 確認
//! 2. permit を 1 つ待ち、空いている分だけ追加で確保（最大 max_messages_per_poll）
//! 3. receive_batch(確保した permit 数, poll_timeout) を shutdown と競合
//! 4. メッセージを job に分けて JoinSet へ spawn（1 メッセージ = 1 permit）
//! 5. DrainBatch なら batch 全体の完了を待つ
//!
//! # shutdown
//! - 新しい receive はしない
//! - in-flight の job を grace まで待つ
//! - grace を過ぎたら abort し、未 ack の receipt handle を visibility 0 で返却

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::dispatcher::Dispatcher;
use super::inflight::InFlightTracker;
use super::status::ConsumerStats;
use crate::config::ReceivePolicy;
use crate::domain::message::Message;
use crate::domain::state::DeliveryState;
use crate::ports::QueueClient;

const POLL_ERROR_BACKOFF_BASE: Duration = Duration::from_secs(1);
const POLL_ERROR_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// `Some(grace)` once shutdown has been requested.
pub(crate) type ShutdownSignal = watch::Receiver<Option<Duration>>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopSettings {
    pub max_messages_per_poll: usize,
    pub poll_timeout: Duration,
    pub receive_policy: ReceivePolicy,
    /// Used when the shutdown sender goes away without naming a grace period.
    pub default_grace: Duration,
}

/// What one worker did during shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WorkerReport {
    /// Messages that finished processing within the grace period.
    pub drained: usize,
    /// Messages returned to the queue unacknowledged.
    pub returned: usize,
}

pub(crate) struct WorkerLoop {
    worker_id: usize,
    queue: Arc<dyn QueueClient>,
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
    tracker: Arc<InFlightTracker>,
    stats: Arc<ConsumerStats>,
    settings: LoopSettings,
    shutdown: ShutdownSignal,
}

impl WorkerLoop {
    pub fn new(
        worker_id: usize,
        queue: Arc<dyn QueueClient>,
        dispatcher: Arc<Dispatcher>,
        permits: Arc<Semaphore>,
        stats: Arc<ConsumerStats>,
        settings: LoopSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            worker_id,
            queue,
            dispatcher,
            permits,
            tracker: Arc::new(InFlightTracker::new()),
            stats,
            settings,
            shutdown,
        }
    }

    pub async fn run(mut self) -> WorkerReport {
        let worker_id = self.worker_id;
        info!(
            worker_id,
            max_messages_per_poll = self.settings.max_messages_per_poll,
            poll_timeout_secs = self.settings.poll_timeout.as_secs(),
            receive_policy = %self.settings.receive_policy,
            "Worker started"
        );

        let mut inflight: JoinSet<usize> = JoinSet::new();
        let mut consecutive_poll_errors: u32 = 0;

        loop {
            while let Some(result) = inflight.try_join_next() {
                log_join(worker_id, result.map(|_| ()));
            }

            if is_shutdown(&self.shutdown) {
                break;
            }

            let permits = tokio::select! {
                permits = reserve_permits(&self.permits, self.settings.max_messages_per_poll) => permits,
                _ = wait_for_shutdown(&mut self.shutdown) => break,
            };
            let Some(permits) = permits else {
                error!(worker_id, "Semaphore closed, stopping worker");
                break;
            };

            let received = tokio::select! {
                result = self.queue.receive_batch(permits.len(), self.settings.poll_timeout) => result,
                _ = wait_for_shutdown(&mut self.shutdown) => break,
            };

            let messages = match received {
                Ok(messages) => {
                    consecutive_poll_errors = 0;
                    messages
                }
                Err(e) => {
                    drop(permits);
                    consecutive_poll_errors = consecutive_poll_errors.saturating_add(1);
                    self.stats.record_receive_error();
                    let backoff = poll_error_backoff(consecutive_poll_errors);
                    error!(
                        worker_id,
                        error = %e,
                        consecutive_errors = consecutive_poll_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        "Failed to receive messages, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => continue,
                        _ = wait_for_shutdown(&mut self.shutdown) => break,
                    }
                }
            };
            if messages.is_empty() {
                continue;
            }
            debug!(worker_id, message_count = messages.len(), "Received messages");

            self.spawn_jobs(&mut inflight, messages, permits);

            if self.settings.receive_policy == ReceivePolicy::DrainBatch {
                tokio::select! {
                    _ = join_all(worker_id, &mut inflight) => {}
                    _ = wait_for_shutdown(&mut self.shutdown) => break,
                }
            }
        }

        self.drain(inflight).await
    }

    fn spawn_jobs(
        &self,
        inflight: &mut JoinSet<usize>,
        messages: Vec<Message>,
        mut permits: Vec<OwnedSemaphorePermit>,
    ) {
        for message in &messages {
            self.tracker
                .insert(message.receipt_handle.clone(), message.id.clone());
        }
        for job in plan_jobs(&self.dispatcher, messages) {
            let take = job.len().min(permits.len());
            let job_permits: Vec<_> = permits.drain(..take).collect();
            let dispatcher = Arc::clone(&self.dispatcher);
            let tracker = Arc::clone(&self.tracker);
            let worker_id = self.worker_id;

            inflight.spawn(async move {
                let size = job.len();
                let result = AssertUnwindSafe(job.run(&dispatcher, &tracker, job_permits))
                    .catch_unwind()
                    .await;
                if result.is_err() {
                    // the dispatcher catches handler panics; this is our own code
                    error!(worker_id, "Job panicked outside the handler");
                }
                size
            });
        }
        // permits not matched by a message (short batch) go back to the pool here
    }

    async fn drain(self, mut inflight: JoinSet<usize>) -> WorkerReport {
        let worker_id = self.worker_id;
        let grace = (*self.shutdown.borrow()).unwrap_or(self.settings.default_grace);
        let mut report = WorkerReport::default();

        if !inflight.is_empty() {
            info!(
                worker_id,
                count = inflight.len(),
                in_flight = self.tracker.len(),
                grace_ms = grace.as_millis() as u64,
                "Draining in-flight messages before shutdown"
            );
            let drained = tokio::time::timeout(grace, async {
                while let Some(result) = inflight.join_next().await {
                    if let Ok(size) = &result {
                        report.drained += size;
                    }
                    log_join(worker_id, result.map(|_| ()));
                }
            })
            .await;

            if drained.is_err() {
                warn!(
                    worker_id,
                    remaining = inflight.len(),
                    "Shutdown grace elapsed, aborting in-flight messages"
                );
                inflight.abort_all();
                while inflight.join_next().await.is_some() {}
            }
        }

        let coordinator = self.dispatcher.coordinator();
        for entry in self.tracker.drain() {
            if coordinator
                .return_to_queue(&entry.handle, &entry.message_id)
                .await
            {
                report.returned += 1;
            }
        }

        info!(
            worker_id,
            drained = report.drained,
            returned = report.returned,
            "Worker stopped"
        );
        report
    }
}

/// A unit of work spawned onto the JoinSet.
#[derive(Debug)]
enum Job {
    Single(Message),
    /// Same FIFO group, processed in delivery order. A deferred message puts
    /// the members after it back unprocessed.
    Group(Vec<Message>),
    /// Same batch route, one handler call.
    Batch(usize, Vec<Message>),
}

impl Job {
    fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Group(messages) | Self::Batch(_, messages) => messages.len(),
        }
    }

    async fn run(
        self,
        dispatcher: &Dispatcher,
        tracker: &InFlightTracker,
        mut permits: Vec<OwnedSemaphorePermit>,
    ) {
        match self {
            Self::Single(message) => {
                let handle = message.receipt_handle.clone();
                dispatcher.process_one(message).await;
                tracker.remove(&handle);
            }
            Self::Group(messages) => {
                let mut pending = messages.into_iter();
                for message in pending.by_ref() {
                    let handle = message.receipt_handle.clone();
                    let state = dispatcher.process_one(message).await;
                    tracker.remove(&handle);
                    // one permit per message; the rest of the group keeps its own
                    permits.pop();
                    if state == DeliveryState::Deferred {
                        // 後続は先頭が再配信されるまで待つ
                        break;
                    }
                }
                for message in pending {
                    dispatcher.coordinator().requeue(&message).await;
                    tracker.remove(&message.receipt_handle);
                    permits.pop();
                }
            }
            Self::Batch(route, messages) => {
                let handles: Vec<_> = messages.iter().map(|m| m.receipt_handle.clone()).collect();
                dispatcher.process_batch(route, messages).await;
                for handle in &handles {
                    tracker.remove(handle);
                }
            }
        }
        drop(permits);
    }
}

/// Splits a received batch into jobs, keeping first-seen order.
///
/// - messages with a `group_id` go to one sequential job per group
/// - other messages routed to a batch route go to one job per route
/// - everything else is its own job
fn plan_jobs(dispatcher: &Dispatcher, messages: Vec<Message>) -> Vec<Job> {
    #[derive(Clone, PartialEq, Eq, Hash)]
    enum Key {
        Group(String),
        Route(usize),
    }

    let registry = dispatcher.registry();
    let mut jobs: Vec<Job> = Vec::new();
    let mut index: HashMap<Key, usize> = HashMap::new();

    for message in messages {
        let batch_route = registry
            .route_for(&message)
            .filter(|&route| registry.is_batch_route(route));
        let key = if let Some(group) = &message.group_id {
            Key::Group(group.clone())
        } else if let Some(route) = batch_route {
            Key::Route(route)
        } else {
            jobs.push(Job::Single(message));
            continue;
        };
        match index.get(&key) {
            Some(&i) => match &mut jobs[i] {
                Job::Group(batch) | Job::Batch(_, batch) => batch.push(message),
                Job::Single(_) => {}
            },
            None => {
                index.insert(key.clone(), jobs.len());
                jobs.push(match key {
                    Key::Group(_) => Job::Group(vec![message]),
                    Key::Route(route) => Job::Batch(route, vec![message]),
                });
            }
        }
    }
    jobs
}

/// Waits for one permit, then takes whatever else is free up to `limit`.
/// `None` if the semaphore was closed.
async fn reserve_permits(
    semaphore: &Arc<Semaphore>,
    limit: usize,
) -> Option<Vec<OwnedSemaphorePermit>> {
    let first = Arc::clone(semaphore).acquire_owned().await.ok()?;
    let mut permits = vec![first];
    while permits.len() < limit {
        match Arc::clone(semaphore).try_acquire_owned() {
            Ok(permit) => permits.push(permit),
            Err(_) => break,
        }
    }
    Some(permits)
}

fn is_shutdown(shutdown: &ShutdownSignal) -> bool {
    shutdown.borrow().is_some() || shutdown.has_changed().is_err()
}

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut ShutdownSignal) {
    let _ = shutdown.wait_for(Option::is_some).await;
}

async fn join_all(worker_id: usize, inflight: &mut JoinSet<usize>) {
    while let Some(result) = inflight.join_next().await {
        log_join(worker_id, result.map(|_| ()));
    }
}

fn log_join(worker_id: usize, result: Result<(), JoinError>) {
    if let Err(e) = result
        && !e.is_cancelled()
    {
        warn!(worker_id, error = %e, "In-flight task failed");
    }
}

/// 1s, 2s, 4s, ... capped at 30s.
fn poll_error_backoff(consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(16);
    POLL_ERROR_BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(POLL_ERROR_BACKOFF_CAP)
}
