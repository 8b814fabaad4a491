//! End-to-end consumer behaviour against the in-memory queue.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use courier_core::config::ReceivePolicy;
use courier_core::domain::{Message, MessageId, OutgoingMessage, ProcessingOutcome};
use courier_core::domain::errors::QueueError;
use courier_core::impls::Operation;
use courier_core::ports::QueueClient;
use courier_core::typed::{Handler, Matcher, Payload, PayloadCodec, handler_fn};

use support::{Harness, Log, config, eventually};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InvoiceIssued {
    invoice_id: u64,
}

impl Payload for InvoiceIssued {
    const TYPE: &'static str = "billing.invoice_issued.v1";
}

struct RecordInvoices(Log<u64>);

#[async_trait]
impl Handler<InvoiceIssued> for RecordInvoices {
    async fn handle(&self, invoice: InvoiceIssued, _message: &Message) -> ProcessingOutcome {
        self.0.push(invoice.invoice_id);
        ProcessingOutcome::success()
    }
}

#[tokio::test(start_paused = true)]
async fn three_successful_messages_are_each_acknowledged_once() {
    let h = Harness::new();
    let seen = Log::default();
    let consumer = h
        .builder(config(ReceivePolicy::Overlap))
        .register_typed::<InvoiceIssued, _>(RecordInvoices(seen.clone()))
        .unwrap()
        .expect_types(&[InvoiceIssued::TYPE])
        .build()
        .unwrap();

    for invoice_id in 1..=3 {
        let message = PayloadCodec::encode(&InvoiceIssued { invoice_id }).unwrap();
        h.queue.send(message).await.unwrap();
    }

    let handle = consumer.start();
    eventually("queue drained", || async { h.queue.is_empty().await }).await;
    let report = handle.shutdown().await;

    let mut ids = seen.snapshot();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(h.queue.stats().await.deleted, 3);
    assert!(h.dead_letters.is_empty().await);
    assert_eq!(consumer.stats().acknowledged, 3);
    assert_eq!(report.returned, 0);
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_is_dead_lettered_without_retry() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let consumer = h
        .builder(config(ReceivePolicy::Overlap))
        .register(
            Matcher::Any,
            handler_fn(move |_m: Message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ProcessingOutcome::fatal("schema violation")
                }
            }),
        )
        .build()
        .unwrap();

    let id = h.queue.send(OutgoingMessage::new("{}")).await.unwrap();
    let handle = consumer.start();
    eventually("dead letter written", || async { h.dead_letters.len().await == 1 }).await;
    // no redelivery even after the backoff window
    tokio::time::sleep(Duration::from_secs(10)).await;
    handle.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(h.queue.is_empty().await);
    let entry = &h.dead_letters.entries().await[0];
    assert_eq!(entry.message.id, id);
    assert_eq!(entry.final_reason, "schema violation");
    assert_eq!(entry.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn retryable_twice_then_success_is_acknowledged_on_third_attempt() {
    let h = Harness::new();
    let attempts = Log::default();
    let seen = attempts.clone();
    let consumer = h
        .builder(config(ReceivePolicy::Overlap))
        .register(
            Matcher::Any,
            handler_fn(move |m: Message| {
                let seen = seen.clone();
                async move {
                    seen.push(m.receive_count);
                    if m.receive_count < 3 {
                        ProcessingOutcome::retryable("downstream unavailable")
                    } else {
                        ProcessingOutcome::success()
                    }
                }
            }),
        )
        .build()
        .unwrap();

    h.queue.send(OutgoingMessage::new("work")).await.unwrap();
    let handle = consumer.start();
    eventually("message acknowledged", || async { h.queue.is_empty().await }).await;
    handle.shutdown().await;

    assert_eq!(attempts.snapshot(), vec![1, 2, 3]);
    assert!(h.dead_letters.is_empty().await);
    let stats = consumer.stats();
    assert_eq!(stats.deferred, 2);
    assert_eq!(stats.acknowledged, 1);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_max_retries_and_dead_letter() {
    let h = Harness::new();
    let attempts = Log::default();
    let seen = attempts.clone();
    let consumer = h
        .builder(config(ReceivePolicy::Overlap))
        .register(
            Matcher::Any,
            handler_fn(move |m: Message| {
                let seen = seen.clone();
                async move {
                    seen.push(m.receive_count);
                    ProcessingOutcome::retryable(format!("attempt {} failed", m.receive_count))
                }
            }),
        )
        .build()
        .unwrap();

    h.queue.send(OutgoingMessage::new("poison")).await.unwrap();
    let handle = consumer.start();
    eventually("dead letter written", || async { h.dead_letters.len().await == 1 }).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    handle.shutdown().await;

    assert_eq!(attempts.snapshot(), vec![1, 2, 3]);
    assert!(h.queue.is_empty().await);
    let entry = &h.dead_letters.entries().await[0];
    let reasons: Vec<_> = entry.failure_history.iter().map(|f| f.reason.clone()).collect();
    assert_eq!(reasons.len(), 3);
    assert_eq!(reasons[0], "attempt 1 failed");
    assert_eq!(reasons[1], "attempt 2 failed");
    assert!(entry.final_reason.starts_with("max retries reached (3/3)"));
}

#[tokio::test(start_paused = true)]
async fn duplicate_delivery_runs_the_handler_once() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let consumer = h
        .builder(config(ReceivePolicy::Overlap))
        .register(
            Matcher::Any,
            handler_fn(move |_m: Message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    ProcessingOutcome::success()
                }
            }),
        )
        .build()
        .unwrap();

    let id = MessageId::new("msg-duplicate");
    h.queue.send_with_id(id.clone(), OutgoingMessage::new("a")).await;
    h.queue.send_with_id(id.clone(), OutgoingMessage::new("a")).await;

    let handle = consumer.start();
    eventually("both copies removed", || async { h.queue.is_empty().await }).await;
    handle.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.queue.deleted_ids().await, vec![id.clone(), id]);
    let stats = consumer.stats();
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.duplicates_skipped, 1);
}

#[tokio::test(start_paused = true)]
async fn unroutable_message_is_dead_lettered() {
    let h = Harness::new();
    let consumer = h
        .builder(config(ReceivePolicy::Overlap))
        .register(
            Matcher::body_prefix("ping"),
            handler_fn(|_m: Message| async { ProcessingOutcome::success() }),
        )
        .build()
        .unwrap();

    h.queue
        .send(OutgoingMessage::new("pong").with_attribute("message_type", "unknown.v1"))
        .await
        .unwrap();
    let handle = consumer.start();
    eventually("dead letter written", || async { h.dead_letters.len().await == 1 }).await;
    handle.shutdown().await;

    let entry = &h.dead_letters.entries().await[0];
    assert!(entry.final_reason.starts_with("no handler matched message"));
    assert!(entry.final_reason.contains("unknown.v1"));
    assert!(h.queue.is_empty().await);
}

/// Max number of handlers seen running at once.
async fn peak_concurrency(policy: ReceivePolicy, workers: usize) -> usize {
    let h = Harness::new();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak.clone());

    let mut cfg = config(policy);
    cfg.workers = workers;
    cfg.max_concurrent_messages = 4;
    cfg.max_messages_per_poll = 2;
    let consumer = h
        .builder(cfg)
        .register(
            Matcher::Any,
            handler_fn(move |_m: Message| {
                let (active, peak) = (a.clone(), p.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    ProcessingOutcome::success()
                }
            }),
        )
        .build()
        .unwrap();

    for i in 0..8 {
        h.queue.send(OutgoingMessage::new(format!("m{i}"))).await.unwrap();
    }
    let handle = consumer.start();
    eventually("queue drained", || async { h.queue.is_empty().await }).await;
    handle.shutdown().await;
    peak.load(Ordering::SeqCst)
}

#[tokio::test(start_paused = true)]
async fn drain_batch_never_overlaps_batches() {
    assert_eq!(peak_concurrency(ReceivePolicy::DrainBatch, 1).await, 2);
}

#[tokio::test(start_paused = true)]
async fn overlap_receives_while_a_batch_is_running() {
    assert_eq!(peak_concurrency(ReceivePolicy::Overlap, 1).await, 4);
}

#[tokio::test(start_paused = true)]
async fn workers_share_one_concurrency_limit() {
    // three workers, four permits between them
    assert_eq!(peak_concurrency(ReceivePolicy::Overlap, 3).await, 4);
    assert!(peak_concurrency(ReceivePolicy::DrainBatch, 3).await <= 4);
}

#[tokio::test(start_paused = true)]
async fn fifo_groups_are_processed_in_order() {
    let h = Harness::new();
    let order = Log::default();
    let seen = order.clone();
    let consumer = h
        .builder(config(ReceivePolicy::Overlap))
        .register(
            Matcher::Any,
            handler_fn(move |m: Message| {
                let seen = seen.clone();
                async move {
                    // later messages finish faster, so only sequencing keeps them in order
                    let delay = 500 - 50 * m.body[1..].parse::<u64>().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    seen.push((m.group_id.clone().unwrap_or_default(), m.body.clone()));
                    ProcessingOutcome::success()
                }
            }),
        )
        .build()
        .unwrap();

    for i in 0..5 {
        h.queue
            .send(OutgoingMessage::new(format!("a{i}")).with_group("group-a"))
            .await
            .unwrap();
        h.queue
            .send(OutgoingMessage::new(format!("b{i}")).with_group("group-b"))
            .await
            .unwrap();
    }

    let handle = consumer.start();
    eventually("queue drained", || async { h.queue.is_empty().await }).await;
    handle.shutdown().await;

    let per_group = |group: &str| -> Vec<String> {
        order
            .snapshot()
            .into_iter()
            .filter(|(g, _)| g == group)
            .map(|(_, body)| body)
            .collect()
    };
    assert_eq!(per_group("group-a"), vec!["a0", "a1", "a2", "a3", "a4"]);
    assert_eq!(per_group("group-b"), vec!["b0", "b1", "b2", "b3", "b4"]);
}

#[tokio::test(start_paused = true)]
async fn deferred_message_holds_back_the_rest_of_its_group() {
    let h = Harness::new();
    let order = Log::default();
    let seen = order.clone();
    let consumer = h
        .builder(config(ReceivePolicy::Overlap))
        .register(
            Matcher::Any,
            handler_fn(move |m: Message| {
                let seen = seen.clone();
                async move {
                    seen.push(m.body.clone());
                    if m.body == "a0" && m.attempt() == 1 {
                        return ProcessingOutcome::retryable("not yet");
                    }
                    ProcessingOutcome::success()
                }
            }),
        )
        .build()
        .unwrap();

    for body in ["a0", "a1", "a2"] {
        h.queue
            .send(OutgoingMessage::new(body).with_group("g"))
            .await
            .unwrap();
    }

    let handle = consumer.start();
    eventually("queue drained", || async { h.queue.is_empty().await }).await;
    handle.shutdown().await;

    assert_eq!(order.snapshot(), vec!["a0", "a0", "a1", "a2"]);
    let stats = consumer.stats();
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.deferred, 1);
    assert_eq!(stats.acknowledged, 3);
}

#[tokio::test(start_paused = true)]
async fn receive_errors_back_off_and_recover() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let consumer = h
        .builder(config(ReceivePolicy::Overlap))
        .register(
            Matcher::Any,
            handler_fn(move |_m: Message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ProcessingOutcome::success()
                }
            }),
        )
        .build()
        .unwrap();

    h.queue
        .inject_fault(Operation::Receive, QueueError::Transport("connection reset".into()))
        .await;
    h.queue
        .inject_fault(Operation::Receive, QueueError::Throttling("slow down".into()))
        .await;
    h.queue.send(OutgoingMessage::new("after outage")).await.unwrap();

    let handle = consumer.start();
    eventually("message processed", || async { h.queue.is_empty().await }).await;
    handle.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(consumer.stats().receive_errors, 2);
}

#[tokio::test(start_paused = true)]
async fn batch_handler_gets_the_received_batch() {
    let h = Harness::new();
    let sizes = Log::default();
    let seen = sizes.clone();
    let consumer = h
        .builder(config(ReceivePolicy::Overlap))
        .register_batch(
            Matcher::Any,
            courier_core::typed::batch_fn(move |batch: Vec<Message>| {
                let seen = seen.clone();
                async move {
                    seen.push(batch.len());
                    vec![ProcessingOutcome::success(); batch.len()]
                }
            }),
        )
        .build()
        .unwrap();

    for i in 0..10 {
        h.queue.send(OutgoingMessage::new(format!("m{i}"))).await.unwrap();
    }
    let handle = consumer.start();
    eventually("queue drained", || async { h.queue.is_empty().await }).await;
    handle.shutdown().await;

    assert_eq!(sizes.snapshot(), vec![10]);
}
