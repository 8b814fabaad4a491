#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_core::app::ConsumerBuilder;
use courier_core::config::{ConsumerConfig, ReceivePolicy};
use courier_core::impls::{InMemoryDeadLetterSink, InMemoryQueue};

pub struct Harness {
    pub queue: InMemoryQueue,
    pub dead_letters: Arc<InMemoryDeadLetterSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            queue: InMemoryQueue::new().with_visibility_timeout(Duration::from_secs(30)),
            dead_letters: Arc::new(InMemoryDeadLetterSink::new()),
        }
    }

    pub fn builder(&self, config: ConsumerConfig) -> ConsumerBuilder {
        ConsumerBuilder::new(config)
            .queue(Arc::new(self.queue.clone()))
            .dead_letter_sink(self.dead_letters.clone())
    }
}

/// Short timings so paused-clock tests finish quickly.
pub fn config(policy: ReceivePolicy) -> ConsumerConfig {
    ConsumerConfig {
        poll_timeout_secs: 1,
        max_retries: 3,
        backoff_base_ms: 1_000,
        backoff_cap_ms: 4_000,
        shutdown_grace_secs: 5,
        receive_policy: policy,
        ..ConsumerConfig::for_queue("memory://test-queue")
    }
}

/// Polls `condition` until it holds; panics after a minute of (virtual) time.
pub async fn eventually<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(60), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for: {what}");
}

/// Thread-safe event log for handlers.
#[derive(Clone, Default)]
pub struct Log<T>(Arc<Mutex<Vec<T>>>);

impl<T: Clone> Log<T> {
    pub fn push(&self, value: T) {
        self.0.lock().unwrap().push(value);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
