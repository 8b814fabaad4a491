//! Consumer - worker 群と janitor の起動・停止
//!
//! `Consumer` は設定済みの部品一式。`start()` で `ConsumerHandle` が返り、
//! `shutdown()` で止める（自動起動はしない）。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::builder::ConsumerBuilder;
use super::dispatcher::Dispatcher;
use super::status::{ConsumerStats, StatsSnapshot};
use super::worker_loop::{LoopSettings, ShutdownSignal, WorkerLoop, WorkerReport, wait_for_shutdown};
use crate::config::ConsumerConfig;
use crate::ports::{DedupStore, QueueClient};

/// Longest pause between two dedup purges.
const MAX_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Result of a shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ShutdownReport {
    /// In-flight messages that reached an acknowledgement action within the
    /// grace period.
    pub drained: usize,
    /// In-flight messages the queue took back unacknowledged. Handles that
    /// had already expired are not counted.
    pub returned: usize,
}

pub(crate) struct ConsumerParts {
    pub config: ConsumerConfig,
    pub queue: Arc<dyn QueueClient>,
    pub dedup: Arc<dyn DedupStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub stats: Arc<ConsumerStats>,
}

/// A configured consumer, ready to start.
///
/// Cloning is cheap; every clone shares the same stats and stores.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerParts>,
}

impl Consumer {
    pub fn builder(config: ConsumerConfig) -> ConsumerBuilder {
        ConsumerBuilder::new(config)
    }

    pub(crate) fn from_parts(parts: ConsumerParts) -> Self {
        Self {
            inner: Arc::new(parts),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Spawns the workers and the dedup janitor. Must be called inside a
    /// tokio runtime.
    pub fn start(&self) -> ConsumerHandle {
        let config = &self.inner.config;
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_messages));
        let settings = LoopSettings {
            max_messages_per_poll: config.max_messages_per_poll,
            poll_timeout: config.poll_timeout(),
            receive_policy: config.receive_policy,
            default_grace: config.shutdown_grace(),
        };

        info!(
            queue_url = %config.queue_url,
            workers = config.workers,
            max_concurrent_messages = config.max_concurrent_messages,
            max_messages_per_poll = config.max_messages_per_poll,
            receive_policy = %config.receive_policy,
            "Starting consumer"
        );

        let workers = (0..config.workers)
            .map(|worker_id| {
                let worker = WorkerLoop::new(
                    worker_id,
                    Arc::clone(&self.inner.queue),
                    Arc::clone(&self.inner.dispatcher),
                    Arc::clone(&permits),
                    Arc::clone(&self.inner.stats),
                    settings,
                    shutdown_rx.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let janitor = tokio::spawn(janitor_loop(
            Arc::clone(&self.inner.dedup),
            config.dedup_ttl().min(MAX_PURGE_INTERVAL),
            shutdown_rx,
        ));

        ConsumerHandle {
            shutdown_tx,
            workers,
            janitor,
            stats: Arc::clone(&self.inner.stats),
            default_grace: config.shutdown_grace(),
        }
    }

    /// Runs until `signal` resolves, then shuts down with the configured grace.
    ///
    /// ```ignore
    /// let report = consumer.run_until(tokio::signal::ctrl_c()).await;
    /// ```
    pub async fn run_until<F: Future>(&self, signal: F) -> ShutdownReport {
        let handle = self.start();
        signal.await;
        info!("Shutdown signal received");
        handle.shutdown().await
    }
}

/// Running consumer. Dropping it without calling `shutdown` stops the
/// workers as well, with the configured grace period.
pub struct ConsumerHandle {
    shutdown_tx: watch::Sender<Option<Duration>>,
    workers: Vec<JoinHandle<WorkerReport>>,
    janitor: JoinHandle<()>,
    stats: Arc<ConsumerStats>,
    default_grace: Duration,
}

impl ConsumerHandle {
    /// Stops receiving. In-flight messages keep running; await
    /// [`shutdown`](Self::shutdown) to wait for them.
    pub fn request_shutdown(&self) {
        self.signal(self.default_grace);
    }

    pub async fn shutdown(self) -> ShutdownReport {
        let grace = self.default_grace;
        self.shutdown_with_grace(grace).await
    }

    pub async fn shutdown_with_grace(self, grace: Duration) -> ShutdownReport {
        self.signal(grace);

        let mut report = ShutdownReport::default();
        for (worker_id, worker) in self.workers.into_iter().enumerate() {
            match worker.await {
                Ok(r) => {
                    report.drained += r.drained;
                    report.returned += r.returned;
                }
                Err(e) => error!(worker_id, error = %e, "Worker task failed"),
            }
        }
        if let Err(e) = self.janitor.await
            && !e.is_cancelled()
        {
            error!(error = %e, "Dedup janitor failed");
        }

        info!(
            drained = report.drained,
            returned = report.returned,
            "Consumer stopped"
        );
        report
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// True once every worker has exited.
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(JoinHandle::is_finished)
    }

    fn signal(&self, grace: Duration) {
        // the first request wins; later ones cannot change the grace period
        self.shutdown_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(grace);
            true
        });
    }
}

async fn janitor_loop(dedup: Arc<dyn DedupStore>, interval: Duration, mut shutdown: ShutdownSignal) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match dedup.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "Purged expired dedup records"),
                    Err(e) => warn!(error = %e, "Dedup purge failed"),
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
}
