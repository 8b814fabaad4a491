//! ConsumerBuilder - consumer の構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - 設定値の検証（ConsumerConfig::validate）
//! - queue / dead-letter sink が指定されていること
//! - handler が 1 つ以上登録されていること
//! - expect_types() で指定した message_type が全て typed handler を持つこと

use std::sync::Arc;

use super::consumer::{Consumer, ConsumerParts};
use super::coordinator::AckCoordinator;
use super::dispatcher::Dispatcher;
use super::status::ConsumerStats;
use crate::config::{ConfigError, ConsumerConfig};
use crate::domain::decision::{Decider, DefaultDecider};
use crate::impls::InMemoryDedupStore;
use crate::ports::{Clock, DeadLetterSink, DedupStore, QueueClient, SystemClock};
use crate::typed::{BatchHandler, Handler, HandlerRegistry, Matcher, MessageHandler, Payload, RegistryError};

/// BuildError は consumer 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing message types: {0:?}. These types were expected but have no handler.")]
    MissingMessageTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no queue client configured")]
    MissingQueue,

    #[error("no dead-letter sink configured")]
    MissingDeadLetterSink,

    #[error("no handlers registered")]
    NoHandlers,
}

/// ConsumerBuilder は Consumer を構築
///
/// # 使用例
/// ```ignore
/// let consumer = ConsumerBuilder::new(config)
///     .queue(Arc::new(queue))
///     .dead_letter_sink(Arc::new(QueueDeadLetterSink::new(dlq)))
///     .register_typed::<OrderCreated, _>(OrderCreatedHandler)?
///     .expect_types(&[OrderCreated::TYPE])
///     .build()?;
/// let handle = consumer.start();
/// ```
///
/// Defaults: in-memory dedup store, `DefaultDecider` from the config's
/// retry settings, system clock.
pub struct ConsumerBuilder {
    config: ConsumerConfig,
    queue: Option<Arc<dyn QueueClient>>,
    dead_letter_sink: Option<Arc<dyn DeadLetterSink>>,
    dedup_store: Option<Arc<dyn DedupStore>>,
    decider: Option<Arc<dyn Decider>>,
    clock: Option<Arc<dyn Clock>>,
    registry: HandlerRegistry,
    expected_types: Option<Vec<String>>,
}

impl ConsumerBuilder {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            queue: None,
            dead_letter_sink: None,
            dedup_store: None,
            decider: None,
            clock: None,
            registry: HandlerRegistry::new(),
            expected_types: None,
        }
    }

    pub fn queue(mut self, queue: Arc<dyn QueueClient>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter_sink = Some(sink);
        self
    }

    pub fn dedup_store(mut self, store: Arc<dyn DedupStore>) -> Self {
        self.dedup_store = Some(store);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn register<H: MessageHandler + 'static>(mut self, matcher: Matcher, handler: H) -> Self {
        self.registry.register(matcher, handler);
        self
    }

    /// Typed handler を登録
    ///
    /// # Example
    /// ```ignore
    /// builder.register_typed::<OrderCreated, _>(OrderCreatedHandler)?;
    /// ```
    pub fn register_typed<T: Payload, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_batch<H: BatchHandler + 'static>(mut self, matcher: Matcher, handler: H) -> Self {
        self.registry.register_batch(matcher, handler);
        self
    }

    /// Replaces the routes registered so far.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// 期待される message_type のリストを設定
    pub fn expect_types(mut self, message_types: &[&str]) -> Self {
        self.expected_types = Some(message_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Consumer, BuildError> {
        self.config.validate()?;

        if let Some(expected_types) = &self.expected_types {
            let registered_types = self.registry.registered_types();
            let missing_types: Vec<String> = expected_types
                .iter()
                .filter(|t| !registered_types.iter().any(|r| *r == t.as_str()))
                .cloned()
                .collect();
            if !missing_types.is_empty() {
                return Err(BuildError::MissingMessageTypes(missing_types));
            }
        }
        if self.registry.is_empty() {
            return Err(BuildError::NoHandlers);
        }
        let queue = self.queue.ok_or(BuildError::MissingQueue)?;
        let sink = self
            .dead_letter_sink
            .ok_or(BuildError::MissingDeadLetterSink)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let dedup = self
            .dedup_store
            .unwrap_or_else(|| Arc::new(InMemoryDedupStore::with_clock(Arc::clone(&clock))));
        let backoff = self.config.backoff_policy();
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(self.config.max_retries, backoff)));

        let stats = Arc::new(ConsumerStats::default());
        let coordinator = Arc::new(AckCoordinator::new(
            Arc::clone(&queue),
            sink,
            decider,
            clock,
            backoff,
            Arc::clone(&stats),
        ));
        let dispatcher = Dispatcher::new(
            self.registry,
            Arc::clone(&dedup),
            coordinator,
            Arc::clone(&stats),
            self.config.dedup_ttl(),
        )
        .with_handler_timeout(self.config.handler_timeout());

        Ok(Consumer::from_parts(ConsumerParts {
            config: self.config,
            queue,
            dedup,
            dispatcher: Arc::new(dispatcher),
            stats,
        }))
    }
}
