//! courier-core
//!
//! SQS message consumption and production.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, outcome, decision, backoff, state, dead_letter, dedup, errors）
//! - **ports**: 抽象化レイヤー（QueueClient, DedupStore, DeadLetterSink, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（builder, consumer, worker_loop, dispatcher, coordinator, producer）
//! - **typed**: 型付き API（Payload, Handler, BatchHandler, Matcher, HandlerRegistry, PayloadCodec）
//! - **impls**: 実装（SqsQueueClient, InMemoryQueue, RetryingQueueClient, dedup / dead-letter stores）
//! - **config**: ConsumerConfig（環境変数 / JSON / struct literal）
//! - **logging**: tracing subscriber の初期化
//!
//! # データの流れ
//! receive_batch → dedup 確認 → registry が handler を選択 → handler → Decider →
//! delete / change_visibility / dead-letter → 成功なら dedup に記録

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod logging;
pub mod ports;
pub mod typed;

pub use app::{Consumer, ConsumerBuilder, ConsumerHandle, Producer, ShutdownReport};
pub use config::{ConsumerConfig, ReceivePolicy};
pub use domain::{Message, MessageId, OutgoingMessage, ProcessingOutcome, ReceiptHandle};
pub use logging::setup_logging;
