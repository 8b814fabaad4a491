//! App - アプリケーション層
//!
//! ports を組み合わせて consumer / producer を実装します。
//!
//! # 主要コンポーネント
//! - **ConsumerBuilder**: 構築とワイヤリング（起動時検証）
//! - **Consumer / ConsumerHandle**: worker 群の起動・停止
//! - **WorkerLoop**: receive → dispatch → ack のループ
//! - **Dispatcher**: dedup 確認と handler 実行
//! - **AckCoordinator**: delete / defer / dead-letter
//! - **Producer**: send / send_many

pub mod builder;
pub mod consumer;
pub mod coordinator;
pub mod dispatcher;
pub mod inflight;
pub mod producer;
pub mod status;
mod worker_loop;

pub use self::builder::{BuildError, ConsumerBuilder};
pub use self::consumer::{Consumer, ConsumerHandle, ShutdownReport};
pub use self::coordinator::{AckCoordinator, Delivery};
pub use self::dispatcher::Dispatcher;
pub use self::inflight::InFlightTracker;
pub use self::producer::{Producer, ProducerError};
pub use self::status::{ConsumerStats, StatsSnapshot};
