//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。各 trait は外部システム
//! （SQS、DLQ、dedup ストア、時計）へのインターフェースで、実装の詳細を隠蔽します。

pub mod clock;
pub mod dead_letter_sink;
pub mod dedup_store;
pub mod id_generator;
pub mod queue_client;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dead_letter_sink::DeadLetterSink;
pub use self::dedup_store::DedupStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_client::{
    MAX_BATCH_SIZE, MAX_WAIT_TIME, QueueClient, clamp_batch_size, clamp_visibility,
    clamp_wait_time,
};
