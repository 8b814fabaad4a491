//! Implementations of the ports.
//!
//! - `sqs`: the real queue (`aws-sdk-sqs`)
//! - `retrying`: transient-error retries around any queue client
//! - `inmem_*`: in-process queue, dedup store and dead-letter sink for tests and demos
//! - `queue_dead_letter`: dead-letter sink writing to a queue

pub mod inmem_dead_letter;
pub mod inmem_dedup;
pub mod inmem_queue;
pub mod queue_dead_letter;
pub mod retrying;
pub mod sqs;

pub use self::inmem_dead_letter::InMemoryDeadLetterSink;
pub use self::inmem_dedup::InMemoryDedupStore;
pub use self::inmem_queue::{InMemoryQueue, InMemoryQueueStats, Operation, StoredMessageView};
pub use self::queue_dead_letter::{DEAD_LETTER_MESSAGE_TYPE, QueueDeadLetterSink};
pub use self::retrying::{RetryConfig, RetryingQueueClient};
pub use self::sqs::{SqsQueueClient, load_sdk_config};
