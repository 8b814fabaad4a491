//! Domain model (IDs, messages, outcomes, decisions, states, errors).

pub mod backoff;
pub mod dead_letter;
pub mod decision;
pub mod dedup;
pub mod errors;
pub mod ids;
pub mod message;
pub mod outcome;
pub mod state;

pub use backoff::{BackoffPolicy, MAX_VISIBILITY_SECS};
pub use dead_letter::{DeadLetterEntry, FailureRecord};
pub use decision::{AckDecision, Decider, DefaultDecider};
pub use dedup::DedupRecord;
pub use errors::{DedupError, ErrorKind, QueueError, SinkError};
pub use ids::{Id, IdMarker, MessageId, ReceiptHandle};
pub use message::{MESSAGE_TYPE_ATTRIBUTE, Message, OutgoingMessage};
pub use outcome::{OutcomeKind, ProcessingOutcome};
pub use state::DeliveryState;
