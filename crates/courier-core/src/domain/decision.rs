//! Decision model: what to do with a delivery once the handler has spoken.
//!
//! This module defines the AckDecision type (the acknowledgement action) and
//! the Decider trait (how to choose it from the outcome and the receive count).

use std::time::Duration;

use super::backoff::BackoffPolicy;
use super::message::Message;
use super::outcome::ProcessingOutcome;

/// The acknowledgement action for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckDecision {
    /// Delete the message from the source queue.
    Acknowledge,

    /// Leave the message on the queue, invisible for `delay`.
    Defer {
        delay: Duration,
        visibility_secs: u32,
        reason: String,
    },

    /// Write a dead-letter entry, then delete.
    DeadLetter { reason: String },
}

impl AckDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Defer { .. } => "defer",
            Self::DeadLetter { .. } => "dead_letter",
        }
    }
}

/// Trait for choosing the acknowledgement action.
///
/// Deciders are pure functions: given the delivery and the outcome of its
/// processing, they return the next action without side effects. Executing
/// it is the coordinator's job.
pub trait Decider: Send + Sync {
    fn decide(&self, message: &Message, outcome: &ProcessingOutcome) -> AckDecision;
}

/// Receive-count based retry with exponential backoff:
/// - Success: acknowledge
/// - RetryableFailure with receive_count < max_retries: defer
/// - RetryableFailure with receive_count >= max_retries: dead-letter
/// - FatalFailure: dead-letter
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl DefaultDecider {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries: max_retries.max(1),
            backoff,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(3, BackoffPolicy::default())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, message: &Message, outcome: &ProcessingOutcome) -> AckDecision {
        match outcome {
            ProcessingOutcome::Success => AckDecision::Acknowledge,
            ProcessingOutcome::FatalFailure(reason) => AckDecision::DeadLetter {
                reason: reason.clone(),
            },
            ProcessingOutcome::RetryableFailure(reason) => {
                let receive_count = message.attempt();
                if receive_count >= self.max_retries {
                    AckDecision::DeadLetter {
                        reason: format!(
                            "max retries reached ({receive_count}/{}): {reason}",
                            self.max_retries
                        ),
                    }
                } else {
                    AckDecision::Defer {
                        delay: self.backoff.next_delay(receive_count),
                        visibility_secs: self.backoff.as_visibility_seconds(receive_count),
                        reason: reason.clone(),
                    }
                }
            }
        }
    }
}
