//! Outcome model: what a handler reports back for one message.
//!
//! The outcome says nothing about queues. The decider turns it into an
//! acknowledgement action.

use serde::{Deserialize, Serialize};

/// Classification of an outcome, without the reason.
///
/// Serialized as SCREAMING_SNAKE_CASE: SUCCESS / RETRYABLE_FAILURE / FATAL_FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// Result of processing one message.
///
/// - `Success`: side effects done, delete the message.
/// - `RetryableFailure`: transient business error, counted against the retry budget.
/// - `FatalFailure`: retrying cannot help, dead-letter immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingOutcome {
    Success,
    RetryableFailure(String),
    FatalFailure(String),
}

impl ProcessingOutcome {
    pub fn success() -> Self {
        Self::Success
    }

    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::RetryableFailure(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalFailure(reason.into())
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success => OutcomeKind::Success,
            Self::RetryableFailure(_) => OutcomeKind::RetryableFailure,
            Self::FatalFailure(_) => OutcomeKind::FatalFailure,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::RetryableFailure(reason) | Self::FatalFailure(reason) => Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_kind_serializes_as_required_names() {
        let s = serde_json::to_string(&OutcomeKind::Success).unwrap();
        assert_eq!(s, "\"SUCCESS\"");

        let s = serde_json::to_string(&OutcomeKind::RetryableFailure).unwrap();
        assert_eq!(s, "\"RETRYABLE_FAILURE\"");

        let s = serde_json::to_string(&OutcomeKind::FatalFailure).unwrap();
        assert_eq!(s, "\"FATAL_FAILURE\"");
    }

    #[test]
    fn outcome_is_adjacently_tagged() {
        let v = serde_json::to_value(ProcessingOutcome::retryable("db busy")).unwrap();
        assert_eq!(v["kind"], "RETRYABLE_FAILURE");
        assert_eq!(v["reason"], "db busy");

        let v = serde_json::to_value(ProcessingOutcome::success()).unwrap();
        assert_eq!(v["kind"], "SUCCESS");
    }

    #[test]
    fn reason_and_kind_follow_the_variant() {
        assert_eq!(ProcessingOutcome::success().reason(), None);
        assert_eq!(ProcessingOutcome::fatal("bad").reason(), Some("bad"));
        assert_eq!(ProcessingOutcome::fatal("bad").kind(), OutcomeKind::FatalFailure);
        assert!(!ProcessingOutcome::retryable("x").is_success());
    }
}
