//! Strongly-typed identifiers for queue deliveries.
//!
//! SQS hands out opaque strings for both the message id and the receipt
//! handle, and both travel side by side through the pipeline. A phantom
//! marker keeps them apart at compile time: a `MessageId` cannot be passed
//! where a `ReceiptHandle` is expected.
//!
//! The value itself is never interpreted. Only the in-memory emulator mints
//! ids, and it uses [`IdMarker::prefix`] so the two kinds stay recognisable
//! in logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Marker trait for each identifier kind.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used when the emulator mints ids of this kind (e.g. `"msg-"`).
    fn prefix() -> &'static str;
}

/// Generic string identifier.
///
/// `T` only exists at compile time (`PhantomData`); serialization is the bare
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_inner(self) -> String {
        self.value
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> AsRef<str> for Id<T> {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

// ========================================
// Markers
// ========================================

/// Marker for provider-assigned message ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageTag {}

impl IdMarker for MessageTag {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Marker for per-delivery receipt handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReceiptTag {}

impl IdMarker for ReceiptTag {
    fn prefix() -> &'static str {
        "rh-"
    }
}

/// Identifier of a message. Stable across redeliveries.
pub type MessageId = Id<MessageTag>;

/// One-time token for a single delivery of a message. A redelivery yields a
/// new handle.
pub type ReceiptHandle = Id<ReceiptTag>;
