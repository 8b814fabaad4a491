//! Errors - queue / sink エラー型と分類

use thiserror::Error;

/// ErrorKind は運用上の分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - NotFound: receipt handle が古い／消費済み（リトライ無意味、ログのみ）
/// - Permanent: 恒久的なエラー（リトライ無意味）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    NotFound,
    Permanent,
}

/// Errors surfaced by a queue client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Connectivity problem: DNS, TLS, timeouts, unparsable responses.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service asked us to slow down.
    #[error("throttled: {0}")]
    Throttling(String),

    /// Receipt handle already consumed, expired or never valid.
    #[error("receipt handle not found: {0}")]
    NotFound(String),

    /// Any other refusal by the service (bad input, missing queue, access).
    #[error("rejected by queue service: {0}")]
    Rejected(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::Throttling(_) => ErrorKind::Transient,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Rejected(_) => ErrorKind::Permanent,
        }
    }

    /// Worth retrying at the adapter level.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors from writing a dead-letter entry.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to encode dead-letter entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to deliver dead-letter entry: {0}")]
    Queue(#[from] QueueError),

    #[error("dead-letter sink unavailable: {0}")]
    Unavailable(String),
}

/// Errors from a dedup store.
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("dedup store unavailable: {0}")]
    Unavailable(String),

    #[error("dedup store rejected the request: {0}")]
    Rejected(String),
}
