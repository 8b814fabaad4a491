//! Consumer configuration.
//!
//! One validated struct, loaded from `COURIER_*` environment variables, a
//! JSON file, or built as a literal. Every source ends in [`ConsumerConfig::validate`].
//!
//! | variable | field | default |
//! |---|---|---|
//! | `COURIER_QUEUE_URL` | queue_url | required |
//! | `COURIER_DEAD_LETTER_QUEUE_URL` | dead_letter_queue_url | none |
//! | `COURIER_ENDPOINT_URL` | endpoint_url | none |
//! | `COURIER_REGION` | region | none |
//! | `COURIER_WORKERS` | workers | 1 |
//! | `COURIER_MAX_CONCURRENT_MESSAGES` | max_concurrent_messages | 10 |
//! | `COURIER_MAX_MESSAGES_PER_POLL` | max_messages_per_poll | 10 |
//! | `COURIER_POLL_TIMEOUT_SECS` | poll_timeout_secs | 10 |
//! | `COURIER_VISIBILITY_TIMEOUT_SECS` | visibility_timeout_secs | 30 |
//! | `COURIER_MAX_RETRIES` | max_retries | 3 |
//! | `COURIER_BACKOFF_BASE_MS` | backoff_base_ms | 1000 |
//! | `COURIER_BACKOFF_CAP_MS` | backoff_cap_ms | 60000 |
//! | `COURIER_DEDUP_TTL_SECS` | dedup_ttl_secs | 3600 |
//! | `COURIER_SHUTDOWN_GRACE_SECS` | shutdown_grace_secs | 30 |
//! | `COURIER_HANDLER_TIMEOUT_SECS` | handler_timeout_secs | none |
//! | `COURIER_RECEIVE_POLICY` | receive_policy | overlap |

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::backoff::{BackoffPolicy, MAX_VISIBILITY_SECS};
use crate::ports::queue_client::{MAX_BATCH_SIZE, MAX_WAIT_TIME};

pub const ENV_PREFIX: &str = "COURIER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// When the next receive may start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceivePolicy {
    /// Receive again as soon as permits are free, while the previous batch
    /// is still being processed.
    #[default]
    Overlap,
    /// Wait until every message of the previous batch has been acknowledged,
    /// deferred or dead-lettered.
    DrainBatch,
}

impl FromStr for ReceivePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "overlap" => Ok(Self::Overlap),
            "drain_batch" => Ok(Self::DrainBatch),
            other => Err(format!("unknown receive policy '{other}'")),
        }
    }
}

impl fmt::Display for ReceivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Overlap => "overlap",
            Self::DrainBatch => "drain_batch",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerConfig {
    pub queue_url: String,
    pub dead_letter_queue_url: Option<String>,
    /// SQS endpoint override, e.g. `http://localhost:4566` for LocalStack.
    pub endpoint_url: Option<String>,
    pub region: Option<String>,

    pub workers: usize,
    pub max_concurrent_messages: usize,
    pub max_messages_per_poll: usize,
    pub poll_timeout_secs: u64,
    pub visibility_timeout_secs: u64,

    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,

    pub dedup_ttl_secs: u64,
    pub shutdown_grace_secs: u64,
    pub handler_timeout_secs: Option<u64>,
    pub receive_policy: ReceivePolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            dead_letter_queue_url: None,
            endpoint_url: None,
            region: None,
            workers: 1,
            max_concurrent_messages: 10,
            max_messages_per_poll: 10,
            poll_timeout_secs: 10,
            visibility_timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            dedup_ttl_secs: 3_600,
            shutdown_grace_secs: 30,
            handler_timeout_secs: None,
            receive_policy: ReceivePolicy::Overlap,
        }
    }
}

impl ConsumerConfig {
    /// Defaults for everything but the queue URL.
    pub fn for_queue(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        let mut config = Self::default();
        if let Some((_, v)) = get("QUEUE_URL") {
            config.queue_url = v;
        }
        config.dead_letter_queue_url = get("DEAD_LETTER_QUEUE_URL").map(|(_, v)| v);
        config.endpoint_url = get("ENDPOINT_URL").map(|(_, v)| v);
        config.region = get("REGION").map(|(_, v)| v);

        parse_into(get("WORKERS"), &mut config.workers)?;
        parse_into(get("MAX_CONCURRENT_MESSAGES"), &mut config.max_concurrent_messages)?;
        parse_into(get("MAX_MESSAGES_PER_POLL"), &mut config.max_messages_per_poll)?;
        parse_into(get("POLL_TIMEOUT_SECS"), &mut config.poll_timeout_secs)?;
        parse_into(get("VISIBILITY_TIMEOUT_SECS"), &mut config.visibility_timeout_secs)?;
        parse_into(get("MAX_RETRIES"), &mut config.max_retries)?;
        parse_into(get("BACKOFF_BASE_MS"), &mut config.backoff_base_ms)?;
        parse_into(get("BACKOFF_CAP_MS"), &mut config.backoff_cap_ms)?;
        parse_into(get("DEDUP_TTL_SECS"), &mut config.dedup_ttl_secs)?;
        parse_into(get("SHUTDOWN_GRACE_SECS"), &mut config.shutdown_grace_secs)?;
        parse_into(get("RECEIVE_POLICY"), &mut config.receive_policy)?;
        if let Some(entry) = get("HANDLER_TIMEOUT_SECS") {
            let mut secs = 0u64;
            parse_into(Some(entry), &mut secs)?;
            config.handler_timeout_secs = Some(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.into(),
            })
        }

        if self.queue_url.trim().is_empty() {
            return invalid("queue_url", "is required");
        }
        if self
            .dead_letter_queue_url
            .as_deref()
            .is_some_and(|url| url.trim().is_empty())
        {
            return invalid("dead_letter_queue_url", "must not be empty when set");
        }
        if self.dead_letter_queue_url.as_deref() == Some(self.queue_url.as_str()) {
            return invalid("dead_letter_queue_url", "must differ from queue_url");
        }
        if self.workers == 0 {
            return invalid("workers", "must be at least 1");
        }
        if self.max_concurrent_messages == 0 {
            return invalid("max_concurrent_messages", "must be at least 1");
        }
        if self.max_messages_per_poll == 0 || self.max_messages_per_poll > MAX_BATCH_SIZE {
            return invalid(
                "max_messages_per_poll",
                format!("must be between 1 and {MAX_BATCH_SIZE}"),
            );
        }
        if self.max_messages_per_poll > self.max_concurrent_messages {
            return invalid(
                "max_messages_per_poll",
                format!(
                    "({}) must not exceed max_concurrent_messages ({})",
                    self.max_messages_per_poll, self.max_concurrent_messages
                ),
            );
        }
        if self.poll_timeout_secs > MAX_WAIT_TIME.as_secs() {
            return invalid(
                "poll_timeout_secs",
                format!("must be at most {}", MAX_WAIT_TIME.as_secs()),
            );
        }
        if self.visibility_timeout_secs > MAX_VISIBILITY_SECS {
            return invalid(
                "visibility_timeout_secs",
                format!("must be at most {MAX_VISIBILITY_SECS}"),
            );
        }
        if self.max_retries == 0 {
            return invalid("max_retries", "must be at least 1");
        }
        if self.backoff_base_ms == 0 {
            return invalid("backoff_base_ms", "must be at least 1");
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return invalid("backoff_cap_ms", "must not be below backoff_base_ms");
        }
        if self.backoff_cap_ms > MAX_VISIBILITY_SECS * 1_000 {
            return invalid(
                "backoff_cap_ms",
                format!("must be at most {} (12 hours)", MAX_VISIBILITY_SECS * 1_000),
            );
        }
        if self.dedup_ttl_secs == 0 {
            return invalid("dedup_ttl_secs", "must be at least 1");
        }
        if self.handler_timeout_secs == Some(0) {
            return invalid("handler_timeout_secs", "must be at least 1 when set");
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_into<T>(entry: Option<(String, String)>, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Some((key, value)) = entry {
        *slot = value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
            value,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid_once_queue_is_set() {
        let config = ConsumerConfig::for_queue("http://localhost:4566/000000000000/test-queue");
        config.validate().unwrap();
        assert_eq!(config.max_concurrent_messages, 10);
        assert_eq!(config.max_messages_per_poll, 10);
        assert_eq!(config.poll_timeout(), Duration::from_secs(10));
        assert_eq!(config.receive_policy, ReceivePolicy::Overlap);
        assert_eq!(config.handler_timeout(), None);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = ConsumerConfig::from_lookup(lookup(&[
            ("COURIER_QUEUE_URL", "http://localhost:4566/000000000000/orders"),
            ("COURIER_DEAD_LETTER_QUEUE_URL", "http://localhost:4566/000000000000/orders-dlq"),
            ("COURIER_ENDPOINT_URL", "http://localhost:4566"),
            ("COURIER_WORKERS", "2"),
            ("COURIER_MAX_CONCURRENT_MESSAGES", "20"),
            ("COURIER_POLL_TIMEOUT_SECS", "2"),
            ("COURIER_HANDLER_TIMEOUT_SECS", "15"),
            ("COURIER_RECEIVE_POLICY", "drain-batch"),
        ]))
        .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.max_concurrent_messages, 20);
        assert_eq!(config.poll_timeout_secs, 2);
        assert_eq!(config.handler_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.receive_policy, ReceivePolicy::DrainBatch);
        assert_eq!(config.endpoint_url.as_deref(), Some("http://localhost:4566"));
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let config = ConsumerConfig::from_lookup(lookup(&[
            ("COURIER_QUEUE_URL", "q"),
            ("COURIER_REGION", "  "),
            ("COURIER_WORKERS", ""),
        ]))
        .unwrap();
        assert_eq!(config.region, None);
        assert_eq!(config.workers, 1);
    }

    #[test]
    fn unparsable_env_value_names_the_variable() {
        let err = ConsumerConfig::from_lookup(lookup(&[
            ("COURIER_QUEUE_URL", "q"),
            ("COURIER_MAX_RETRIES", "three"),
        ]))
        .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "COURIER_MAX_RETRIES");
                assert_eq!(value, "three");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_queue_url_is_rejected() {
        let err = ConsumerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "queue_url", .. }));
    }

    #[rstest]
    #[case::zero_workers(|c: &mut ConsumerConfig| c.workers = 0, "workers")]
    #[case::zero_concurrency(|c: &mut ConsumerConfig| c.max_concurrent_messages = 0, "max_concurrent_messages")]
    #[case::poll_batch_too_big(|c: &mut ConsumerConfig| c.max_messages_per_poll = 11, "max_messages_per_poll")]
    #[case::poll_batch_over_concurrency(|c: &mut ConsumerConfig| { c.max_concurrent_messages = 4; c.max_messages_per_poll = 5; }, "max_messages_per_poll")]
    #[case::long_poll_too_long(|c: &mut ConsumerConfig| c.poll_timeout_secs = 21, "poll_timeout_secs")]
    #[case::visibility_too_long(|c: &mut ConsumerConfig| c.visibility_timeout_secs = 43_201, "visibility_timeout_secs")]
    #[case::zero_retries(|c: &mut ConsumerConfig| c.max_retries = 0, "max_retries")]
    #[case::cap_below_base(|c: &mut ConsumerConfig| { c.backoff_base_ms = 5_000; c.backoff_cap_ms = 1_000; }, "backoff_cap_ms")]
    #[case::zero_ttl(|c: &mut ConsumerConfig| c.dedup_ttl_secs = 0, "dedup_ttl_secs")]
    #[case::zero_handler_timeout(|c: &mut ConsumerConfig| c.handler_timeout_secs = Some(0), "handler_timeout_secs")]
    #[case::same_dlq(|c: &mut ConsumerConfig| c.dead_letter_queue_url = Some(c.queue_url.clone()), "dead_letter_queue_url")]
    fn invalid_settings_are_rejected(
        #[case] mutate: fn(&mut ConsumerConfig),
        #[case] expected_field: &str,
    ) {
        let mut config = ConsumerConfig::for_queue("q");
        mutate(&mut config);
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("expected invalid {expected_field}, got {other:?}"),
        }
    }

    #[test]
    fn json_file_fills_missing_fields_with_defaults() {
        let config = ConsumerConfig::from_json_str(
            r#"{ "queue_url": "q", "max_retries": 5, "receive_policy": "drain_batch" }"#,
        )
        .unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.receive_policy, ReceivePolicy::DrainBatch);
        assert_eq!(config.dedup_ttl_secs, 3_600);
    }

    #[test]
    fn json_rejects_unknown_fields() {
        let err = ConsumerConfig::from_json_str(r#"{ "queue_url": "q", "retries": 5 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ConsumerConfig::from_json_file("/nonexistent/courier.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
