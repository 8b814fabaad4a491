//! SQS queue client over `aws-sdk-sqs`.
//!
//! Works against AWS or any SQS-compatible endpoint (LocalStack) through an
//! endpoint override. SDK errors are folded into [`QueueError`]:
//!
//! | SDK error | QueueError |
//! |---|---|
//! | dispatch failure, timeout, unparsable response | `Transport` |
//! | throttling codes, HTTP 429 / 503 | `Throttling` |
//! | stale or unknown receipt handle | `NotFound` |
//! | anything else the service refused | `Rejected` |

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_sqs::Client;
use aws_sdk_sqs::config::http::HttpResponse;
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{
    MessageAttributeValue, MessageSystemAttributeName, QueueAttributeName,
    SendMessageBatchRequestEntry,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::domain::errors::QueueError;
use crate::domain::ids::{MessageId, ReceiptHandle};
use crate::domain::message::{Message, OutgoingMessage};
use crate::ports::{QueueClient, clamp_batch_size, clamp_visibility, clamp_wait_time};

const THROTTLING_CODES: &[&str] = &[
    "ThrottlingException",
    "RequestThrottled",
    "AWS.SimpleQueueService.RequestThrottled",
    "OverLimit",
];

const NOT_FOUND_CODES: &[&str] = &[
    "ReceiptHandleIsInvalid",
    "AWS.SimpleQueueService.ReceiptHandleIsInvalid",
    "MessageNotInflight",
    "AWS.SimpleQueueService.MessageNotInflight",
];

/// Loads the shared AWS config, honouring an optional region and endpoint
/// override (e.g. `http://localhost:4566` for LocalStack).
pub async fn load_sdk_config(region: Option<&str>, endpoint_url: Option<&str>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_string()));
    }
    if let Some(endpoint) = endpoint_url {
        info!(endpoint_url = %endpoint, "Using SQS endpoint override");
        loader = loader.endpoint_url(endpoint);
    }
    loader.load().await
}

/// One SQS queue.
#[derive(Clone)]
pub struct SqsQueueClient {
    client: Client,
    queue_url: String,
    visibility_timeout: Option<u32>,
}

impl SqsQueueClient {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            visibility_timeout: None,
        }
    }

    pub fn from_sdk_config(config: &SdkConfig, queue_url: impl Into<String>) -> Self {
        Self::new(Client::new(config), queue_url)
    }

    /// Client for `config.queue_url`, with the configured region, endpoint
    /// override and visibility timeout.
    pub async fn from_config(config: &ConsumerConfig) -> Self {
        let sdk = load_sdk_config(config.region.as_deref(), config.endpoint_url.as_deref()).await;
        let visibility = u32::try_from(config.visibility_timeout_secs).unwrap_or(u32::MAX);
        Self::from_sdk_config(&sdk, config.queue_url.clone()).with_visibility_timeout(visibility)
    }

    /// Visibility timeout requested on every receive. Without it the queue's
    /// own default applies.
    pub fn with_visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout = Some(clamp_visibility(seconds));
        self
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn is_fifo(&self) -> bool {
        self.queue_url.ends_with(".fifo")
    }

    /// Looks up the URL of a queue by name.
    pub async fn resolve_queue_url(client: &Client, queue_name: &str) -> Result<String, QueueError> {
        let output = client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| classify("get_queue_url", e))?;
        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| QueueError::Rejected(format!("no url returned for queue {queue_name}")))
    }

    /// Creates a queue (idempotent on SQS for identical attributes) and
    /// returns its URL. Names ending in `.fifo` get a FIFO queue with
    /// content-based deduplication.
    pub async fn create_queue(client: &Client, queue_name: &str) -> Result<String, QueueError> {
        let mut request = client.create_queue().queue_name(queue_name);
        if queue_name.ends_with(".fifo") {
            request = request
                .attributes(QueueAttributeName::FifoQueue, "true")
                .attributes(QueueAttributeName::ContentBasedDeduplication, "true");
        }
        let output = request
            .send()
            .await
            .map_err(|e| classify("create_queue", e))?;
        let url = output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| QueueError::Rejected(format!("no url returned for queue {queue_name}")))?;
        info!(queue_name, queue_url = %url, "Queue ready");
        Ok(url)
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive_batch(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        let mut request = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(clamp_batch_size(max_messages) as i32)
            .wait_time_seconds(clamp_wait_time(wait_time).as_secs() as i32)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All");
        if let Some(visibility) = self.visibility_timeout {
            request = request.visibility_timeout(visibility as i32);
        }

        let output = request
            .send()
            .await
            .map_err(|e| classify("receive_message", e))?;

        let messages: Vec<Message> = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(convert_message)
            .collect();
        if !messages.is_empty() {
            debug!(queue_url = %self.queue_url, count = messages.len(), "Received messages from SQS");
        }
        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &ReceiptHandle) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle.as_str())
            .send()
            .await
            .map_err(|e| classify("delete_message", e))?;
        Ok(())
    }

    async fn change_visibility(
        &self,
        receipt_handle: &ReceiptHandle,
        seconds: u32,
    ) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle.as_str())
            .visibility_timeout(clamp_visibility(seconds) as i32)
            .send()
            .await
            .map_err(|e| classify("change_message_visibility", e))?;
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<MessageId, QueueError> {
        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(message.body)
            .set_message_attributes(attribute_values(&message.attributes)?);

        // standard queues reject group and deduplication ids
        if self.is_fifo() {
            request = request
                .set_message_group_id(message.group_id)
                .set_message_deduplication_id(message.deduplication_id);
        }

        let output = request
            .send()
            .await
            .map_err(|e| classify("send_message", e))?;
        let id = output
            .message_id()
            .ok_or_else(|| QueueError::Transport("send_message returned no message id".into()))?;
        debug!(queue_url = %self.queue_url, message_id = %id, "Message sent to SQS");
        Ok(MessageId::new(id))
    }

    async fn send_batch(
        &self,
        messages: Vec<OutgoingMessage>,
    ) -> Result<Vec<MessageId>, QueueError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let count = messages.len();
        let fifo = self.is_fifo();

        let mut entries = Vec::with_capacity(count);
        for (index, message) in messages.into_iter().enumerate() {
            let mut entry = SendMessageBatchRequestEntry::builder()
                .id(index.to_string())
                .message_body(message.body)
                .set_message_attributes(attribute_values(&message.attributes)?);
            if fifo {
                entry = entry
                    .set_message_group_id(message.group_id)
                    .set_message_deduplication_id(message.deduplication_id);
            }
            entries.push(
                entry
                    .build()
                    .map_err(|e| QueueError::Rejected(format!("invalid batch entry: {e}")))?,
            );
        }

        let output = self
            .client
            .send_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| classify("send_message_batch", e))?;

        if let Some(failure) = output.failed().first() {
            let detail = format!(
                "send_message_batch: {} of {count} entries failed, first: {} {}",
                output.failed().len(),
                failure.code(),
                failure.message().unwrap_or_default()
            );
            return Err(if failure.sender_fault() {
                QueueError::Rejected(detail)
            } else {
                QueueError::Transport(detail)
            });
        }

        let mut ids: Vec<(usize, MessageId)> = output
            .successful()
            .iter()
            .map(|entry| {
                let index = entry.id().parse::<usize>().unwrap_or(usize::MAX);
                (index, MessageId::new(entry.message_id()))
            })
            .collect();
        ids.sort_by_key(|(index, _)| *index);
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }
}

fn attribute_values(
    attributes: &BTreeMap<String, String>,
) -> Result<Option<HashMap<String, MessageAttributeValue>>, QueueError> {
    if attributes.is_empty() {
        return Ok(None);
    }
    let mut values = HashMap::with_capacity(attributes.len());
    for (key, value) in attributes {
        let value = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(value)
            .build()
            .map_err(|e| QueueError::Rejected(format!("invalid attribute {key}: {e}")))?;
        values.insert(key.clone(), value);
    }
    Ok(Some(values))
}

/// SDK message -> domain message. Messages without an id or receipt handle
/// cannot be acknowledged and are skipped.
fn convert_message(message: aws_sdk_sqs::types::Message) -> Option<Message> {
    let (Some(id), Some(receipt)) = (message.message_id(), message.receipt_handle()) else {
        warn!("Skipping SQS message without message id or receipt handle");
        return None;
    };

    let system = message.attributes();
    let system_attr = |name: MessageSystemAttributeName| {
        system.and_then(|attrs| attrs.get(&name)).map(String::as_str)
    };
    let receive_count = system_attr(MessageSystemAttributeName::ApproximateReceiveCount)
        .and_then(|count| count.parse::<u32>().ok())
        .unwrap_or(1);
    let group_id = system_attr(MessageSystemAttributeName::MessageGroupId).map(str::to_string);
    let sent_at = system_attr(MessageSystemAttributeName::SentTimestamp)
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    let attributes: BTreeMap<String, String> = message
        .message_attributes()
        .map(|attrs| {
            attrs
                .iter()
                .filter_map(|(k, v)| v.string_value().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Some(Message {
        id: MessageId::new(id),
        body: message.body().unwrap_or_default().to_string(),
        attributes,
        receipt_handle: ReceiptHandle::new(receipt),
        receive_count,
        group_id,
        sent_at,
    })
}

fn classify<E>(operation: &str, err: SdkError<E, HttpResponse>) -> QueueError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(context) => classify_service(
            operation,
            context.err().code(),
            context.err().message(),
            context.raw().status().as_u16(),
        ),
        SdkError::ConstructionFailure(_) => {
            QueueError::Rejected(format!("{operation}: {}", DisplayErrorContext(&err)))
        }
        _ => QueueError::Transport(format!("{operation}: {}", DisplayErrorContext(&err))),
    }
}

fn classify_service(
    operation: &str,
    code: Option<&str>,
    message: Option<&str>,
    status: u16,
) -> QueueError {
    let code_str = code.unwrap_or("unknown");
    let detail = format!(
        "{operation}: {code_str} (HTTP {status}): {}",
        message.unwrap_or_default()
    );

    if code.is_some_and(|c| THROTTLING_CODES.contains(&c)) || status == 429 || status == 503 {
        return QueueError::Throttling(detail);
    }
    if code.is_some_and(|c| NOT_FOUND_CODES.contains(&c)) {
        return QueueError::NotFound(detail);
    }
    // SQS reports an expired handle as a generic parameter error
    if code.is_some_and(|c| c.ends_with("InvalidParameterValue"))
        && message.is_some_and(|m| m.to_ascii_lowercase().contains("receipt handle"))
    {
        return QueueError::NotFound(detail);
    }
    if status >= 500 {
        return QueueError::Transport(detail);
    }
    QueueError::Rejected(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some("ThrottlingException"), None, 400, "throttling")]
    #[case(Some("AWS.SimpleQueueService.RequestThrottled"), None, 403, "throttling")]
    #[case(Some("OverLimit"), None, 403, "throttling")]
    #[case(None, None, 429, "throttling")]
    #[case(Some("ServiceUnavailable"), None, 503, "throttling")]
    #[case(Some("ReceiptHandleIsInvalid"), None, 400, "not_found")]
    #[case(Some("AWS.SimpleQueueService.MessageNotInflight"), None, 400, "not_found")]
    #[case(
        Some("InvalidParameterValue"),
        Some("Value rh-1 for parameter ReceiptHandle is invalid. Reason: The receipt handle has expired."),
        400,
        "not_found"
    )]
    #[case(Some("InvalidParameterValue"), Some("Message too long"), 400, "rejected")]
    #[case(Some("AWS.SimpleQueueService.NonExistentQueue"), None, 400, "rejected")]
    #[case(Some("InternalError"), None, 500, "transport")]
    fn service_errors_are_classified(
        #[case] code: Option<&str>,
        #[case] message: Option<&str>,
        #[case] status: u16,
        #[case] expected: &str,
    ) {
        let err = classify_service("op", code, message, status);
        let kind = match err {
            QueueError::Throttling(_) => "throttling",
            QueueError::NotFound(_) => "not_found",
            QueueError::Rejected(_) => "rejected",
            QueueError::Transport(_) => "transport",
        };
        assert_eq!(kind, expected, "{err}");
    }

    #[test]
    fn sdk_message_is_converted() {
        let sdk = aws_sdk_sqs::types::Message::builder()
            .message_id("5fea7756-0ea4-451a-a703-a558b933e274")
            .receipt_handle("AQEBwJnKyrHigUMZj6rYigCgxlaS3SLy0a")
            .body("{\"order\":1}")
            .attributes(MessageSystemAttributeName::ApproximateReceiveCount, "3")
            .attributes(MessageSystemAttributeName::MessageGroupId, "orders")
            .attributes(MessageSystemAttributeName::SentTimestamp, "1700000000000")
            .message_attributes(
                "message_type",
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value("orders.created.v1")
                    .build()
                    .unwrap(),
            )
            .build();

        let m = convert_message(sdk).unwrap();
        assert_eq!(m.id.as_str(), "5fea7756-0ea4-451a-a703-a558b933e274");
        assert_eq!(m.receive_count, 3);
        assert_eq!(m.group_id.as_deref(), Some("orders"));
        assert_eq!(m.message_type(), Some("orders.created.v1"));
        assert_eq!(m.sent_at.unwrap().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn message_without_receipt_handle_is_skipped() {
        let sdk = aws_sdk_sqs::types::Message::builder()
            .message_id("m-1")
            .body("x")
            .build();
        assert!(convert_message(sdk).is_none());
    }

    #[test]
    fn receive_count_defaults_to_one() {
        let sdk = aws_sdk_sqs::types::Message::builder()
            .message_id("m-1")
            .receipt_handle("r-1")
            .build();
        let m = convert_message(sdk).unwrap();
        assert_eq!(m.receive_count, 1);
        assert_eq!(m.body, "");
        assert!(m.attributes.is_empty());
    }

    #[test]
    fn attribute_values_are_string_typed() {
        let mut attrs = BTreeMap::new();
        attrs.insert("message_type".to_string(), "x.v1".to_string());
        let values = attribute_values(&attrs).unwrap().unwrap();
        assert_eq!(values["message_type"].data_type(), "String");
        assert_eq!(values["message_type"].string_value(), Some("x.v1"));
        assert!(attribute_values(&BTreeMap::new()).unwrap().is_none());
    }
}
