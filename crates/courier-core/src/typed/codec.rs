//! PayloadCodec - Payload とメッセージの相互変換

use thiserror::Error;

use super::payload::Payload;
use crate::domain::message::{MESSAGE_TYPE_ATTRIBUTE, Message, OutgoingMessage};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message type mismatch: expected '{expected}', found {found:?}")]
    TypeMismatch {
        expected: &'static str,
        found: Option<String>,
    },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON codec for `Payload` types.
pub struct PayloadCodec;

impl PayloadCodec {
    /// Body as JSON plus the `message_type` attribute.
    pub fn encode<T: Payload>(payload: &T) -> Result<OutgoingMessage, CodecError> {
        let body = serde_json::to_string(payload)?;
        Ok(OutgoingMessage::new(body).with_attribute(MESSAGE_TYPE_ATTRIBUTE, T::TYPE))
    }

    /// Checks `message_type` (when present) and decodes the body.
    ///
    /// A missing attribute is accepted: the caller already routed the
    /// message to this type.
    pub fn decode<T: Payload>(message: &Message) -> Result<T, CodecError> {
        if let Some(found) = message.message_type()
            && found != T::TYPE
        {
            return Err(CodecError::TypeMismatch {
                expected: T::TYPE,
                found: Some(found.to_string()),
            });
        }
        Ok(serde_json::from_str(&message.body)?)
    }
}
