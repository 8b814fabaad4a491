//! Matchers decide which registered handler a message goes to.

use std::fmt;
use std::sync::Arc;

use crate::domain::message::{MESSAGE_TYPE_ATTRIBUTE, Message};

type PredicateFn = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum Matcher {
    /// Matches every message. Useful as the last, catch-all route.
    Any,
    AttributeEquals { key: String, value: String },
    HasAttribute(String),
    BodyPrefix(String),
    Predicate(PredicateFn),
}

impl Matcher {
    pub fn attribute_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::AttributeEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    /// `message_type` attribute equals `type_name`.
    pub fn message_type(type_name: impl Into<String>) -> Self {
        Self::attribute_equals(MESSAGE_TYPE_ATTRIBUTE, type_name)
    }

    pub fn has_attribute(key: impl Into<String>) -> Self {
        Self::HasAttribute(key.into())
    }

    pub fn body_prefix(prefix: impl Into<String>) -> Self {
        Self::BodyPrefix(prefix.into())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Self::Any => true,
            Self::AttributeEquals { key, value } => message.attribute(key) == Some(value.as_str()),
            Self::HasAttribute(key) => message.attributes.contains_key(key),
            Self::BodyPrefix(prefix) => message.body.starts_with(prefix.as_str()),
            Self::Predicate(f) => f(message),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::AttributeEquals { key, value } => write!(f, "AttributeEquals({key}={value})"),
            Self::HasAttribute(key) => write!(f, "HasAttribute({key})"),
            Self::BodyPrefix(prefix) => write!(f, "BodyPrefix({prefix:?})"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{MessageId, ReceiptHandle};
    use rstest::rstest;

    fn message() -> Message {
        Message::new(MessageId::new("m"), ReceiptHandle::new("r"), "invoice:42")
            .with_attribute("tenant", "acme")
            .with_attribute(MESSAGE_TYPE_ATTRIBUTE, "billing.invoice.v1")
    }

    #[rstest]
    #[case(Matcher::Any, true)]
    #[case(Matcher::attribute_equals("tenant", "acme"), true)]
    #[case(Matcher::attribute_equals("tenant", "globex"), false)]
    #[case(Matcher::message_type("billing.invoice.v1"), true)]
    #[case(Matcher::has_attribute("tenant"), true)]
    #[case(Matcher::has_attribute("region"), false)]
    #[case(Matcher::body_prefix("invoice:"), true)]
    #[case(Matcher::body_prefix("refund:"), false)]
    #[case(Matcher::predicate(|m| m.body.ends_with("42")), true)]
    #[case(Matcher::predicate(|m| m.receive_count > 1), false)]
    fn matcher_table(#[case] matcher: Matcher, #[case] expected: bool) {
        assert_eq!(matcher.matches(&message()), expected, "{matcher:?}");
    }
}
