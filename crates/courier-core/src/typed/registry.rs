//! HandlerRegistry - matcher → handler のルーティング表
//!
//! # 学習ポイント
//! - Vec での順序付きルート（最初にマッチしたものが勝つ）
//! - Generic methods での登録と型消去
//! - Arc による共有所有権

use std::sync::Arc;

use super::batch::{BatchHandler, align_outcomes};
use super::handler::{Handler, MessageHandler, TypedHandler};
use super::matcher::Matcher;
use super::payload::Payload;
use crate::domain::message::Message;
use crate::domain::outcome::ProcessingOutcome;

/// RegistryError は HandlerRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for message type '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Clone)]
enum RouteTarget {
    Single(Arc<dyn MessageHandler>),
    Batch(Arc<dyn BatchHandler>),
}

#[derive(Clone)]
struct Route {
    matcher: Matcher,
    target: RouteTarget,
    /// Set for routes registered through `register_typed`.
    payload_type: Option<&'static str>,
}

/// Ordered list of (matcher, handler) routes.
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register_typed::<OrderCreated, _>(OrderCreatedHandler)?;
/// registry.register(Matcher::body_prefix("ping"), handler_fn(|_| async { ProcessingOutcome::Success }));
/// registry.register(Matcher::Any, FallbackHandler);
/// ```
///
/// Routes are tried in registration order; the first match wins. A message
/// no route matches gets `FatalFailure` and is dead-lettered.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    routes: Vec<Route>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: MessageHandler + 'static>(&mut self, matcher: Matcher, handler: H) {
        self.register_arc(matcher, Arc::new(handler));
    }

    pub fn register_arc(&mut self, matcher: Matcher, handler: Arc<dyn MessageHandler>) {
        self.routes.push(Route {
            matcher,
            target: RouteTarget::Single(handler),
            payload_type: None,
        });
    }

    /// Routes messages whose `message_type` is `T::TYPE` to `handler`,
    /// JSON-decoding the body.
    pub fn register_typed<T: Payload, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        if self.routes.iter().any(|r| r.payload_type == Some(T::TYPE)) {
            return Err(RegistryError::AlreadyRegistered(T::TYPE.to_string()));
        }
        self.routes.push(Route {
            matcher: Matcher::message_type(T::TYPE),
            target: RouteTarget::Single(Arc::new(TypedHandler::<T, H>::new(handler))),
            payload_type: Some(T::TYPE),
        });
        Ok(())
    }

    /// Messages matching `matcher` within one received batch are handed to
    /// `handler` together.
    pub fn register_batch<H: BatchHandler + 'static>(&mut self, matcher: Matcher, handler: H) {
        self.routes.push(Route {
            matcher,
            target: RouteTarget::Batch(Arc::new(handler)),
            payload_type: None,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.routes.iter().filter_map(|r| r.payload_type).collect()
    }

    /// Index of the first route matching `message`.
    pub fn route_for(&self, message: &Message) -> Option<usize> {
        self.routes.iter().position(|r| r.matcher.matches(message))
    }

    pub fn is_batch_route(&self, route: usize) -> bool {
        matches!(
            self.routes.get(route).map(|r| &r.target),
            Some(RouteTarget::Batch(_))
        )
    }

    /// Runs the first matching handler.
    pub async fn dispatch(&self, message: &Message) -> ProcessingOutcome {
        match self.route_for(message) {
            Some(route) => self.dispatch_to(route, message).await,
            None => unmatched(message),
        }
    }

    /// Runs the handler of `route` for one message. A batch route gets a
    /// batch of one.
    pub async fn dispatch_to(&self, route: usize, message: &Message) -> ProcessingOutcome {
        let Some(route) = self.routes.get(route) else {
            return unmatched(message);
        };
        match &route.target {
            RouteTarget::Single(handler) => handler.handle(message).await,
            RouteTarget::Batch(handler) => {
                let batch = std::slice::from_ref(message);
                let outcomes = align_outcomes(handler.handle_batch(batch).await, 1);
                outcomes
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| ProcessingOutcome::retryable("batch handler returned nothing"))
            }
        }
    }

    /// Runs the handler of `route` for a batch of messages and returns one
    /// outcome per message.
    pub async fn dispatch_batch(&self, route: usize, messages: &[Message]) -> Vec<ProcessingOutcome> {
        let Some(route) = self.routes.get(route) else {
            return messages.iter().map(unmatched).collect();
        };
        match &route.target {
            RouteTarget::Batch(handler) => {
                align_outcomes(handler.handle_batch(messages).await, messages.len())
            }
            RouteTarget::Single(handler) => {
                let mut outcomes = Vec::with_capacity(messages.len());
                for message in messages {
                    outcomes.push(handler.handle(message).await);
                }
                outcomes
            }
        }
    }
}

fn unmatched(message: &Message) -> ProcessingOutcome {
    ProcessingOutcome::fatal(format!(
        "no handler matched message {} (message_type: {})",
        message.id,
        message.message_type().unwrap_or("<none>")
    ))
}
