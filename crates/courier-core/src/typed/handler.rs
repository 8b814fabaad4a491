//! Handler traits - メッセージを処理して ProcessingOutcome を返す
//!
//! # 学習ポイント
//! - Object-safe trait (MessageHandler)
//! - ジェネリック trait (Handler<T>)
//! - Type erasure パターン (TypedHandler<T, H> → MessageHandler)

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::PayloadCodec;
use super::payload::Payload;
use crate::domain::message::Message;
use crate::domain::outcome::ProcessingOutcome;

/// Handles one message.
///
/// Handlers must not delete or defer the message themselves: they report an
/// outcome and the coordinator acknowledges.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> ProcessingOutcome;
}

/// Closure adapter, see [`handler_fn`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wraps an async closure taking the message by value.
///
/// ```ignore
/// registry.register(Matcher::Any, handler_fn(|m: Message| async move {
///     println!("{}", m.body);
///     ProcessingOutcome::Success
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessingOutcome> + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessingOutcome> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> ProcessingOutcome {
        (self.f)(message.clone()).await
    }
}

/// Handler は Payload 型 T を受け取る
///
/// # 使用例
/// ```ignore
/// struct OrderCreatedHandler;
///
/// #[async_trait]
/// impl Handler<OrderCreated> for OrderCreatedHandler {
///     async fn handle(&self, order: OrderCreated, _message: &Message) -> ProcessingOutcome {
///         println!("order {}", order.order_id);
///         ProcessingOutcome::Success
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `Handler<OrderCreated>` は `OrderCreated` しか受け取れない
/// - デコード失敗は FatalFailure（再試行しても直らない）
#[async_trait]
pub trait Handler<T: Payload>: Send + Sync {
    async fn handle(&self, payload: T, message: &Message) -> ProcessingOutcome;
}

/// TypedHandler<T, H> を MessageHandler として扱うためのラッパー
pub struct TypedHandler<T: Payload, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Payload, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }

    pub fn payload_type(&self) -> &'static str {
        T::TYPE
    }
}

#[async_trait]
impl<T: Payload, H: Handler<T>> MessageHandler for TypedHandler<T, H> {
    async fn handle(&self, message: &Message) -> ProcessingOutcome {
        match PayloadCodec::decode::<T>(message) {
            Ok(payload) => self.handler.handle(payload, message).await,
            Err(e) => ProcessingOutcome::fatal(format!("cannot decode {}: {e}", T::TYPE)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{MessageId, ReceiptHandle};
    use crate::domain::message::MESSAGE_TYPE_ATTRIBUTE;
    use crate::domain::outcome::OutcomeKind;
    use crate::typed::payload::fixtures::OrderCreated;

    struct RejectLargeOrders;

    #[async_trait]
    impl Handler<OrderCreated> for RejectLargeOrders {
        async fn handle(&self, order: OrderCreated, _message: &Message) -> ProcessingOutcome {
            if order.amount_cents > 10_000 {
                ProcessingOutcome::fatal("amount over limit")
            } else {
                ProcessingOutcome::success()
            }
        }
    }

    fn order_message(body: &str) -> Message {
        Message::new(MessageId::new("m"), ReceiptHandle::new("r"), body)
            .with_attribute(MESSAGE_TYPE_ATTRIBUTE, OrderCreated::TYPE)
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_delegates() {
        let handler = TypedHandler::<OrderCreated, _>::new(RejectLargeOrders);
        assert_eq!(handler.payload_type(), OrderCreated::TYPE);

        let ok = handler
            .handle(&order_message(r#"{"order_id":1,"amount_cents":500}"#))
            .await;
        assert_eq!(ok.kind(), OutcomeKind::Success);

        let big = handler
            .handle(&order_message(r#"{"order_id":2,"amount_cents":50000}"#))
            .await;
        assert_eq!(big, ProcessingOutcome::fatal("amount over limit"));
    }

    #[tokio::test]
    async fn decode_failure_is_fatal() {
        let handler = TypedHandler::<OrderCreated, _>::new(RejectLargeOrders);
        let outcome = handler.handle(&order_message(r#"{"order_id":"x"}"#)).await;
        assert_eq!(outcome.kind(), OutcomeKind::FatalFailure);
        assert!(outcome.reason().unwrap().starts_with("cannot decode test.orders.created.v1"));
    }

    #[tokio::test]
    async fn closure_handler_sees_the_message() {
        let handler = handler_fn(|m: Message| async move {
            if m.body == "ping" {
                ProcessingOutcome::success()
            } else {
                ProcessingOutcome::retryable(format!("unexpected {}", m.body))
            }
        });
        let ping = Message::new(MessageId::new("m"), ReceiptHandle::new("r"), "ping");
        assert!(handler.handle(&ping).await.is_success());

        let other = Message::new(MessageId::new("m"), ReceiptHandle::new("r"), "pong");
        assert_eq!(
            handler.handle(&other).await,
            ProcessingOutcome::retryable("unexpected pong")
        );
    }
}
