//! Typed message API
//!
//! - `Payload`: body type ↔ `message_type` の対応
//! - `MessageHandler` / `Handler<T>` / `BatchHandler`: 処理側の trait
//! - `Matcher` + `HandlerRegistry`: ルーティング（最初のマッチが勝つ）
//! - `PayloadCodec`: JSON エンコード／デコード

pub mod batch;
pub mod codec;
pub mod handler;
pub mod matcher;
pub mod payload;
pub mod registry;

pub use batch::{BatchHandler, FnBatchHandler, batch_fn};
pub use codec::{CodecError, PayloadCodec};
pub use handler::{FnHandler, Handler, MessageHandler, TypedHandler, handler_fn};
pub use matcher::Matcher;
pub use payload::Payload;
pub use registry::{HandlerRegistry, RegistryError};
