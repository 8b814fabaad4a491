//! Payload trait - 型付きメッセージ本文の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Payload は `message_type` 属性と本文の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderCreated {
///     order_id: u64,
/// }
///
/// impl Payload for OrderCreated {
///     const TYPE: &'static str = "shop.orders.created.v1";
/// }
/// ```
///
/// The body travels as JSON; `TYPE` travels in the `message_type` attribute.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// # 命名規約
    /// - `{namespace}.{domain}.{event}.v{major}`
    const TYPE: &'static str;
}
