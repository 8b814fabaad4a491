//! DeliveryState - one delivery's lifecycle
//!
//! # 状態遷移
//! - received: 受信済み、まだハンドラに渡していない
//! - processing: ハンドラ実行中
//! - acknowledged: delete 済み（終端）
//! - deferred: visibility を延長してキューへ返却（この配送は終了、メッセージは再配送される）
//! - dead_lettered: DLQ へ書き込み、delete 済み（終端）

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Received,
    Processing,
    Acknowledged,
    Deferred,
    DeadLettered,
}

impl DeliveryState {
    /// The message has left the source queue for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::DeadLettered)
    }

    /// This delivery is over (the message itself may come back if deferred).
    pub fn ends_delivery(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Deferred | Self::DeadLettered)
    }

    pub fn can_transition_to(self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Received, Processing)
                // dedup hit: acknowledged without running the handler
                | (Received, Acknowledged)
                // shutdown return
                | (Received, Deferred)
                | (Processing, Acknowledged)
                | (Processing, Deferred)
                | (Processing, DeadLettered)
        )
    }
}
