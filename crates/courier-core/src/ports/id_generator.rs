//! IdGenerator port - ID 生成の抽象化
//!
//! Only the in-memory queue mints ids; a real queue service assigns its own.
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース、`IdMarker::prefix()` 付き

use ulid::Ulid;

use crate::domain::ids::{Id, IdMarker, MessageId, MessageTag, ReceiptHandle, ReceiptTag};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_message_id(&self) -> MessageId;

    /// A fresh handle for every delivery, redeliveries included.
    fn generate_receipt_handle(&self) -> ReceiptHandle;
}

/// UlidGenerator は Clock ベースの ULID を生成
///
/// FixedClock を使うとタイムスタンプ部分が固定される（ランダム部分は異なる）。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next<T: IdMarker>(&self) -> Id<T> {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        Id::new(format!("{}{}", T::prefix(), ulid))
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_message_id(&self) -> MessageId {
        self.next::<MessageTag>()
    }

    fn generate_receipt_handle(&self) -> ReceiptHandle {
        self.next::<ReceiptTag>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let id_gen = UlidGenerator::new(SystemClock);

        let m1 = id_gen.generate_message_id();
        let m2 = id_gen.generate_message_id();
        let r1 = id_gen.generate_receipt_handle();

        assert_ne!(m1, m2);
        assert!(m1.as_str().starts_with("msg-"));
        assert!(r1.as_str().starts_with("rh-"));
    }

    #[test]
    fn fixed_clock_pins_the_timestamp_part() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let a = id_gen.generate_receipt_handle();
        let b = id_gen.generate_receipt_handle();
        assert_ne!(a, b);

        let ulid_a = Ulid::from_string(&a.as_str()["rh-".len()..]).unwrap();
        let ulid_b = Ulid::from_string(&b.as_str()["rh-".len()..]).unwrap();
        assert_eq!(ulid_a.timestamp_ms(), ulid_b.timestamp_ms());
        assert_eq!(ulid_a.timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }
}
