//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: 単調増加 ULID（同一ミリ秒内でも生成順にソートされる）

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::warn;
use ulid::{Generator, Ulid};

use crate::domain::ids::{BatchId, TaskId};
use crate::ports::Clock;

/// IdGenerator は task / batch の ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数の consumer から使える）
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_batch_id(&self) -> BatchId;
}

/// UlidGenerator は Clock の時刻で ULID を生成
///
/// 同じミリ秒内では random 部分をインクリメントするので、生成順と
/// ソート順が一致します（scheduler の FIFO タイブレークに使う）。
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
    inner: Mutex<Generator>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Generator::new()),
        }
    }

    fn next_ulid(&self) -> Ulid {
        let now = self.clock.now();
        let at = SystemTime::from(now);
        let mut generator = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match generator.generate_from_datetime(at) {
            Ok(ulid) => ulid,
            Err(err) => {
                // random part exhausted within one millisecond
                warn!(error = %err, "monotonic ulid overflow; falling back to random ulid");
                Ulid::from_parts(now.timestamp_millis().max(0) as u64, rand::random())
            }
        }
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_batch_id(&self) -> BatchId {
        BatchId::from(self.next_ulid())
    }
}
