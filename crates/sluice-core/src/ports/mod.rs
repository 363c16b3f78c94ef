//! Ports - 抽象化レイヤー
//!
//! engine が外部に依存する箇所（task の永続化、時刻、ID、メモリ計測）を
//! trait として定義します。実装は `impls` か埋め込み側に置きます。

pub mod clock;
pub mod id_generator;
pub mod memory_probe;
pub mod task_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::memory_probe::MemoryProbe;
pub use self::task_store::{TaskFilter, TaskStore, scheduling_order};
