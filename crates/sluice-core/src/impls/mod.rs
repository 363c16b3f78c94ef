//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: テスト・デモ用の正本
//! - **ProcessMemoryProbe**: `/proc/self/status` の VmRSS
//! - **SimulatedMemoryProbe**: 値を手動で設定できる probe
//!
//! 永続 store は埋め込み側のクレートに置きます。

pub mod memory_store;
pub mod probe;

pub use self::memory_store::InMemoryTaskStore;
pub use self::probe::{ProcessMemoryProbe, SimulatedMemoryProbe};
