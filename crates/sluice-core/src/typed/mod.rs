//! Typed - 型付き executor API
//!
//! このモジュールは payload の型と TaskType の対応を型で保証し、
//! dispatch 時には型消去された executor として扱います。
//!
//! # 二層構造
//! - **表層（Typed）**: `TypedTask` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `TaskExecutor` trait - object-safe, type erasure

pub mod handler;
pub mod registry;
pub mod task;

// 主要な trait/型 を再エクスポート
pub use self::handler::{FnExecutor, Handler, TaskExecutor, TypedHandler};
pub use self::registry::ExecutorRegistry;
pub use self::task::TypedTask;
