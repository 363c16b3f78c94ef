//! App - アプリケーション層
//!
//! 各コンポーネントを組み立てて、一つの `Engine` として提供します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: 構築とワイヤリング（起動時検証つき）
//! - **Engine**: queue・monitor・processor の共有インスタンス

pub mod builder;

pub use self::builder::{BuildError, Engine, EngineBuilder};
