//! TypedTask trait - 型付き payload と TaskType の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::TaskType;

/// payload 型と TaskType を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct CheckLink {
///     url: String,
/// }
///
/// impl TypedTask for CheckLink {
///     const TYPE: TaskType = TaskType::LinkCheck;
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: `TaskQueue::enqueue_typed` で payload にするため
/// - `DeserializeOwned`: executor 側で payload から復元するため
/// - `Send + Sync + 'static`: Arc に格納して consumer 間で共有するため
pub trait TypedTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: TaskType;
}
