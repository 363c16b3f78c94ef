//! Handler trait - task を実行する executor の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (TaskExecutor)
//! - Type erasure パターン (TypedHandler<T, H> → TaskExecutor)

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::task::TypedTask;
use crate::domain::EngineError;

/// TaskExecutor は object-safe な executor の抽象化
///
/// registry は `HashMap<TaskType, Arc<dyn TaskExecutor>>` で保持します。
/// payload は JSON のまま渡され、結果も JSON で返します。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, payload: &Value) -> Result<Value, EngineError>;
}

/// Handler は型付き payload を受け取って実行する
///
/// # 使用例
/// ```ignore
/// struct LinkChecker;
///
/// #[async_trait]
/// impl Handler<CheckLink> for LinkChecker {
///     async fn handle(&self, task: CheckLink) -> Result<Value, EngineError> {
///         Ok(json!({ "url": task.url, "status": 200 }))
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `Handler<CheckLink>` は `CheckLink` しか受け取れない
/// - 登録時に TaskType と Handler の対応がコンパイル時に決まる
#[async_trait]
pub trait Handler<T: TypedTask>: Send + Sync {
    async fn handle(&self, task: T) -> Result<Value, EngineError>;
}

/// `Handler<T>` を `TaskExecutor` に変換するラッパー
///
/// decode できない payload は `EngineError::Codec`（Permanent）になるので、
/// retry されずに Failed になります。
pub struct TypedHandler<T: TypedTask, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TypedTask, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TypedTask, H: Handler<T>> TaskExecutor for TypedHandler<T, H> {
    async fn execute(&self, payload: &Value) -> Result<Value, EngineError> {
        let task: T = serde_json::from_value(payload.clone())
            .map_err(|e| EngineError::Codec(format!("{}: {e}", T::TYPE)))?;
        self.handler.handle(task).await
    }
}

/// クロージャを TaskExecutor にするアダプタ
///
/// ```ignore
/// registry.register(TaskType::Alert, Arc::new(FnExecutor::new(|payload| async move {
///     Ok(payload)
/// })))?;
/// ```
pub struct FnExecutor<F> {
    f: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, EngineError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, EngineError>> + Send,
{
    async fn execute(&self, payload: &Value) -> Result<Value, EngineError> {
        (self.f)(payload.clone()).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domain::TaskType;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CheckLink {
        pub url: String,
    }

    impl TypedTask for CheckLink {
        const TYPE: TaskType = TaskType::LinkCheck;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SendAlert {
        pub channel: String,
        pub message: String,
    }

    impl TypedTask for SendAlert {
        const TYPE: TaskType = TaskType::Alert;
    }

    pub struct LinkChecker;

    #[async_trait]
    impl Handler<CheckLink> for LinkChecker {
        async fn handle(&self, task: CheckLink) -> Result<Value, EngineError> {
            if task.url.is_empty() {
                return Err(EngineError::executor("empty url"));
            }
            Ok(serde_json::json!({ "url": task.url, "status": 200 }))
        }
    }

    pub struct AlertSender;

    #[async_trait]
    impl Handler<SendAlert> for AlertSender {
        async fn handle(&self, task: SendAlert) -> Result<Value, EngineError> {
            Ok(serde_json::json!({ "delivered_to": task.channel }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let executor = TypedHandler::<CheckLink, _>::new(LinkChecker);
        let out = executor
            .execute(&json!({ "url": "https://example.com" }))
            .await
            .unwrap();
        assert_eq!(out["status"], 200);
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_permanent_codec_error() {
        let executor = TypedHandler::<CheckLink, _>::new(LinkChecker);
        let err = executor.execute(&json!({ "link": 1 })).await.unwrap_err();
        assert!(matches!(err, EngineError::Codec(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn handler_errors_pass_through() {
        let executor = TypedHandler::<CheckLink, _>::new(LinkChecker);
        let err = executor.execute(&json!({ "url": "" })).await.unwrap_err();
        assert!(matches!(err, EngineError::Executor(_)));
    }

    #[tokio::test]
    async fn fn_executor_runs_closure() {
        let executor = FnExecutor::new(|payload: Value| async move { Ok(json!({ "echo": payload })) });
        let out = executor.execute(&json!(7)).await.unwrap();
        assert_eq!(out, json!({ "echo": 7 }));
    }
}
