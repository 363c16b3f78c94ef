//! ExecutorRegistry - executor の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{Handler, TaskExecutor, TypedHandler};
use super::task::TypedTask;
use crate::domain::{EngineError, TaskType};

/// TaskType ごとに 1 つの executor を保持
///
/// # 使用例
/// ```ignore
/// let mut registry = ExecutorRegistry::new();
/// registry.register_typed::<CheckLink, _>(LinkChecker)?;
/// registry.register(TaskType::Alert, Arc::new(my_executor))?;
///
/// let executor = registry.get(TaskType::LinkCheck);
/// ```
///
/// 起動時に組み立てて、以後は `Arc<ExecutorRegistry>` で読み取り専用に共有します。
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 二重登録は `EngineError::DuplicateExecutor`
    pub fn register(
        &mut self,
        task_type: TaskType,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<(), EngineError> {
        if self.executors.contains_key(&task_type) {
            return Err(EngineError::DuplicateExecutor(task_type));
        }
        self.executors.insert(task_type, executor);
        Ok(())
    }

    /// `Handler<T>` を TypedHandler でラップして `T::TYPE` に登録
    pub fn register_typed<T: TypedTask, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), EngineError> {
        self.register(T::TYPE, Arc::new(TypedHandler::new(handler)))
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.executors.contains_key(&task_type)
    }

    /// 登録済みの TaskType（ソート済み）
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.executors.keys().copied().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::test_support::{AlertSender, CheckLink, LinkChecker, SendAlert};

    #[test]
    fn test_register_and_get() {
        let mut registry = ExecutorRegistry::new();
        registry.register_typed::<CheckLink, _>(LinkChecker).unwrap();

        assert!(registry.get(TaskType::LinkCheck).is_some());
        assert!(registry.get(TaskType::Alert).is_none());
    }

    #[test]
    fn test_double_registration() {
        let mut registry = ExecutorRegistry::new();
        registry.register_typed::<CheckLink, _>(LinkChecker).unwrap();
        let result = registry.register_typed::<CheckLink, _>(LinkChecker);
        assert!(matches!(
            result,
            Err(EngineError::DuplicateExecutor(TaskType::LinkCheck))
        ));
    }

    #[test]
    fn test_registered_types_are_sorted() {
        let mut registry = ExecutorRegistry::new();
        registry.register_typed::<SendAlert, _>(AlertSender).unwrap();
        registry.register_typed::<CheckLink, _>(LinkChecker).unwrap();
        assert_eq!(
            registry.registered_types(),
            vec![TaskType::LinkCheck, TaskType::Alert]
        );
    }
}
