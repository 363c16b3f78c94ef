//! Error types and their operational classification.

use std::time::Duration;

use thiserror::Error;

use super::task::TaskType;

/// Operational classification of an error.
///
/// - `Transient`: worth retrying (executor failure, timeout, open breaker).
/// - `Permanent`: retrying cannot help (unknown type, bad payload, misconfiguration).
/// - `Infrastructure`: the engine's own environment failed (store, memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failure reported by a [`TaskStore`](crate::ports::TaskStore) implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("duplicate task id: {0}")]
    Duplicate(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("executor failed: {0}")]
    Executor(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("memory relief timed out after {waited:?} ({percent_used:.1}% used)")]
    ResourceExhausted { percent_used: f64, waited: Duration },

    #[error("no executor registered for task_type={0}")]
    UnknownTaskType(TaskType),

    #[error("duplicate executor for task_type={0}")]
    DuplicateExecutor(TaskType),

    #[error("processor is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("payload codec: {0}")]
    Codec(String),

    #[error("queue closed")]
    QueueClosed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn executor(message: impl Into<String>) -> Self {
        EngineError::Executor(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Executor(_) | EngineError::Timeout(_) | EngineError::CircuitOpen => {
                ErrorKind::Transient
            }
            EngineError::UnknownTaskType(_)
            | EngineError::DuplicateExecutor(_)
            | EngineError::AlreadyRunning
            | EngineError::Config(_)
            | EngineError::Codec(_) => ErrorKind::Permanent,
            EngineError::ResourceExhausted { .. }
            | EngineError::QueueClosed
            | EngineError::Store(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Stable grouping key for `ProcessingStats::errors_by_type`.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Executor(_) => "executor",
            EngineError::Timeout(_) => "timeout",
            EngineError::CircuitOpen => "circuit_open",
            EngineError::ResourceExhausted { .. } => "resource_exhausted",
            EngineError::UnknownTaskType(_) => "unknown_task_type",
            EngineError::DuplicateExecutor(_) => "duplicate_executor",
            EngineError::AlreadyRunning => "already_running",
            EngineError::Config(_) => "config",
            EngineError::Codec(_) => "codec",
            EngineError::QueueClosed => "queue_closed",
            EngineError::Store(_) => "store",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::executor(EngineError::executor("boom"), ErrorKind::Transient)]
    #[case::timeout(EngineError::Timeout(Duration::from_secs(1)), ErrorKind::Transient)]
    #[case::breaker(EngineError::CircuitOpen, ErrorKind::Transient)]
    #[case::unknown(EngineError::UnknownTaskType(TaskType::Alert), ErrorKind::Permanent)]
    #[case::codec(EngineError::Codec("bad json".into()), ErrorKind::Permanent)]
    #[case::store(EngineError::Store(StoreError::Backend("down".into())), ErrorKind::Infrastructure)]
    fn errors_are_classified(#[case] err: EngineError, #[case] kind: ErrorKind) {
        assert_eq!(err.kind(), kind);
        assert_eq!(err.is_retryable(), kind == ErrorKind::Transient);
    }

    #[test]
    fn store_errors_convert() {
        let err: EngineError = StoreError::NotFound("task-x".into()).into();
        assert_eq!(err.category(), "store");
        assert!(err.to_string().contains("task-x"));
    }
}
