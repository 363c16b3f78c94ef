//! Domain model (IDs, tasks, results, run statistics, errors).
//!
//! このモジュールは I/O を持たない純粋な型だけを置きます。
//! 状態遷移は `Task` のメソッド経由でのみ行います。

pub mod errors;
pub mod ids;
pub mod result;
pub mod state;
pub mod stats;
pub mod task;

pub use self::errors::{EngineError, ErrorKind, StoreError};
pub use self::ids::{BatchId, Id, IdMarker, TaskId};
pub use self::result::{BatchResult, ResourceUsage, TaskResult};
pub use self::state::TaskStatus;
pub use self::stats::{ChunkError, FailedItem, MemoryStats, ProcessingStats};
pub use self::task::{EnqueueOptions, Priority, Task, TaskType};
