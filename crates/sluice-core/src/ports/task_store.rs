//! TaskStore port - task 行の正本（source of truth）
//!
//! TaskQueue が唯一の書き手です。store 自体は状態遷移の意味を知らず、
//! フィルタ・並び順・件数だけを提供します。
//!
//! # 実装
//! - `impls::memory_store::InMemoryTaskStore`（テスト・デモ用）
//! - 永続 store は埋め込み側が実装する

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{StoreError, Task, TaskId, TaskStatus};

/// 行の絞り込み条件。全条件の AND。`None` の条件は無視される。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub statuses: Option<Vec<TaskStatus>>,
    /// `scheduled_for` が未設定、または `<=` この時刻。
    pub eligible_at: Option<DateTime<Utc>>,
    /// 終端時刻（`completed_at`、無ければ `updated_at`）が `<=` この時刻。
    pub terminal_until: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_statuses(statuses: &[TaskStatus]) -> Self {
        Self {
            statuses: Some(statuses.to_vec()),
            ..Self::default()
        }
    }

    /// Pending / Retrying（予定時刻は問わない）。
    pub fn waiting() -> Self {
        Self::with_statuses(&[TaskStatus::Pending, TaskStatus::Retrying])
    }

    /// Pending / Retrying で実行可能時刻に達したもの。
    pub fn eligible(now: DateTime<Utc>) -> Self {
        Self {
            statuses: Some(vec![TaskStatus::Pending, TaskStatus::Retrying]),
            eligible_at: Some(now),
            ..Self::default()
        }
    }

    pub fn terminal_until(cutoff: DateTime<Utc>) -> Self {
        Self {
            statuses: Some(vec![TaskStatus::Completed, TaskStatus::Failed]),
            terminal_until: Some(cutoff),
            ..Self::default()
        }
    }

    pub fn stale_in_progress(cutoff: DateTime<Utc>) -> Self {
        Self {
            statuses: Some(vec![TaskStatus::InProgress]),
            updated_before: Some(cutoff),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.statuses
            && !statuses.contains(&task.status)
        {
            return false;
        }
        if let Some(at) = self.eligible_at
            && task.scheduled_for.is_some_and(|s| s > at)
        {
            return false;
        }
        if let Some(cutoff) = self.terminal_until
            && task.completed_at.unwrap_or(task.updated_at) > cutoff
        {
            return false;
        }
        if let Some(cutoff) = self.updated_before
            && task.updated_at >= cutoff
        {
            return false;
        }
        true
    }
}

/// scheduler の選択順: priority 降順 → created_at 昇順 → id 昇順
pub fn scheduling_order(a: &Task, b: &Task) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 新規行。同じ id が既にあれば `StoreError::Duplicate`。
    async fn insert(&self, task: Task) -> Result<(), StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// `scheduling_order` 順で最大 `limit` 件。
    async fn select(&self, filter: &TaskFilter, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// id で全置換。行が無ければ `StoreError::NotFound`。
    async fn update(&self, task: Task) -> Result<(), StoreError>;

    /// 削除件数を返す。
    async fn delete(&self, filter: &TaskFilter) -> Result<usize, StoreError>;

    async fn count(&self, filter: &TaskFilter) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Priority, TaskType};
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn task(priority: Priority) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            TaskType::Cleanup,
            serde_json::Value::Null,
            priority,
            3,
            t0(),
        )
    }

    #[rstest]
    #[case(TaskStatus::Pending, true)]
    #[case(TaskStatus::Retrying, true)]
    #[case(TaskStatus::InProgress, false)]
    #[case(TaskStatus::Completed, false)]
    fn eligible_filter_checks_status(#[case] status: TaskStatus, #[case] expected: bool) {
        let mut t = task(Priority::Low);
        t.status = status;
        assert_eq!(TaskFilter::eligible(t0()).matches(&t), expected);
    }

    #[test]
    fn eligible_filter_respects_schedule() {
        let mut t = task(Priority::Low);
        t.scheduled_for = Some(t0() + Duration::seconds(1));
        assert!(!TaskFilter::eligible(t0()).matches(&t));
        assert!(TaskFilter::eligible(t0() + Duration::seconds(1)).matches(&t));
    }

    #[test]
    fn terminal_filter_uses_completion_time() {
        let mut t = task(Priority::Low);
        t.mark_completed(t0());
        assert!(!TaskFilter::terminal_until(t0() - Duration::milliseconds(1)).matches(&t));
        assert!(TaskFilter::terminal_until(t0()).matches(&t));
    }

    #[test]
    fn order_is_priority_then_age() {
        let high = task(Priority::High);
        let mut older_low = task(Priority::Low);
        older_low.created_at = t0() - Duration::hours(1);
        let low = task(Priority::Low);

        let mut tasks = vec![low.clone(), high.clone(), older_low.clone()];
        tasks.sort_by(scheduling_order);
        let ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high.id, older_low.id, low.id]);
    }
}
