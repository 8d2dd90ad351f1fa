use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use concord_core::{Error, Result, Task, TaskStatus};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::runtime::cutoff_before;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TaskSummary {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

/// Task registry owned by one agent. Enforces the dependency rule: a task
/// stays Pending until every task it depends on is Completed.
#[derive(Clone, Default)]
pub struct TaskBoard {
    tasks: Arc<Mutex<HashMap<String, Task>>>,
}

fn unmet_dependencies(tasks: &HashMap<String, Task>, task: &Task) -> Vec<String> {
    task.dependencies
        .iter()
        .filter(|dep| {
            tasks
                .get(dep.as_str())
                .map(|t| t.status != TaskStatus::Completed)
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task. Every dependency id must already be on the board.
    pub async fn create(&self, task: Task) -> Result<Task> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.task_id) {
            return Err(Error::Validation(format!("task '{}' already exists", task.task_id)));
        }
        if task.dependencies.iter().any(|d| d == &task.task_id) {
            return Err(Error::TaskDependency(format!("task '{}' depends on itself", task.task_id)));
        }
        if let Some(missing) = task.dependencies.iter().find(|d| !tasks.contains_key(d.as_str())) {
            return Err(Error::TaskDependency(format!(
                "task '{}' depends on unknown task '{}'",
                task.task_id, missing
            )));
        }
        info!(task_id = %task.task_id, title = %task.title, deps = task.dependencies.len(), "Task created");
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        let tasks = self.tasks.lock().await;
        tasks.get(task_id).cloned()
    }

    /// Moves a task to `next`, validating the transition and the dependency rule.
    pub async fn transition(&self, task_id: &str, next: TaskStatus) -> Result<Task> {
        let mut tasks = self.tasks.lock().await;
        let current = tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        if current.status.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "task '{}' is already {}",
                task_id, current.status
            )));
        }
        if next == TaskStatus::Pending || next == current.status {
            return Err(Error::InvalidTransition(format!(
                "task '{}' cannot move from {} to {}",
                task_id, current.status, next
            )));
        }
        if current.status == TaskStatus::Pending {
            let unmet = unmet_dependencies(&tasks, current);
            if !unmet.is_empty() {
                return Err(Error::TaskDependency(format!(
                    "task '{}' is blocked by {}",
                    task_id,
                    unmet.join(", ")
                )));
            }
        }

        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        debug!(task_id = %task_id, from = %task.status, to = %next, "Task transition");
        task.status = next;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    pub async fn start(&self, task_id: &str) -> Result<Task> {
        self.transition(task_id, TaskStatus::InProgress).await
    }

    pub async fn complete(&self, task_id: &str) -> Result<Task> {
        self.transition(task_id, TaskStatus::Completed).await
    }

    pub async fn fail(&self, task_id: &str, reason: &str) -> Result<Task> {
        let task = self.transition(task_id, TaskStatus::Failed).await?;
        let mut tasks = self.tasks.lock().await;
        if let Some(t) = tasks.get_mut(task_id) {
            t.metadata.insert("error".to_string(), serde_json::Value::String(reason.to_string()));
            return Ok(t.clone());
        }
        Ok(task)
    }

    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        self.transition(task_id, TaskStatus::Cancelled).await
    }

    /// Dependency ids that are not yet Completed.
    pub async fn blocked_by(&self, task_id: &str) -> Result<Vec<String>> {
        let tasks = self.tasks.lock().await;
        let task = tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        Ok(unmet_dependencies(&tasks, task))
    }

    /// All tasks, newest first, optionally filtered by status.
    pub async fn list(&self, status_filter: Option<TaskStatus>) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        let mut result: Vec<Task> = tasks
            .values()
            .filter(|t| status_filter.map(|s| t.status == s).unwrap_or(true))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result
    }

    /// Non-terminal tasks, highest priority first.
    pub async fn open_tasks(&self) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        let mut result: Vec<Task> = tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        result
    }

    pub async fn summary(&self) -> TaskSummary {
        let tasks = self.tasks.lock().await;
        let mut summary = TaskSummary::default();
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary.total = tasks.len();
        summary
    }

    /// Removes terminal tasks older than `max_age` that no open task depends on.
    pub async fn cleanup_old_tasks(&self, max_age: std::time::Duration) -> usize {
        let Some(cutoff) = cutoff_before(max_age) else {
            return 0;
        };
        let mut tasks = self.tasks.lock().await;
        let referenced: std::collections::HashSet<String> = tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .flat_map(|t| t.dependencies.iter().cloned())
            .collect();
        let before = tasks.len();
        tasks.retain(|id, t| !t.status.is_terminal() || t.updated_at > cutoff || referenced.contains(id));
        let removed = before - tasks.len();
        if removed > 0 {
            debug!(removed, "Cleaned up old tasks");
        }
        removed
    }

    pub async fn remove(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        tasks.remove(task_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::TaskPriority;

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let board = TaskBoard::new();
        let task = Task::new("draft", "").with_dependencies(vec!["nope".to_string()]);
        let err = board.create(task).await.unwrap_err();
        assert!(matches!(err, Error::TaskDependency(_)));
        assert_eq!(board.summary().await.total, 0);
    }

    #[tokio::test]
    async fn test_dependencies_block_leaving_pending() {
        let board = TaskBoard::new();
        let research = board.create(Task::new("research", "")).await.unwrap();
        let write = board
            .create(Task::new("write", "").with_dependencies(vec![research.task_id.clone()]))
            .await
            .unwrap();

        let err = board.start(&write.task_id).await.unwrap_err();
        assert!(matches!(err, Error::TaskDependency(_)));
        assert_eq!(board.get(&write.task_id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(board.blocked_by(&write.task_id).await.unwrap(), vec![research.task_id.clone()]);

        // an in-progress dependency still blocks
        board.start(&research.task_id).await.unwrap();
        assert!(board.start(&write.task_id).await.is_err());

        board.complete(&research.task_id).await.unwrap();
        let started = board.start(&write.task_id).await.unwrap();
        assert_eq!(started.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_terminal_tasks_cannot_move() {
        let board = TaskBoard::new();
        let t = board.create(Task::new("x", "")).await.unwrap();
        board.complete(&t.task_id).await.unwrap();
        assert!(matches!(board.start(&t.task_id).await, Err(Error::InvalidTransition(_))));
        assert!(matches!(board.start("missing").await, Err(Error::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_fail_records_reason() {
        let board = TaskBoard::new();
        let t = board.create(Task::new("x", "")).await.unwrap();
        board.start(&t.task_id).await.unwrap();
        let failed = board.fail(&t.task_id, "no time").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.metadata.get("error").and_then(|v| v.as_str()), Some("no time"));
    }

    #[tokio::test]
    async fn test_open_tasks_and_summary() {
        let board = TaskBoard::new();
        board.create(Task::new("low", "").with_priority(TaskPriority::Low)).await.unwrap();
        board.create(Task::new("urgent", "").with_priority(TaskPriority::Urgent)).await.unwrap();
        let done = board.create(Task::new("done", "")).await.unwrap();
        board.complete(&done.task_id).await.unwrap();

        let open = board.open_tasks().await;
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].title, "urgent");

        let summary = board.summary().await;
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.total, 3);
        assert_eq!(board.list(Some(TaskStatus::Completed)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_referenced_dependencies() {
        let board = TaskBoard::new();
        let a = board.create(Task::new("a", "")).await.unwrap();
        let b = board.create(Task::new("b", "")).await.unwrap();
        board.complete(&a.task_id).await.unwrap();
        board.complete(&b.task_id).await.unwrap();
        board
            .create(Task::new("c", "").with_dependencies(vec![a.task_id.clone()]))
            .await
            .unwrap();

        assert_eq!(board.cleanup_old_tasks(std::time::Duration::MAX).await, 0);
        let removed = board.cleanup_old_tasks(std::time::Duration::ZERO).await;
        assert_eq!(removed, 1);
        assert!(board.get(&a.task_id).await.is_some());
        assert!(board.get(&b.task_id).await.is_none());
    }
}
