//! Retry-aware task model backing the agent loop's stop hook and the
//! `courier run <task>` CLI path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

/// A unit of work the agent keeps retrying until it completes or the
/// attempt budget runs out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<String>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            description: description.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: 10,
            created_at: Utc::now(),
            completed_at: None,
            last_error: None,
            result: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Begin an attempt — bumps the attempt counter.
    pub fn mark_in_progress(&mut self) {
        self.status = TaskStatus::InProgress;
        self.attempts += 1;
    }

    pub fn mark_completed(&mut self, result: Option<String>) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = result;
    }

    /// Record a failed attempt. The task stays retriable until the
    /// attempt budget is exhausted.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        if self.attempts >= self.max_attempts {
            self.status = TaskStatus::Failed;
        } else {
            self.status = TaskStatus::Pending;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn can_retry(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Failed)
            && self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_retriable() {
        let task = Task::new("write a poem");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.can_retry());
        assert!(!task.is_complete());
    }

    #[test]
    fn failure_before_budget_returns_to_pending() {
        let mut task = Task::new("flaky").with_max_attempts(3);
        task.mark_in_progress();
        task.mark_failed("boom");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.can_retry());
    }

    #[test]
    fn failure_at_budget_is_terminal() {
        let mut task = Task::new("doomed").with_max_attempts(2);
        for _ in 0..2 {
            task.mark_in_progress();
            task.mark_failed("boom");
        }
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.can_retry());
    }

    #[test]
    fn completion_records_result() {
        let mut task = Task::new("easy");
        task.mark_in_progress();
        task.mark_completed(Some("done".into()));
        assert!(task.is_complete());
        assert_eq!(task.result.as_deref(), Some("done"));
        assert!(task.completed_at.is_some());
    }
}
