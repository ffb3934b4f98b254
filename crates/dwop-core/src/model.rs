//! Entities: [`Workflow`], [`Task`], [`TaskRun`], [`OutboxEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default bound on per-task retry attempts.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Default publish-retry budget for a freshly created outbox event.
pub const DEFAULT_PUBLISH_ATTEMPTS: i32 = 5;

/// Signed-URL time-to-live, in seconds. Shared by every bucket.
pub const SIGNED_URL_TTL_SECS: i64 = 108_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Canceled => write!(f, "CANCELED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Queued => write!(f, "QUEUED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Canceled => write!(f, "CANCELED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskRunStatus {
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for TaskRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxEventType {
    TaskReady,
    TaskRetryReady,
}

/// A submitted workflow. `status` is the single source of truth for
/// whether further task execution may be dispatched — see invariant 3
/// (no broker publish for a non-RUNNING workflow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: Uuid,
    /// Storage path to the requirements blob (`Workflow_Env/<workflow_id>/env`).
    pub env_link: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(workflow_id: Uuid, env_link: impl Into<String>) -> Self {
        Self {
            workflow_id,
            env_link: env_link.into(),
            status: WorkflowStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// A node in the DAG. `pending_preds` is maintained by the store, never by
/// the caller, once the workflow has been persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub code_link: String,
    pub predecessors: Vec<String>,
    pub successors: Vec<String>,
    /// predecessor task name -> local parameter name
    pub func_arg_map: std::collections::HashMap<String, String>,
    pub pending_preds: i32,
    pub attempt: i32,
    pub max_attempts: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// A task is ready to dispatch once every predecessor has succeeded and
    /// it hasn't already been claimed.
    pub fn is_ready(&self) -> bool {
        self.pending_preds == 0 && self.status == TaskStatus::Pending
    }
}

/// A single execution attempt of a [`Task`]. `run_id` is the idempotency
/// key for dispatch: the dispatcher upserts on `run_id` so a duplicate
/// broker delivery never creates a second cluster Job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub status: TaskRunStatus,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn new(run_id: Uuid, task_id: Uuid, workflow_id: Uuid) -> Self {
        Self {
            run_id,
            task_id,
            workflow_id,
            status: TaskRunStatus::Running,
            last_error: None,
            lease_owner: None,
            lease_until: None,
            created_at: Utc::now(),
        }
    }
}

/// Durable row meaning "this task is ready to dispatch" — see the glossary.
/// The payload is the JSON the broker publisher sends verbatim as the
/// message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_id: Uuid,
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub event_type: OutboxEventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub publish_attempts: i32,
    pub last_publish_error: Option<String>,
}

impl OutboxEvent {
    pub fn new_task_ready(task: &Task) -> Self {
        Self::new(task, OutboxEventType::TaskReady)
    }

    pub fn new_task_retry_ready(task: &Task) -> Self {
        Self::new(task, OutboxEventType::TaskRetryReady)
    }

    fn new(task: &Task, event_type: OutboxEventType) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            task_id: task.task_id,
            workflow_id: task.workflow_id,
            event_type,
            payload: serde_json::json!({
                "task_id": task.task_id,
                "workflow_id": task.workflow_id,
                "task_name": task.name,
            }),
            created_at: Utc::now(),
            published_at: None,
            claimed_at: None,
            claimed_by: None,
            publish_attempts: DEFAULT_PUBLISH_ATTEMPTS,
            last_publish_error: None,
        }
    }

    /// Clone this event into a fresh row for a publish retry: new
    /// `event_id`, decremented budget, reset claim — the original row is
    /// left in place as a tombstone against double-processing.
    pub fn retry_clone(&self) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            task_id: self.task_id,
            workflow_id: self.workflow_id,
            event_type: OutboxEventType::TaskRetryReady,
            payload: self.payload.clone(),
            created_at: Utc::now(),
            published_at: None,
            claimed_at: None,
            claimed_by: None,
            publish_attempts: self.publish_attempts - 1,
            last_publish_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            task_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            name: "a".into(),
            code_link: "Task_Code/x/code".into(),
            predecessors: vec![],
            successors: vec![],
            func_arg_map: Default::default(),
            pending_preds: 0,
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ready_task_has_zero_pending_preds_and_is_pending() {
        let task = sample_task();
        assert!(task.is_ready());
    }

    #[test]
    fn task_with_pending_preds_is_not_ready() {
        let mut task = sample_task();
        task.pending_preds = 1;
        assert!(!task.is_ready());
    }

    #[test]
    fn queued_task_is_not_ready_even_with_zero_pending_preds() {
        let mut task = sample_task();
        task.status = TaskStatus::Queued;
        assert!(!task.is_ready());
    }

    #[test]
    fn retry_clone_gets_fresh_event_id_and_decremented_budget() {
        let task = sample_task();
        let original = OutboxEvent::new_task_ready(&task);
        let retried = original.retry_clone();
        assert_ne!(original.event_id, retried.event_id);
        assert_eq!(retried.publish_attempts, original.publish_attempts - 1);
        assert_eq!(retried.event_type, OutboxEventType::TaskRetryReady);
        assert!(retried.claimed_at.is_none());
    }

    #[test]
    fn workflow_terminal_status() {
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(WorkflowStatus::Succeeded.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Canceled.is_terminal());
    }
}
