//! [`WorkflowStore`] trait definition.

use async_trait::async_trait;
use dwop_core::{OutboxEvent, Task, TaskRun, Workflow, WorkflowStatus};
use uuid::Uuid;

/// Bound on how long a claimed-but-unpublished outbox event is considered
/// owned by its claimer. A claimer that crashes between
/// [`WorkflowStore::claim_outbox_events`] and recording a publish result
/// leaves the row `claimed_at`-set / `published_at`-NULL; once this lease
/// expires the row is claimable again by anyone (spec.md §4.2's "claim is
/// expired by a server-side TTL").
pub const CLAIM_LEASE_SECS: i64 = 60;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("task run not found: {0}")]
    TaskRunNotFound(Uuid),

    #[error("workflow_id or task_id collision while creating workflow")]
    IdCollision,

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // Postgres unique_violation
            if db_err.code().as_deref() == Some("23505") {
                return StoreError::IdCollision;
            }
        }
        StoreError::Database(err.to_string())
    }
}

/// Outcome of [`WorkflowStore::complete_run_and_enqueue_successors`], useful
/// for logging and for tests asserting on successor-enablement.
#[derive(Debug, Clone, Default)]
pub struct CompletionOutcome {
    /// Successor task names whose `pending_preds` just reached zero and
    /// who therefore got a fresh `TASK_READY` event.
    pub newly_ready: Vec<String>,
    /// Whether this call caused the owning workflow to reach SUCCEEDED.
    pub workflow_succeeded: bool,
}

/// Outcome of [`WorkflowStore::increase_attempt`].
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// A `TASK_RETRY_READY` event was enqueued; the task stays PENDING.
    WillRetry { attempt: i32 },
    /// Attempts were exhausted; task and workflow are now FAILED.
    Exhausted,
}

/// Outcome of [`WorkflowStore::record_publish_result`].
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    /// The event was marked published.
    Published,
    /// Publish failed with attempts remaining; a new event row was
    /// inserted to retry and is returned so the caller can hand it
    /// straight back to the publisher.
    Retried(OutboxEvent),
    /// Publish failed with no attempts remaining; the owning workflow was
    /// transitioned to CANCELED.
    AttemptsExhausted,
}

/// Atomic RPCs over the DAG, plus the supporting reads the rest of the
/// pipeline needs. The four operations named in the module-level docs on
/// each method MUST be implemented as a single database transaction —
/// emulating them with multiple client calls breaks the "pending_preds
/// only ever reaches zero once" invariant and can lose successor
/// enablement under concurrent completions.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    /// Insert the workflow row, all task rows, and one `TASK_READY` outbox
    /// event per caller-supplied root-task event, then set the workflow's
    /// status to RUNNING — all in one transaction. A `workflow_id` or
    /// `task_id` collision fails the whole operation with
    /// [`StoreError::IdCollision`].
    async fn create_workflow_with_tasks_and_outbox(
        &self,
        workflow: Workflow,
        tasks: Vec<Task>,
        outbox_events: Vec<OutboxEvent>,
    ) -> Result<(), StoreError>;

    /// Atomically select up to `batch_size` events where
    /// `published_at IS NULL AND (claimed_at IS NULL OR claimed_at` is older
    /// than [`CLAIM_LEASE_SECS`]), mark them `claimed_at = now,
    /// claimed_by = claimer_id`, and return them. Two concurrent callers
    /// never receive the same event.
    async fn claim_outbox_events(
        &self,
        batch_size: i64,
        claimer_id: &str,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Mark the TaskRun and its Task SUCCEEDED, decrement `pending_preds`
    /// on every successor, enqueue `TASK_READY` for any successor that just
    /// reached zero pending preds while PENDING, and mark the workflow
    /// SUCCEEDED if every task in it is now SUCCEEDED. Calling this twice
    /// for the same `run_id` is a no-op after the first success.
    async fn complete_run_and_enqueue_successors(
        &self,
        run_id: Uuid,
    ) -> Result<CompletionOutcome, StoreError>;

    /// Mark the TaskRun FAILED with `last_error`, increment the owning
    /// task's `attempt`. If attempts remain, enqueue `TASK_RETRY_READY` and
    /// leave the task PENDING; otherwise mark the task and its workflow
    /// FAILED. Idempotent per `run_id`.
    async fn increase_attempt(
        &self,
        run_id: Uuid,
        error_message: &str,
    ) -> Result<AttemptOutcome, StoreError>;

    /// Mark a claimed-but-unpublished event `published_at = now` (the
    /// success path) or, on failure, clone it with a fresh id and a
    /// decremented `publish_attempts` budget while leaving the original as
    /// a tombstone. `ok` distinguishes which happened.
    async fn record_publish_result(
        &self,
        event_id: Uuid,
        ok: Result<(), String>,
    ) -> Result<PublishOutcome, StoreError>;

    /// Mark an event published without writing to the broker — used when
    /// the owning workflow is no longer RUNNING (the absorb path).
    async fn absorb_outbox_event(&self, event_id: Uuid) -> Result<(), StoreError>;

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError>;
    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError>;
    async fn get_task_run(&self, run_id: Uuid) -> Result<TaskRun, StoreError>;

    /// Insert a fresh TaskRun for `(task_id, workflow_id)`. Returns `false`
    /// (no row inserted) when `run_id` already exists — the dispatcher's
    /// duplicate-delivery guard.
    async fn upsert_task_run(&self, run: TaskRun) -> Result<bool, StoreError>;

    /// Set a workflow's status to CANCELED. Idempotent: canceling an
    /// already-terminal workflow is a no-op, not an error.
    async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<(), StoreError>;

    async fn set_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
    ) -> Result<(), StoreError>;
}
