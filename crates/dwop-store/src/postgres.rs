//! Postgres-backed [`WorkflowStore`].
//!
//! Every multi-row operation is a single `sqlx` transaction opened with
//! `pool.begin()` and committed at the end of the function — never
//! emulated with separate client-side calls.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dwop_core::{
    OutboxEvent, OutboxEventType, Task, TaskRun, TaskRunStatus, TaskStatus, Workflow,
    WorkflowStatus,
};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::store::{AttemptOutcome, CompletionOutcome, PublishOutcome, StoreError, WorkflowStore};

/// A `PgPool`-backed implementation of [`WorkflowStore`].
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the crate's bundled migrations. Call once at boot.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn parse_workflow_status(s: &str) -> Result<WorkflowStatus, StoreError> {
    match s {
        "RUNNING" => Ok(WorkflowStatus::Running),
        "SUCCEEDED" => Ok(WorkflowStatus::Succeeded),
        "FAILED" => Ok(WorkflowStatus::Failed),
        "CANCELED" => Ok(WorkflowStatus::Canceled),
        other => Err(StoreError::Database(format!(
            "unknown workflow status {other:?}"
        ))),
    }
}

fn parse_task_status(s: &str) -> Result<TaskStatus, StoreError> {
    match s {
        "PENDING" => Ok(TaskStatus::Pending),
        "QUEUED" => Ok(TaskStatus::Queued),
        "RUNNING" => Ok(TaskStatus::Running),
        "SUCCEEDED" => Ok(TaskStatus::Succeeded),
        "FAILED" => Ok(TaskStatus::Failed),
        "CANCELED" => Ok(TaskStatus::Canceled),
        other => Err(StoreError::Database(format!(
            "unknown task status {other:?}"
        ))),
    }
}

fn parse_task_run_status(s: &str) -> Result<TaskRunStatus, StoreError> {
    match s {
        "RUNNING" => Ok(TaskRunStatus::Running),
        "SUCCEEDED" => Ok(TaskRunStatus::Succeeded),
        "FAILED" => Ok(TaskRunStatus::Failed),
        other => Err(StoreError::Database(format!(
            "unknown task run status {other:?}"
        ))),
    }
}

fn parse_event_type(s: &str) -> Result<OutboxEventType, StoreError> {
    match s {
        "TASK_READY" => Ok(OutboxEventType::TaskReady),
        "TASK_RETRY_READY" => Ok(OutboxEventType::TaskRetryReady),
        other => Err(StoreError::Database(format!(
            "unknown outbox event type {other:?}"
        ))),
    }
}

fn event_type_name(t: OutboxEventType) -> &'static str {
    match t {
        OutboxEventType::TaskReady => "TASK_READY",
        OutboxEventType::TaskRetryReady => "TASK_RETRY_READY",
    }
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<Task, StoreError> {
    let status: String = row.try_get("status").map_err(|e| StoreError::Database(e.to_string()))?;
    let func_arg_map_json: serde_json::Value = row
        .try_get("func_arg_map")
        .map_err(|e| StoreError::Database(e.to_string()))?;
    let func_arg_map: HashMap<String, String> =
        serde_json::from_value(func_arg_map_json).map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Task {
        task_id: row.try_get("task_id").map_err(|e| StoreError::Database(e.to_string()))?,
        workflow_id: row.try_get("workflow_id").map_err(|e| StoreError::Database(e.to_string()))?,
        name: row.try_get("name").map_err(|e| StoreError::Database(e.to_string()))?,
        code_link: row.try_get("code_link").map_err(|e| StoreError::Database(e.to_string()))?,
        predecessors: row.try_get("predecessors").map_err(|e| StoreError::Database(e.to_string()))?,
        successors: row.try_get("successors").map_err(|e| StoreError::Database(e.to_string()))?,
        func_arg_map,
        pending_preds: row.try_get("pending_preds").map_err(|e| StoreError::Database(e.to_string()))?,
        attempt: row.try_get("attempt").map_err(|e| StoreError::Database(e.to_string()))?,
        max_attempts: row.try_get("max_attempts").map_err(|e| StoreError::Database(e.to_string()))?,
        status: parse_task_status(&status)?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

fn outbox_event_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEvent, StoreError> {
    let event_type: String = row
        .try_get("event_type")
        .map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(OutboxEvent {
        event_id: row.try_get("event_id").map_err(|e| StoreError::Database(e.to_string()))?,
        task_id: row.try_get("task_id").map_err(|e| StoreError::Database(e.to_string()))?,
        workflow_id: row.try_get("workflow_id").map_err(|e| StoreError::Database(e.to_string()))?,
        event_type: parse_event_type(&event_type)?,
        payload: row.try_get("payload").map_err(|e| StoreError::Database(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Database(e.to_string()))?,
        published_at: row.try_get("published_at").map_err(|e| StoreError::Database(e.to_string()))?,
        claimed_at: row.try_get("claimed_at").map_err(|e| StoreError::Database(e.to_string()))?,
        claimed_by: row.try_get("claimed_by").map_err(|e| StoreError::Database(e.to_string()))?,
        publish_attempts: row
            .try_get("publish_attempts")
            .map_err(|e| StoreError::Database(e.to_string()))?,
        last_publish_error: row
            .try_get("last_publish_error")
            .map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

#[async_trait]
impl WorkflowStore for PostgresStore {
    #[instrument(skip(self, workflow, tasks, outbox_events))]
    async fn create_workflow_with_tasks_and_outbox(
        &self,
        workflow: Workflow,
        tasks: Vec<Task>,
        outbox_events: Vec<OutboxEvent>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflows (workflow_id, env_link, status, created_at, finished_at)
            VALUES ($1, $2, 'RUNNING', $3, NULL)
            "#,
        )
        .bind(workflow.workflow_id)
        .bind(&workflow.env_link)
        .bind(workflow.created_at)
        .execute(&mut *tx)
        .await?;

        for task in &tasks {
            let func_arg_map_json = serde_json::to_value(&task.func_arg_map)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO tasks (
                    task_id, workflow_id, name, code_link, predecessors, successors,
                    func_arg_map, pending_preds, attempt, max_attempts, status, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(task.task_id)
            .bind(task.workflow_id)
            .bind(&task.name)
            .bind(&task.code_link)
            .bind(&task.predecessors)
            .bind(&task.successors)
            .bind(func_arg_map_json)
            .bind(task.pending_preds)
            .bind(task.attempt)
            .bind(task.max_attempts)
            .bind(task.status.to_string())
            .bind(task.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for event in &outbox_events {
            insert_outbox_event(&mut tx, event).await?;
        }

        tx.commit().await?;
        debug!(workflow_id = %workflow.workflow_id, tasks = tasks.len(), root_events = outbox_events.len(), "created workflow with tasks and outbox");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_outbox_events(
        &self,
        batch_size: i64,
        claimer_id: &str,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT event_id
                FROM outbox_events
                WHERE published_at IS NULL
                  AND (claimed_at IS NULL OR claimed_at < NOW() - ($3 * INTERVAL '1 second'))
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events o
            SET claimed_at = NOW(), claimed_by = $2
            FROM claimable c
            WHERE o.event_id = c.event_id
            RETURNING o.event_id, o.task_id, o.workflow_id, o.event_type, o.payload,
                      o.created_at, o.published_at, o.claimed_at, o.claimed_by,
                      o.publish_attempts, o.last_publish_error
            "#,
        )
        .bind(batch_size)
        .bind(claimer_id)
        .bind(crate::store::CLAIM_LEASE_SECS)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim outbox events: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(outbox_event_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn complete_run_and_enqueue_successors(
        &self,
        run_id: Uuid,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let run_row = sqlx::query("SELECT status, task_id, workflow_id FROM task_runs WHERE run_id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::TaskRunNotFound(run_id))?;

        let run_status: String = run_row.try_get("status").map_err(|e| StoreError::Database(e.to_string()))?;
        if run_status == "SUCCEEDED" {
            // Already applied by a prior delivery: exactly-once effect.
            tx.commit().await?;
            return Ok(CompletionOutcome::default());
        }
        let task_id: Uuid = run_row.try_get("task_id").map_err(|e| StoreError::Database(e.to_string()))?;
        let workflow_id: Uuid = run_row
            .try_get("workflow_id")
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query("UPDATE task_runs SET status = 'SUCCEEDED' WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        let task_row = sqlx::query("SELECT * FROM tasks WHERE task_id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::TaskNotFound(task_id))?;
        let task = task_from_row(&task_row)?;

        sqlx::query("UPDATE tasks SET status = 'SUCCEEDED' WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        let mut newly_ready = Vec::new();
        for successor_name in &task.successors {
            let successor_row = sqlx::query(
                "SELECT * FROM tasks WHERE workflow_id = $1 AND name = $2 FOR UPDATE",
            )
            .bind(workflow_id)
            .bind(successor_name)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(successor_row) = successor_row else {
                continue;
            };
            let successor = task_from_row(&successor_row)?;
            let pending_preds = successor.pending_preds - 1;

            sqlx::query("UPDATE tasks SET pending_preds = $1 WHERE task_id = $2")
                .bind(pending_preds)
                .bind(successor.task_id)
                .execute(&mut *tx)
                .await?;

            if pending_preds == 0 && successor.status == TaskStatus::Pending {
                let mut ready_successor = successor.clone();
                ready_successor.pending_preds = 0;
                let event = OutboxEvent::new_task_ready(&ready_successor);
                insert_outbox_event(&mut tx, &event).await?;
                newly_ready.push(successor_name.clone());
            }
        }

        let remaining: i64 = sqlx::query(
            "SELECT COUNT(*) AS remaining FROM tasks WHERE workflow_id = $1 AND status <> 'SUCCEEDED'",
        )
        .bind(workflow_id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("remaining")
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let workflow_succeeded = remaining == 0;
        if workflow_succeeded {
            sqlx::query("UPDATE workflows SET status = 'SUCCEEDED', finished_at = NOW() WHERE workflow_id = $1 AND status = 'RUNNING'")
                .bind(workflow_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(%run_id, %task_id, newly_ready = newly_ready.len(), workflow_succeeded, "completed run");
        Ok(CompletionOutcome {
            newly_ready,
            workflow_succeeded,
        })
    }

    #[instrument(skip(self))]
    async fn increase_attempt(
        &self,
        run_id: Uuid,
        error_message: &str,
    ) -> Result<AttemptOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let run_row = sqlx::query("SELECT status, task_id, workflow_id FROM task_runs WHERE run_id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::TaskRunNotFound(run_id))?;

        let run_status: String = run_row.try_get("status").map_err(|e| StoreError::Database(e.to_string()))?;
        let task_id: Uuid = run_row.try_get("task_id").map_err(|e| StoreError::Database(e.to_string()))?;

        if run_status == "FAILED" {
            // A prior call already recorded this failure; re-derive the
            // outcome from current task state without mutating again.
            let task_row = sqlx::query("SELECT attempt, max_attempts FROM tasks WHERE task_id = $1")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(StoreError::TaskNotFound(task_id))?;
            let attempt: i32 = task_row.try_get("attempt").map_err(|e| StoreError::Database(e.to_string()))?;
            let max_attempts: i32 = task_row
                .try_get("max_attempts")
                .map_err(|e| StoreError::Database(e.to_string()))?;
            tx.commit().await?;
            return Ok(if attempt < max_attempts {
                AttemptOutcome::WillRetry { attempt }
            } else {
                AttemptOutcome::Exhausted
            });
        }

        sqlx::query("UPDATE task_runs SET status = 'FAILED', last_error = $2 WHERE run_id = $1")
            .bind(run_id)
            .bind(error_message)
            .execute(&mut *tx)
            .await?;

        let task_row = sqlx::query("SELECT * FROM tasks WHERE task_id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::TaskNotFound(task_id))?;
        let mut task = task_from_row(&task_row)?;
        task.attempt += 1;

        let outcome = if task.attempt < task.max_attempts {
            sqlx::query("UPDATE tasks SET attempt = $1 WHERE task_id = $2")
                .bind(task.attempt)
                .bind(task.task_id)
                .execute(&mut *tx)
                .await?;
            let event = OutboxEvent::new_task_retry_ready(&task);
            insert_outbox_event(&mut tx, &event).await?;
            AttemptOutcome::WillRetry {
                attempt: task.attempt,
            }
        } else {
            sqlx::query("UPDATE tasks SET attempt = $1, status = 'FAILED' WHERE task_id = $2")
                .bind(task.attempt)
                .bind(task.task_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE workflows SET status = 'FAILED', finished_at = NOW() WHERE workflow_id = $1 AND status = 'RUNNING'")
                .bind(task.workflow_id)
                .execute(&mut *tx)
                .await?;
            AttemptOutcome::Exhausted
        };

        tx.commit().await?;
        debug!(%run_id, %task_id, attempt = task.attempt, "increased attempt");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn record_publish_result(
        &self,
        event_id: Uuid,
        ok: Result<(), String>,
    ) -> Result<PublishOutcome, StoreError> {
        match ok {
            Ok(()) => {
                sqlx::query(
                    "UPDATE outbox_events SET published_at = NOW(), last_publish_error = NULL WHERE event_id = $1",
                )
                .bind(event_id)
                .execute(&self.pool)
                .await?;
                Ok(PublishOutcome::Published)
            }
            Err(err_msg) => {
                let mut tx = self.pool.begin().await?;
                let row = sqlx::query("SELECT * FROM outbox_events WHERE event_id = $1 FOR UPDATE")
                    .bind(event_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(StoreError::Database(format!("outbox event not found: {event_id}")))?;
                let event = outbox_event_from_row(&row)?;

                sqlx::query("UPDATE outbox_events SET last_publish_error = $2 WHERE event_id = $1")
                    .bind(event_id)
                    .bind(&err_msg)
                    .execute(&mut *tx)
                    .await?;

                let outcome = if event.publish_attempts > 0 {
                    let retried = event.retry_clone();
                    insert_outbox_event(&mut tx, &retried).await?;
                    PublishOutcome::Retried(retried)
                } else {
                    sqlx::query("UPDATE workflows SET status = 'CANCELED', finished_at = NOW() WHERE workflow_id = $1 AND status = 'RUNNING'")
                        .bind(event.workflow_id)
                        .execute(&mut *tx)
                        .await?;
                    PublishOutcome::AttemptsExhausted
                };

                tx.commit().await?;
                Ok(outcome)
            }
        }
    }

    #[instrument(skip(self))]
    async fn absorb_outbox_event(&self, event_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_events SET published_at = NOW(), last_publish_error = NULL WHERE event_id = $1",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        let status: String = row.try_get("status").map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Workflow {
            workflow_id: row.try_get("workflow_id").map_err(|e| StoreError::Database(e.to_string()))?,
            env_link: row.try_get("env_link").map_err(|e| StoreError::Database(e.to_string()))?,
            status: parse_workflow_status(&status)?,
            created_at: row.try_get("created_at").map_err(|e| StoreError::Database(e.to_string()))?,
            finished_at: row.try_get("finished_at").map_err(|e| StoreError::Database(e.to_string()))?,
        })
    }

    #[instrument(skip(self))]
    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_task_run(&self, run_id: Uuid) -> Result<TaskRun, StoreError> {
        let row = sqlx::query("SELECT * FROM task_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TaskRunNotFound(run_id))?;
        let status: String = row.try_get("status").map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(TaskRun {
            run_id: row.try_get("run_id").map_err(|e| StoreError::Database(e.to_string()))?,
            task_id: row.try_get("task_id").map_err(|e| StoreError::Database(e.to_string()))?,
            workflow_id: row.try_get("workflow_id").map_err(|e| StoreError::Database(e.to_string()))?,
            status: parse_task_run_status(&status)?,
            last_error: row.try_get("last_error").map_err(|e| StoreError::Database(e.to_string()))?,
            lease_owner: row.try_get("lease_owner").map_err(|e| StoreError::Database(e.to_string()))?,
            lease_until: row.try_get("lease_until").map_err(|e| StoreError::Database(e.to_string()))?,
            created_at: row.try_get("created_at").map_err(|e| StoreError::Database(e.to_string()))?,
        })
    }

    #[instrument(skip(self, run))]
    async fn upsert_task_run(&self, run: TaskRun) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_runs (run_id, task_id, workflow_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run.run_id)
        .bind(run.task_id)
        .bind(run.workflow_id)
        .bind(run.status.to_string())
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflows SET status = 'CANCELED', finished_at = NOW() WHERE workflow_id = $1 AND status = 'RUNNING'",
        )
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE workflows SET status = $2, finished_at = CASE WHEN $2 <> 'RUNNING' THEN NOW() ELSE NULL END WHERE workflow_id = $1")
            .bind(workflow_id)
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn insert_outbox_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &OutboxEvent,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events (
            event_id, task_id, workflow_id, event_type, payload, created_at,
            published_at, claimed_at, claimed_by, publish_attempts, last_publish_error
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(event.event_id)
    .bind(event.task_id)
    .bind(event.workflow_id)
    .bind(event_type_name(event.event_type))
    .bind(&event.payload)
    .bind(event.created_at)
    .bind(event.published_at)
    .bind(event.claimed_at)
    .bind(&event.claimed_by)
    .bind(event.publish_attempts)
    .bind(&event.last_publish_error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    // Integration tests against a live Postgres instance live in
    // `tests/postgres_integration.rs` and are marked `#[ignore]` — run
    // manually with a DATABASE_URL pointed at a scratch database.
}
