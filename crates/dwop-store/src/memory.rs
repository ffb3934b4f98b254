//! In-memory [`WorkflowStore`] for unit tests — same semantics as
//! [`crate::postgres::PostgresStore`], no database required.

use std::collections::HashMap;

use async_trait::async_trait;
use dwop_core::{
    OutboxEvent, Task, TaskRun, TaskRunStatus, TaskStatus, Workflow, WorkflowStatus,
};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::store::{
    AttemptOutcome, CompletionOutcome, PublishOutcome, StoreError, WorkflowStore, CLAIM_LEASE_SECS,
};

#[derive(Default)]
struct State {
    workflows: HashMap<Uuid, Workflow>,
    tasks: HashMap<Uuid, Task>,
    task_names: HashMap<(Uuid, String), Uuid>,
    task_runs: HashMap<Uuid, TaskRun>,
    outbox: HashMap<Uuid, OutboxEvent>,
}

/// A `parking_lot::RwLock`-guarded in-memory store. Not for production —
/// built for fast, deterministic unit tests of the dispatch pipeline.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    pub fn workflow_count(&self) -> usize {
        self.state.read().workflows.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn create_workflow_with_tasks_and_outbox(
        &self,
        mut workflow: Workflow,
        tasks: Vec<Task>,
        outbox_events: Vec<OutboxEvent>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.workflows.contains_key(&workflow.workflow_id) {
            return Err(StoreError::IdCollision);
        }
        for task in &tasks {
            if state.tasks.contains_key(&task.task_id) {
                return Err(StoreError::IdCollision);
            }
        }
        workflow.status = WorkflowStatus::Running;
        state.workflows.insert(workflow.workflow_id, workflow);
        for task in tasks {
            state
                .task_names
                .insert((task.workflow_id, task.name.clone()), task.task_id);
            state.tasks.insert(task.task_id, task);
        }
        for event in outbox_events {
            state.outbox.insert(event.event_id, event);
        }
        Ok(())
    }

    async fn claim_outbox_events(
        &self,
        batch_size: i64,
        claimer_id: &str,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut state = self.state.write();
        let lease_cutoff = chrono::Utc::now() - chrono::Duration::seconds(CLAIM_LEASE_SECS);
        let mut ids: Vec<Uuid> = state
            .outbox
            .values()
            .filter(|e| {
                e.published_at.is_none()
                    && e.claimed_at.map_or(true, |claimed_at| claimed_at < lease_cutoff)
            })
            .map(|e| e.event_id)
            .collect();
        ids.sort_by_key(|id| state.outbox[id].created_at);
        ids.truncate(batch_size.max(0) as usize);

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let event = state.outbox.get_mut(&id).unwrap();
            event.claimed_at = Some(chrono::Utc::now());
            event.claimed_by = Some(claimer_id.to_string());
            claimed.push(event.clone());
        }
        Ok(claimed)
    }

    async fn complete_run_and_enqueue_successors(
        &self,
        run_id: Uuid,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut state = self.state.write();
        let run = state
            .task_runs
            .get(&run_id)
            .ok_or(StoreError::TaskRunNotFound(run_id))?
            .clone();
        if run.status == TaskRunStatus::Succeeded {
            return Ok(CompletionOutcome::default());
        }
        state.task_runs.get_mut(&run_id).unwrap().status = TaskRunStatus::Succeeded;

        let task = state
            .tasks
            .get(&run.task_id)
            .ok_or(StoreError::TaskNotFound(run.task_id))?
            .clone();
        state.tasks.get_mut(&run.task_id).unwrap().status = TaskStatus::Succeeded;

        let mut newly_ready = Vec::new();
        for successor_name in &task.successors {
            let Some(&successor_id) = state
                .task_names
                .get(&(run.workflow_id, successor_name.clone()))
            else {
                continue;
            };
            let successor = state.tasks.get_mut(&successor_id).unwrap();
            successor.pending_preds -= 1;
            if successor.pending_preds == 0 && successor.status == TaskStatus::Pending {
                let event = OutboxEvent::new_task_ready(successor);
                state.outbox.insert(event.event_id, event);
                newly_ready.push(successor_name.clone());
            }
        }

        let all_succeeded = state
            .tasks
            .values()
            .filter(|t| t.workflow_id == run.workflow_id)
            .all(|t| t.status == TaskStatus::Succeeded);
        let workflow_succeeded = all_succeeded;
        if workflow_succeeded {
            if let Some(w) = state.workflows.get_mut(&run.workflow_id) {
                if w.status == WorkflowStatus::Running {
                    w.status = WorkflowStatus::Succeeded;
                    w.finished_at = Some(chrono::Utc::now());
                }
            }
        }

        Ok(CompletionOutcome {
            newly_ready,
            workflow_succeeded,
        })
    }

    async fn increase_attempt(
        &self,
        run_id: Uuid,
        error_message: &str,
    ) -> Result<AttemptOutcome, StoreError> {
        let mut state = self.state.write();
        let run = state
            .task_runs
            .get(&run_id)
            .ok_or(StoreError::TaskRunNotFound(run_id))?
            .clone();

        if run.status == TaskRunStatus::Failed {
            let task = state
                .tasks
                .get(&run.task_id)
                .ok_or(StoreError::TaskNotFound(run.task_id))?;
            return Ok(if task.attempt < task.max_attempts {
                AttemptOutcome::WillRetry {
                    attempt: task.attempt,
                }
            } else {
                AttemptOutcome::Exhausted
            });
        }

        let run_mut = state.task_runs.get_mut(&run_id).unwrap();
        run_mut.status = TaskRunStatus::Failed;
        run_mut.last_error = Some(error_message.to_string());

        let task = state
            .tasks
            .get_mut(&run.task_id)
            .ok_or(StoreError::TaskNotFound(run.task_id))?;
        task.attempt += 1;

        let outcome = if task.attempt < task.max_attempts {
            let event = OutboxEvent::new_task_retry_ready(task);
            state.outbox.insert(event.event_id, event);
            AttemptOutcome::WillRetry {
                attempt: task.attempt,
            }
        } else {
            task.status = TaskStatus::Failed;
            let workflow_id = task.workflow_id;
            if let Some(w) = state.workflows.get_mut(&workflow_id) {
                if w.status == WorkflowStatus::Running {
                    w.status = WorkflowStatus::Failed;
                    w.finished_at = Some(chrono::Utc::now());
                }
            }
            AttemptOutcome::Exhausted
        };
        Ok(outcome)
    }

    async fn record_publish_result(
        &self,
        event_id: Uuid,
        ok: Result<(), String>,
    ) -> Result<PublishOutcome, StoreError> {
        let mut state = self.state.write();
        match ok {
            Ok(()) => {
                let event = state
                    .outbox
                    .get_mut(&event_id)
                    .ok_or_else(|| StoreError::Database(format!("outbox event not found: {event_id}")))?;
                event.published_at = Some(chrono::Utc::now());
                event.last_publish_error = None;
                Ok(PublishOutcome::Published)
            }
            Err(msg) => {
                let original = state
                    .outbox
                    .get(&event_id)
                    .ok_or_else(|| StoreError::Database(format!("outbox event not found: {event_id}")))?
                    .clone();
                state.outbox.get_mut(&event_id).unwrap().last_publish_error = Some(msg);

                if original.publish_attempts > 0 {
                    let retried = original.retry_clone();
                    state.outbox.insert(retried.event_id, retried.clone());
                    Ok(PublishOutcome::Retried(retried))
                } else {
                    if let Some(w) = state.workflows.get_mut(&original.workflow_id) {
                        if w.status == WorkflowStatus::Running {
                            w.status = WorkflowStatus::Canceled;
                            w.finished_at = Some(chrono::Utc::now());
                        }
                    }
                    Ok(PublishOutcome::AttemptsExhausted)
                }
            }
        }
    }

    async fn absorb_outbox_event(&self, event_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let event = state
            .outbox
            .get_mut(&event_id)
            .ok_or_else(|| StoreError::Database(format!("outbox event not found: {event_id}")))?;
        event.published_at = Some(chrono::Utc::now());
        event.last_publish_error = None;
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        self.state
            .read()
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        self.state
            .read()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn get_task_run(&self, run_id: Uuid) -> Result<TaskRun, StoreError> {
        self.state
            .read()
            .task_runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::TaskRunNotFound(run_id))
    }

    async fn upsert_task_run(&self, run: TaskRun) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        if state.task_runs.contains_key(&run.run_id) {
            return Ok(false);
        }
        state.task_runs.insert(run.run_id, run);
        Ok(true)
    }

    async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(w) = state.workflows.get_mut(&workflow_id) {
            if w.status == WorkflowStatus::Running {
                w.status = WorkflowStatus::Canceled;
                w.finished_at = Some(chrono::Utc::now());
            }
        }
        Ok(())
    }

    async fn set_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let w = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        w.status = status;
        if status.is_terminal() {
            w.finished_at = Some(chrono::Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn root_task(workflow_id: Uuid, name: &str) -> Task {
        Task {
            task_id: Uuid::now_v7(),
            workflow_id,
            name: name.to_string(),
            code_link: format!("Task_Code/{name}/code"),
            predecessors: vec![],
            successors: vec![],
            func_arg_map: Map::new(),
            pending_preds: 0,
            attempt: 0,
            max_attempts: 5,
            status: TaskStatus::Pending,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn linear_two_task_completion_enqueues_successor_event() {
        let store = InMemoryStore::new();
        let workflow_id = Uuid::now_v7();
        let workflow = Workflow::new(workflow_id, "Workflow_Env/x/env");

        let a = root_task(workflow_id, "a");
        let mut b = root_task(workflow_id, "b");
        b.predecessors = vec!["a".into()];
        b.pending_preds = 1;

        let mut a_with_successor = a.clone();
        a_with_successor.successors = vec!["b".into()];

        let event = OutboxEvent::new_task_ready(&a_with_successor);
        store
            .create_workflow_with_tasks_and_outbox(
                workflow,
                vec![a_with_successor.clone(), b],
                vec![event],
            )
            .await
            .unwrap();

        let run_id = Uuid::now_v7();
        store
            .upsert_task_run(TaskRun::new(run_id, a_with_successor.task_id, workflow_id))
            .await
            .unwrap();

        let outcome = store
            .complete_run_and_enqueue_successors(run_id)
            .await
            .unwrap();
        assert_eq!(outcome.newly_ready, vec!["b".to_string()]);
        assert!(!outcome.workflow_succeeded);

        let b_id = store.state.read().task_names[&(workflow_id, "b".to_string())];
        let b_task = store.get_task(b_id).await.unwrap();
        assert_eq!(b_task.pending_preds, 0);
    }

    #[tokio::test]
    async fn complete_run_twice_is_a_no_op() {
        let store = InMemoryStore::new();
        let workflow_id = Uuid::now_v7();
        let workflow = Workflow::new(workflow_id, "env");
        let a = root_task(workflow_id, "a");
        let event = OutboxEvent::new_task_ready(&a);
        store
            .create_workflow_with_tasks_and_outbox(workflow, vec![a.clone()], vec![event])
            .await
            .unwrap();
        let run_id = Uuid::now_v7();
        store
            .upsert_task_run(TaskRun::new(run_id, a.task_id, workflow_id))
            .await
            .unwrap();

        let first = store
            .complete_run_and_enqueue_successors(run_id)
            .await
            .unwrap();
        let second = store
            .complete_run_and_enqueue_successors(run_id)
            .await
            .unwrap();
        assert!(first.workflow_succeeded);
        assert!(!second.workflow_succeeded);
        assert!(second.newly_ready.is_empty());
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_task_and_workflow() {
        let store = InMemoryStore::new();
        let workflow_id = Uuid::now_v7();
        let workflow = Workflow::new(workflow_id, "env");
        let mut a = root_task(workflow_id, "a");
        a.max_attempts = 2;
        let event = OutboxEvent::new_task_ready(&a);
        store
            .create_workflow_with_tasks_and_outbox(workflow, vec![a.clone()], vec![event])
            .await
            .unwrap();

        for _ in 0..2 {
            let run_id = Uuid::now_v7();
            store
                .upsert_task_run(TaskRun::new(run_id, a.task_id, workflow_id))
                .await
                .unwrap();
            store
                .increase_attempt(run_id, "boom")
                .await
                .unwrap();
        }

        let task = store.get_task(a.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let workflow = store.get_workflow(workflow_id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_task_run_upsert_is_rejected() {
        let store = InMemoryStore::new();
        let workflow_id = Uuid::now_v7();
        let task_id = Uuid::now_v7();
        let run_id = Uuid::now_v7();
        assert!(store
            .upsert_task_run(TaskRun::new(run_id, task_id, workflow_id))
            .await
            .unwrap());
        assert!(!store
            .upsert_task_run(TaskRun::new(run_id, task_id, workflow_id))
            .await
            .unwrap());
    }
}
