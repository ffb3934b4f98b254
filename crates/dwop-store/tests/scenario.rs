//! End-to-end DAG scenarios against [`InMemoryStore`] — the same
//! multi-step flows the architecture's testable-properties section names,
//! run without a live Postgres instance.

use chrono::Utc;
use dwop_core::{OutboxEvent, Task, TaskRun, TaskStatus, Workflow};
use dwop_store::{AttemptOutcome, InMemoryStore, WorkflowStore};
use uuid::Uuid;

fn task(workflow_id: Uuid, name: &str, predecessors: Vec<&str>, successors: Vec<&str>) -> Task {
    let pending_preds = predecessors.len() as i32;
    Task {
        task_id: Uuid::now_v7(),
        workflow_id,
        name: name.to_string(),
        code_link: format!("Task_Code/{name}/code"),
        predecessors: predecessors.into_iter().map(String::from).collect(),
        successors: successors.into_iter().map(String::from).collect(),
        func_arg_map: Default::default(),
        pending_preds,
        attempt: 0,
        max_attempts: 5,
        status: TaskStatus::Pending,
        created_at: Utc::now(),
    }
}

/// Source: `fun a(): ... \n fun b(x:a): ...`. Expected: `a` succeeds,
/// triggers `b`'s `TASK_READY` event, `b` succeeds, workflow succeeds.
#[tokio::test]
async fn linear_two_task_success() {
    let store = InMemoryStore::new();
    let workflow_id = Uuid::now_v7();
    let a = task(workflow_id, "a", vec![], vec!["b"]);
    let b = task(workflow_id, "b", vec!["a"], vec![]);
    let a_id = a.task_id;
    let b_id = b.task_id;

    let root_event = OutboxEvent::new_task_ready(&a);
    store
        .create_workflow_with_tasks_and_outbox(
            Workflow::new(workflow_id, "Workflow_Env/x/env"),
            vec![a, b],
            vec![root_event],
        )
        .await
        .unwrap();

    let run_a = Uuid::now_v7();
    store
        .upsert_task_run(TaskRun::new(run_a, a_id, workflow_id))
        .await
        .unwrap();
    let outcome = store
        .complete_run_and_enqueue_successors(run_a)
        .await
        .unwrap();
    assert_eq!(outcome.newly_ready, vec!["b".to_string()]);
    assert!(!outcome.workflow_succeeded);

    let run_b = Uuid::now_v7();
    store
        .upsert_task_run(TaskRun::new(run_b, b_id, workflow_id))
        .await
        .unwrap();
    let outcome = store
        .complete_run_and_enqueue_successors(run_b)
        .await
        .unwrap();
    assert!(outcome.workflow_succeeded);

    let workflow = store.get_workflow(workflow_id).await.unwrap();
    assert_eq!(workflow.status, dwop_core::WorkflowStatus::Succeeded);
}

/// Fan-out/join: `c`'s `pending_preds` starts at 2 and only reaches zero,
/// enqueueing `c`'s ready event, after both `a` and `b` complete.
#[tokio::test]
async fn fan_out_and_join_only_readies_after_both_predecessors() {
    let store = InMemoryStore::new();
    let workflow_id = Uuid::now_v7();
    let a = task(workflow_id, "a", vec![], vec!["c"]);
    let b = task(workflow_id, "b", vec![], vec!["c"]);
    let c = task(workflow_id, "c", vec!["a", "b"], vec![]);
    let (a_id, b_id) = (a.task_id, b.task_id);

    let a_event = OutboxEvent::new_task_ready(&a);
    let b_event = OutboxEvent::new_task_ready(&b);
    store
        .create_workflow_with_tasks_and_outbox(
            Workflow::new(workflow_id, "Workflow_Env/x/env"),
            vec![a, b, c],
            vec![a_event, b_event],
        )
        .await
        .unwrap();

    let run_a = Uuid::now_v7();
    store
        .upsert_task_run(TaskRun::new(run_a, a_id, workflow_id))
        .await
        .unwrap();
    let outcome = store
        .complete_run_and_enqueue_successors(run_a)
        .await
        .unwrap();
    assert!(outcome.newly_ready.is_empty(), "c not ready until b also completes");

    let run_b = Uuid::now_v7();
    store
        .upsert_task_run(TaskRun::new(run_b, b_id, workflow_id))
        .await
        .unwrap();
    let outcome = store
        .complete_run_and_enqueue_successors(run_b)
        .await
        .unwrap();
    assert_eq!(outcome.newly_ready, vec!["c".to_string()]);
}

/// A task fails twice then succeeds: two retries, two `TASK_RETRY_READY`
/// events, final run succeeds, workflow succeeds.
#[tokio::test]
async fn retry_then_success() {
    let store = InMemoryStore::new();
    let workflow_id = Uuid::now_v7();
    let a = task(workflow_id, "a", vec![], vec![]);
    let a_id = a.task_id;
    let event = OutboxEvent::new_task_ready(&a);
    store
        .create_workflow_with_tasks_and_outbox(
            Workflow::new(workflow_id, "Workflow_Env/x/env"),
            vec![a],
            vec![event],
        )
        .await
        .unwrap();

    for _ in 0..2 {
        let run_id = Uuid::now_v7();
        store
            .upsert_task_run(TaskRun::new(run_id, a_id, workflow_id))
            .await
            .unwrap();
        let outcome = store
            .increase_attempt(run_id, "boom")
            .await
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::WillRetry { .. }));
    }

    let task_after_retries = store.get_task(a_id).await.unwrap();
    assert_eq!(task_after_retries.attempt, 2);
    assert_eq!(task_after_retries.status, TaskStatus::Pending);

    let run_id = Uuid::now_v7();
    store
        .upsert_task_run(TaskRun::new(run_id, a_id, workflow_id))
        .await
        .unwrap();
    let outcome = store
        .complete_run_and_enqueue_successors(run_id)
        .await
        .unwrap();
    assert!(outcome.workflow_succeeded);
}

/// Five consecutive failures exhaust the retry budget: task and workflow
/// both end FAILED, no further events.
#[tokio::test]
async fn retry_exhaustion_fails_task_and_workflow() {
    let store = InMemoryStore::new();
    let workflow_id = Uuid::now_v7();
    let a = task(workflow_id, "a", vec![], vec![]);
    let a_id = a.task_id;
    let event = OutboxEvent::new_task_ready(&a);
    store
        .create_workflow_with_tasks_and_outbox(
            Workflow::new(workflow_id, "Workflow_Env/x/env"),
            vec![a],
            vec![event],
        )
        .await
        .unwrap();

    let mut last_outcome = None;
    for _ in 0..5 {
        let run_id = Uuid::now_v7();
        store
            .upsert_task_run(TaskRun::new(run_id, a_id, workflow_id))
            .await
            .unwrap();
        last_outcome = Some(store.increase_attempt(run_id, "boom").await.unwrap());
    }

    assert!(matches!(last_outcome, Some(AttemptOutcome::Exhausted)));
    let task = store.get_task(a_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let workflow = store.get_workflow(workflow_id).await.unwrap();
    assert_eq!(workflow.status, dwop_core::WorkflowStatus::Failed);
}

/// `complete_run_and_enqueue_successors` applied twice for the same
/// `run_id` has no additional effect — the exactly-once-effect guarantee.
#[tokio::test]
async fn complete_run_is_idempotent() {
    let store = InMemoryStore::new();
    let workflow_id = Uuid::now_v7();
    let a = task(workflow_id, "a", vec![], vec!["b"]);
    let b = task(workflow_id, "b", vec!["a"], vec![]);
    let a_id = a.task_id;
    let event = OutboxEvent::new_task_ready(&a);
    store
        .create_workflow_with_tasks_and_outbox(
            Workflow::new(workflow_id, "Workflow_Env/x/env"),
            vec![a, b],
            vec![event],
        )
        .await
        .unwrap();

    let run_id = Uuid::now_v7();
    store
        .upsert_task_run(TaskRun::new(run_id, a_id, workflow_id))
        .await
        .unwrap();

    let first = store
        .complete_run_and_enqueue_successors(run_id)
        .await
        .unwrap();
    assert_eq!(first.newly_ready, vec!["b".to_string()]);

    let second = store
        .complete_run_and_enqueue_successors(run_id)
        .await
        .unwrap();
    assert!(second.newly_ready.is_empty(), "second call must not re-enqueue b");
}

/// Duplicate `upsert_task_run` for the same `run_id` — the dispatcher's
/// duplicate-delivery guard — only ever inserts once.
#[tokio::test]
async fn duplicate_task_run_upsert_collapses_to_one() {
    let store = InMemoryStore::new();
    let workflow_id = Uuid::now_v7();
    let a = task(workflow_id, "a", vec![], vec![]);
    let a_id = a.task_id;
    let event = OutboxEvent::new_task_ready(&a);
    store
        .create_workflow_with_tasks_and_outbox(
            Workflow::new(workflow_id, "Workflow_Env/x/env"),
            vec![a],
            vec![event],
        )
        .await
        .unwrap();

    let run_id = Uuid::now_v7();
    let first = store
        .upsert_task_run(TaskRun::new(run_id, a_id, workflow_id))
        .await
        .unwrap();
    let second = store
        .upsert_task_run(TaskRun::new(run_id, a_id, workflow_id))
        .await
        .unwrap();
    assert!(first);
    assert!(!second, "duplicate delivery must report no row inserted");
}

/// Canceling a workflow is idempotent and leaves an already-terminal
/// workflow alone.
#[tokio::test]
async fn cancel_workflow_is_idempotent() {
    let store = InMemoryStore::new();
    let workflow_id = Uuid::now_v7();
    store
        .create_workflow_with_tasks_and_outbox(
            Workflow::new(workflow_id, "Workflow_Env/x/env"),
            vec![],
            vec![],
        )
        .await
        .unwrap();

    store.cancel_workflow(workflow_id).await.unwrap();
    store.cancel_workflow(workflow_id).await.unwrap();

    let workflow = store.get_workflow(workflow_id).await.unwrap();
    assert_eq!(workflow.status, dwop_core::WorkflowStatus::Canceled);
}
