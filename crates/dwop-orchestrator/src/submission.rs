//! Turns an uploaded source file + requirements blob into a persisted
//! workflow: upload the requirements blob, parse the source into tasks
//! (uploading each task's code blob along the way), assemble the root
//! `TASK_READY` outbox events, and hand the whole thing to the store's
//! atomic create RPC.

use std::sync::Arc;

use chrono::Utc;
use dwop_core::{OutboxEvent, Task, TaskStatus, Workflow};
use dwop_storage::BlobStore;
use dwop_store::WorkflowStore;
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Serialize)]
pub struct WorkflowDescriptor {
    pub workflow_id: Uuid,
    pub status: String,
    pub created_at: chrono::DateTime<Utc>,
}

impl From<Workflow> for WorkflowDescriptor {
    fn from(w: Workflow) -> Self {
        Self {
            workflow_id: w.workflow_id,
            status: w.status.to_string(),
            created_at: w.created_at,
        }
    }
}

/// Parse `source`, upload `requirements` and every task's code blob, and
/// atomically persist the resulting workflow. Returns the new workflow's
/// descriptor.
pub async fn submit_workflow<S: WorkflowStore>(
    store: &Arc<S>,
    storage: &Arc<dyn BlobStore>,
    source: &str,
    requirements: Vec<u8>,
) -> Result<WorkflowDescriptor, AppError> {
    let workflow_id = Uuid::now_v7();

    let env_link = storage
        .upload("Workflow_Env", &format!("{workflow_id}/env"), requirements)
        .await?;

    // `dwop_core::parse`'s upload callback is synchronous (the parser
    // itself never talks to an async runtime); bridge to the async blob
    // store with `block_in_place` since this handler already runs on a
    // multi-threaded tokio runtime.
    let storage_for_parse = Arc::clone(storage);
    let parsed = dwop_core::parse(source, move |task_id, code| {
        let path = format!("{task_id}/code");
        let bytes = code.as_bytes().to_vec();
        let storage = Arc::clone(&storage_for_parse);
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current()
                .block_on(async move { storage.upload("Task_Code", &path, bytes).await })
        })
        .map_err(|e| dwop_core::ParseError::StorageUpload(task_id.to_string(), e.to_string()))
    })?;

    let now = Utc::now();
    let tasks: Vec<Task> = parsed
        .into_iter()
        .map(|p| Task {
            task_id: p.task_id,
            workflow_id,
            name: p.name,
            code_link: p.code_link,
            predecessors: p.predecessors,
            successors: p.successors,
            func_arg_map: p.func_arg_map,
            pending_preds: p.pending_preds,
            attempt: 0,
            max_attempts: dwop_core::model::DEFAULT_MAX_ATTEMPTS,
            status: TaskStatus::Pending,
            created_at: now,
        })
        .collect();

    let outbox_events: Vec<OutboxEvent> = tasks
        .iter()
        .filter(|t| t.pending_preds == 0)
        .map(OutboxEvent::new_task_ready)
        .collect();

    let workflow = Workflow::new(workflow_id, env_link);
    store
        .create_workflow_with_tasks_and_outbox(workflow.clone(), tasks, outbox_events)
        .await?;

    Ok(workflow.into())
}
