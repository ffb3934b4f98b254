//! Broker Consumer: drains `workflow_queue` and hands each message to a
//! [`JobSubmitter`], applying the ack/reject rules that keep at-least-once
//! delivery from ever colliding with the idempotent TaskRun upsert.

use async_trait::async_trait;
use dwop_core::{OutboxEvent, Task, Workflow, WorkflowStatus};
use dwop_store::{StoreError, WorkflowStore};
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicRejectOptions};
use lapin::types::FieldTable;
use lapin::{message::Delivery, Channel};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::QueueError;

/// Submits a ready task run to the cluster for execution. Implemented by
/// `dwop-cluster`'s Job Executor so this crate never needs a `kube`
/// dependency.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit_job(
        &self,
        workflow: &Workflow,
        task: &Task,
        run_id: Uuid,
    ) -> Result<(), String>;
}

/// Consumes `TASK_READY` / `TASK_RETRY_READY` messages off the durable
/// queue and dispatches each to a [`JobSubmitter`].
pub struct Dispatcher<S: WorkflowStore> {
    store: Arc<S>,
    submitter: Arc<dyn JobSubmitter>,
}

impl<S: WorkflowStore> Dispatcher<S> {
    pub fn new(store: Arc<S>, submitter: Arc<dyn JobSubmitter>) -> Self {
        Self { store, submitter }
    }

    /// Consume from `channel` with `prefetch = 1` and manual ack until the
    /// channel closes or the consumer is canceled.
    pub async fn run(&self, channel: Channel, queue_name: &str, consumer_tag: &str) -> Result<(), QueueError> {
        channel
            .basic_qos(1, lapin::options::BasicQosOptions::default())
            .await?;

        let mut consumer = channel
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => self.handle_delivery(delivery).await,
                Err(e) => {
                    error!(error = %e, "consumer stream error");
                    break;
                }
            }
        }

        Ok(())
    }

    #[instrument(skip(self, delivery))]
    async fn handle_delivery(&self, delivery: Delivery) {
        let event: OutboxEvent = match serde_json::from_slice(&delivery.data) {
            Ok(event) => event,
            Err(e) => {
                // Unparseable payload can never succeed on redelivery.
                error!(error = %e, "failed to decode outbox event; dropping");
                let _ = delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await;
                return;
            }
        };

        match self.dispatch(&event).await {
            DispatchOutcome::Ack => {
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
            DispatchOutcome::RejectRequeue => {
                let _ = delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await;
            }
            DispatchOutcome::RejectDrop => {
                let _ = delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await;
            }
        }
    }

    async fn dispatch(&self, event: &OutboxEvent) -> DispatchOutcome {
        // Construct a fresh TaskRun and upsert it first, before any other
        // lookup: a duplicate delivery must be caught here and dropped
        // without ever touching workflow/task state or resubmitting a job.
        let run_id = Uuid::now_v7();
        let run = dwop_core::TaskRun::new(run_id, event.task_id, event.workflow_id);
        match self.store.upsert_task_run(run).await {
            Ok(true) => {}
            Ok(false) => {
                info!(task_id = %event.task_id, "duplicate task run upsert; dropping delivery");
                return DispatchOutcome::RejectDrop;
            }
            Err(e) => {
                error!(error = %e, "store error upserting task run; requeueing");
                return DispatchOutcome::RejectRequeue;
            }
        }

        let workflow = match self.store.get_workflow(event.workflow_id).await {
            Ok(w) => w,
            Err(StoreError::WorkflowNotFound(_)) => {
                warn!(workflow_id = %event.workflow_id, "workflow not found for delivery; requeueing");
                return DispatchOutcome::RejectRequeue;
            }
            Err(e) => {
                error!(error = %e, "store error reading workflow; requeueing");
                return DispatchOutcome::RejectRequeue;
            }
        };

        if workflow.status != WorkflowStatus::Running {
            info!(workflow_id = %workflow.workflow_id, status = %workflow.status, "dropping delivery for non-running workflow");
            return DispatchOutcome::Ack;
        }

        let task = match self.store.get_task(event.task_id).await {
            Ok(t) => t,
            Err(StoreError::TaskNotFound(_)) => {
                warn!(task_id = %event.task_id, "task not found for delivery; requeueing");
                return DispatchOutcome::RejectRequeue;
            }
            Err(e) => {
                error!(error = %e, "store error reading task; requeueing");
                return DispatchOutcome::RejectRequeue;
            }
        };

        match self.submitter.submit_job(&workflow, &task, run_id).await {
            Ok(()) => DispatchOutcome::Ack,
            Err(e) => {
                error!(error = %e, "job submission failed; requeueing");
                DispatchOutcome::RejectRequeue
            }
        }
    }
}

enum DispatchOutcome {
    Ack,
    RejectRequeue,
    RejectDrop,
}
