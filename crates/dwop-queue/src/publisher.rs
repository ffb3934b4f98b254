//! Broker Publisher: a bounded pool of durable publisher channels plus the
//! per-event result handling and workflow-status gate described in the
//! architecture's publisher component.

use std::sync::Arc;

use async_trait::async_trait;
use dwop_core::OutboxEvent;
use dwop_store::{PublishOutcome, WorkflowStore};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::QueueError;

/// Called when an outbox event exhausts its publish-retry budget — the
/// workflow can no longer make progress and must be torn down on the
/// cluster side. Implemented by `dwop-cluster`'s observer so this crate
/// never needs a `kube` dependency.
#[async_trait]
pub trait WorkflowCanceler: Send + Sync {
    async fn force_stop(&self, workflow_id: Uuid);
}

/// A bounded pool of durable publisher channels on a single broker
/// connection. `acquire -> publish -> release`; on publish error the
/// channel is discarded rather than returned, so the pool shrinks under
/// sustained broker trouble instead of retrying a bad channel forever.
pub struct PublisherPool {
    tx: mpsc::Sender<Channel>,
    rx: Mutex<mpsc::Receiver<Channel>>,
    queue_name: String,
}

impl PublisherPool {
    /// Connect to `amqp_url`, declare the durable queue, and open
    /// `pool_size` confirm-mode channels.
    pub async fn connect(
        amqp_url: &str,
        queue_name: &str,
        pool_size: usize,
    ) -> Result<Self, QueueError> {
        let conn = Connection::connect(amqp_url, ConnectionProperties::default()).await?;
        let (tx, rx) = mpsc::channel(pool_size);

        for _ in 0..pool_size {
            let channel = conn.create_channel().await?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
            channel
                .queue_declare(
                    queue_name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            tx.send(channel)
                .await
                .map_err(|_| QueueError::PoolExhausted)?;
        }

        Ok(Self {
            tx,
            rx: Mutex::new(rx),
            queue_name: queue_name.to_string(),
        })
    }

    /// Publish `event` as a persistent, `application/json` message. On
    /// success the channel returns to the pool; on any error it is
    /// dropped.
    pub async fn publish(&self, event: &OutboxEvent) -> Result<(), QueueError> {
        let channel = {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(QueueError::PoolExhausted)?
        };

        let body = serde_json::to_vec(event)?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_content_type("application/json".into());

        let publish_result = channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await;

        match publish_result {
            Ok(confirm) => match confirm.await {
                Ok(_) => {
                    let _ = self.tx.send(channel).await;
                    Ok(())
                }
                Err(e) => Err(QueueError::from(e)),
            },
            Err(e) => Err(QueueError::from(e)),
        }
    }
}

/// Orchestrates the publish path for a single claimed outbox event: the
/// workflow-status gate, the broker publish, and recording the outcome
/// back on the store.
pub struct BrokerPublisher<S: WorkflowStore> {
    pool: PublisherPool,
    store: Arc<S>,
    canceler: Option<Arc<dyn WorkflowCanceler>>,
}

impl<S: WorkflowStore> BrokerPublisher<S> {
    pub fn new(pool: PublisherPool, store: Arc<S>, canceler: Option<Arc<dyn WorkflowCanceler>>) -> Self {
        Self {
            pool,
            store,
            canceler,
        }
    }

    /// Publish one claimed event, applying the workflow-status gate and
    /// recording the result. Never returns an error the caller must retry
    /// on — all retryable failures are absorbed into the outbox's own
    /// retry chain via [`dwop_store::WorkflowStore::record_publish_result`].
    #[instrument(skip(self, event), fields(event_id = %event.event_id, task_id = %event.task_id))]
    pub async fn publish_event(&self, event: OutboxEvent) -> Result<(), QueueError> {
        let workflow = self.store.get_workflow(event.workflow_id).await?;
        if workflow.status != dwop_core::WorkflowStatus::Running {
            debug!("absorbing event for non-running workflow");
            self.store.absorb_outbox_event(event.event_id).await?;
            return Ok(());
        }

        let publish_result = self.pool.publish(&event).await;
        let outcome = self
            .store
            .record_publish_result(
                event.event_id,
                publish_result.as_ref().map(|_| ()).map_err(|e| e.to_string()),
            )
            .await?;

        match outcome {
            PublishOutcome::Published => Ok(()),
            PublishOutcome::Retried(_) => Ok(()),
            PublishOutcome::AttemptsExhausted => {
                warn!(workflow_id = %event.workflow_id, "outbox event exhausted publish attempts; canceling workflow");
                if let Some(canceler) = &self.canceler {
                    canceler.force_stop(event.workflow_id).await;
                }
                Ok(())
            }
        }
    }
}
