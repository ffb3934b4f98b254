//! Outbox Claimer: the fixed-interval poller that claims unpublished
//! outbox events and fans them out onto the shared worker pool for
//! publishing.
//!
//! Deliberately a plain `tokio::time::interval` rather than an adaptive
//! backoff poller — the outbox table is small and claim misses are cheap,
//! so there is nothing to back off from.

use std::sync::Arc;
use std::time::Duration;

use dwop_store::WorkflowStore;
use dwop_worker::WorkerPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::publisher::BrokerPublisher;

/// Default claim batch size per tick.
pub const DEFAULT_BATCH_SIZE: i64 = 200;

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Polls the outbox table every [`DEFAULT_POLL_INTERVAL`], claims up to
/// [`DEFAULT_BATCH_SIZE`] unpublished events per tick, and hands each to
/// the worker pool for publishing.
pub struct OutboxClaimer<S: WorkflowStore> {
    store: Arc<S>,
    publisher: Arc<BrokerPublisher<S>>,
    worker_pool: Arc<WorkerPool>,
    claimer_id: String,
    poll_interval: Duration,
    batch_size: i64,
}

impl<S: WorkflowStore> OutboxClaimer<S> {
    pub fn new(
        store: Arc<S>,
        publisher: Arc<BrokerPublisher<S>>,
        worker_pool: Arc<WorkerPool>,
        claimer_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            publisher,
            worker_pool,
            claimer_id: claimer_id.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Run the claim loop until `shutdown` is canceled.
    #[instrument(skip(self, shutdown), fields(claimer_id = %self.claimer_id))]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("outbox claimer shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.claim_and_dispatch().await;
                }
            }
        }
    }

    async fn claim_and_dispatch(&self) {
        let events = match self
            .store
            .claim_outbox_events(self.batch_size, &self.claimer_id)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "failed to claim outbox events");
                return;
            }
        };

        if events.is_empty() {
            return;
        }

        debug!(count = events.len(), "claimed outbox events");

        for event in events {
            let publisher = Arc::clone(&self.publisher);
            let job: dwop_worker::Job = Box::new(move |_worker_id| {
                Box::pin(async move {
                    if let Err(e) = publisher.publish_event(event).await {
                        error!(error = %e, "failed to publish outbox event");
                    }
                })
            });
            if let Err(e) = self.worker_pool.submit(job).await {
                error!(error = %e, "failed to submit publish job to worker pool");
            }
        }
    }
}
