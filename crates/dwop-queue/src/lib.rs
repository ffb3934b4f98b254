//! Outbox Claimer, Broker Publisher, and Broker Consumer (Dispatcher).
//!
//! ```text
//! claim_outbox_events ──▶ BrokerPublisher ──▶ "workflow_queue" ──▶ Dispatcher ──▶ JobSubmitter
//! ```
//!
//! This crate never links `kube` directly — it reaches the cluster only
//! through the [`JobSubmitter`] and [`WorkflowCanceler`] seams, which
//! `dwop-cluster` implements.

mod dispatcher;
mod error;
mod outbox;
mod publisher;

pub use dispatcher::{Dispatcher, JobSubmitter};
pub use error::QueueError;
pub use outbox::OutboxClaimer;
pub use publisher::{BrokerPublisher, PublisherPool, WorkflowCanceler};

/// Default durable queue name, per the external-interfaces contract.
pub const QUEUE_NAME: &str = "workflow_queue";

/// Default publisher-channel / consumer-channel pool size.
pub const DEFAULT_CHANNEL_COUNT: usize = 10;

pub mod prelude {
    pub use crate::{
        BrokerPublisher, Dispatcher, JobSubmitter, OutboxClaimer, PublisherPool, QueueError,
        WorkflowCanceler, DEFAULT_CHANNEL_COUNT, QUEUE_NAME,
    };
}
