//! Shared bounded worker pool: a single channel of `Job { execute(workerID) }`
//! jobs, drained by N long-lived workers. Feeds the outbox claimer and the
//! broker dispatcher — see the orchestrator's wiring for where each
//! producer submits its jobs.

mod pool;

pub use pool::{Job, WorkerId, WorkerPool, WorkerPoolConfig, WorkerPoolError};

pub mod prelude {
    pub use crate::{Job, WorkerId, WorkerPool, WorkerPoolConfig, WorkerPoolError};
}
