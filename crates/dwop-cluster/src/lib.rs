//! Job Executor and Observer: the only crate in the workspace that talks
//! to the Kubernetes API.
//!
//! ```text
//! Dispatcher ──(JobSubmitter)──▶ executor::JobExecutor ──▶ batchv1::Job
//!                                                              │
//! BrokerPublisher ──(WorkflowCanceler)──▶ observer::Observer ◀┘ watch/resync
//! ```

pub mod executor;
pub mod observer;

pub use executor::{JobExecutorError, KubeJobExecutor};
pub use observer::{Observer, ObserverConfig};

/// Label applied to every Job and pod template this orchestrator creates;
/// the observer's watch and the cancel flow's scoped deletion both select
/// on it.
pub const APP_LABEL: &str = "app";
pub const APP_LABEL_VALUE: &str = "dwop";
pub const RUN_ID_LABEL: &str = "runID";
pub const WORKFLOW_ID_LABEL: &str = "workflowId";
pub const TASK_ID_LABEL: &str = "taskId";
pub const TASK_NAME_LABEL: &str = "taskName";

/// Resync period for the observer's periodic full reconcile.
pub const RESYNC_PERIOD: std::time::Duration = std::time::Duration::from_secs(600);

/// Tail length for captured pod logs.
pub const LOG_TAIL_LINES: i64 = 200;

pub mod prelude {
    pub use crate::{
        JobExecutorError, KubeJobExecutor, Observer, ObserverConfig, APP_LABEL, APP_LABEL_VALUE,
        RUN_ID_LABEL, TASK_ID_LABEL, TASK_NAME_LABEL, WORKFLOW_ID_LABEL,
    };
}
