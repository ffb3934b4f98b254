//! Domain model and source-to-DAG parser for the dwop workflow orchestrator.
//!
//! ```text
//!  source text ──▶ parser ──▶ Vec<Task> (with predecessor/successor edges)
//!                                 │
//!                                 ▼
//!                        Workflow + Task + OutboxEvent
//!                        (persisted by dwop-store)
//! ```
//!
//! This crate holds nothing that talks to Postgres, RabbitMQ or
//! Kubernetes — just the shapes and the pure parsing algorithm, so every
//! other crate in the workspace can depend on it without pulling in an
//! async runtime or a database driver.

pub mod model;
pub mod parser;

pub use model::{
    OutboxEvent, OutboxEventType, Task, TaskRun, TaskRunStatus, TaskStatus, Workflow,
    WorkflowStatus,
};
pub use parser::{parse, ParseError, ParsedTask};

/// Commonly used types, re-exported for `use dwop_core::prelude::*;`.
pub mod prelude {
    pub use crate::model::*;
    pub use crate::parser::{parse, ParseError, ParsedTask};
}
