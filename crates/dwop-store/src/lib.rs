//! Persistence for the DAG: [`WorkflowStore`] is the trait every other
//! crate programs against; [`postgres::PostgresStore`] is the production
//! implementation and [`memory::InMemoryStore`] is a test double with
//! identical semantics.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    AttemptOutcome, CompletionOutcome, PublishOutcome, StoreError, WorkflowStore, CLAIM_LEASE_SECS,
};

pub mod prelude {
    pub use crate::store::{
        AttemptOutcome, CompletionOutcome, PublishOutcome, StoreError, WorkflowStore,
        CLAIM_LEASE_SECS,
    };
    pub use crate::{InMemoryStore, PostgresStore};
}
