//! Signed-URL object storage client.
//!
//! Three buckets: `Task_Code`, `Workflow_Env`, `Task_Output`. Every signed
//! URL this crate mints shares one TTL
//! ([`dwop_core::model::SIGNED_URL_TTL_SECS`]).

mod blobstore;
mod url;

pub use blobstore::{BlobStore, StorageError, SupabaseBlobStore};
pub use url::normalize_url;

pub mod prelude {
    pub use crate::{normalize_url, BlobStore, StorageError, SupabaseBlobStore};
}
