//! Metadata store for the silo storage pool.
//!
//! Holds the tenant name map, per-hash size accounting, the pending-backup
//! queue and in-progress multipart sessions. Equivalent guarantees to a
//! small relational table with a unique index on (identity, name) and a
//! secondary index on hash.

pub mod error;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{
    BackupRepo, FileSizeRepo, MetadataStore, MultipartRepo, NameMapRepo, SqliteStore,
};

use silo_core::config::MetadataConfig;
use std::sync::Arc;

/// Construct a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite { path } => Ok(Arc::new(SqliteStore::new(path).await?)),
    }
}
