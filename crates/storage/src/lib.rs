//! Object storage backends for the silo storage pool.
//!
//! Defines the [`BlobBackend`] trait the rest of the system addresses
//! objects through, plus S3 and filesystem implementations.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use backends::s3::S3Backend;
pub use error::{StorageError, StorageResult};
pub use traits::{
    BlobBackend, ByteStream, CompletedPart, ObjectMeta, PartSummary, PutOptions, StreamingUpload,
};

use silo_core::config::StorageConfig;
use std::sync::Arc;

/// Construct a backend from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn BlobBackend>> {
    match config {
        StorageConfig::Filesystem { path } => {
            Ok(Arc::new(FilesystemBackend::new(path).await?))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => Ok(Arc::new(
            S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?,
        )),
    }
}
