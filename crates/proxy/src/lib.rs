//! Content-addressing facade and write coalescing for the silo storage
//! pool.
//!
//! [`PoolProxy`] is the surface an S3-protocol front end calls into: it
//! routes each operation either to the [`ContentStore`] (hash, dedup,
//! name-map) or, for the dumps namespace, to a [`PassthroughStore`],
//! selected by [`is_dump_name`].

pub mod coalesce;
pub mod content;
pub mod error;
pub mod passthrough;
pub mod spool;
pub mod store;

pub use coalesce::{WriteCoalescer, WriteGuard};
pub use content::{canonicalize_to_spool, hash_spool_raw, ContentStore};
pub use error::{ProxyError, ProxyResult};
pub use passthrough::PassthroughStore;
pub use spool::{collect_stream, Spool, SpoolWriter};
pub use store::{MultipartUpload, TenantStore};

use std::sync::Arc;

/// Whether a name falls into the dumps namespace, which bypasses content
/// addressing entirely.
pub fn is_dump_name(name: &str) -> bool {
    name.starts_with("backups/dumps") || name.starts_with("/backups/dumps")
}

/// Routes tenant operations to the content store or the dumps store.
pub struct PoolProxy {
    content: Arc<ContentStore>,
    dumps: Arc<PassthroughStore>,
}

impl PoolProxy {
    pub fn new(content: Arc<ContentStore>, dumps: Arc<PassthroughStore>) -> Self {
        Self { content, dumps }
    }

    /// The store responsible for objects with this name.
    pub fn store_for(&self, name: &str) -> Arc<dyn TenantStore> {
        if is_dump_name(name) {
            Arc::clone(&self.dumps) as Arc<dyn TenantStore>
        } else {
            Arc::clone(&self.content) as Arc<dyn TenantStore>
        }
    }

    /// Direct access to the content-addressing store.
    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    /// Direct access to the dumps store.
    pub fn dumps(&self) -> &Arc<PassthroughStore> {
        &self.dumps
    }

    /// Copy, enforcing that both names live on the same side of the
    /// namespace predicate.
    pub async fn copy(
        &self,
        identity: &str,
        from_name: &str,
        to_name: &str,
    ) -> ProxyResult<Option<silo_core::ContentHash>> {
        if is_dump_name(from_name) != is_dump_name(to_name) {
            return Err(ProxyError::InvalidRequest(
                "cannot copy between the dumps namespace and the pool".to_string(),
            ));
        }
        self.store_for(from_name)
            .copy(identity, from_name, to_name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_name_predicate() {
        assert!(is_dump_name("backups/dumps/db.sql"));
        assert!(is_dump_name("/backups/dumps/db.sql"));
        assert!(!is_dump_name("media/backups/dumps"));
        assert!(!is_dump_name("photo.png"));
    }
}
