//! Application state shared across handlers.

use crate::fetch::Retriever;
use silo_core::config::AppConfig;
use silo_metadata::MetadataStore;
use silo_proxy::{ContentStore, PassthroughStore, PoolProxy, WriteCoalescer};
use silo_storage::BlobBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared application state.
///
/// The configuration is an immutable snapshot taken at startup; the only
/// runtime-mutable piece is the read-only flag, which every mutating path
/// checks before doing any work.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration snapshot.
    pub config: Arc<AppConfig>,
    /// Primary blob backend.
    pub backend: Arc<dyn BlobBackend>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// In-flight write registry.
    pub coalescer: Arc<WriteCoalescer>,
    /// Tenant-facing store router.
    pub proxy: Arc<PoolProxy>,
    /// Single-flight URL retriever.
    pub retriever: Arc<Retriever>,
    /// Read-only maintenance mode flag.
    pub read_only: Arc<AtomicBool>,
}

impl AppState {
    /// Wire up the full application state from its collaborators.
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn BlobBackend>,
        dumps_backend: Arc<dyn BlobBackend>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let read_only = Arc::new(AtomicBool::new(config.server.read_only));
        let coalescer = Arc::new(WriteCoalescer::new());

        let content = Arc::new(ContentStore::new(
            Arc::clone(&backend),
            Arc::clone(&metadata),
            Arc::clone(&coalescer),
            Arc::clone(&read_only),
        ));
        let dumps = Arc::new(PassthroughStore::new(
            dumps_backend,
            Arc::clone(&read_only),
        ));
        let proxy = Arc::new(PoolProxy::new(content, dumps));

        let retriever = Arc::new(Retriever::new(
            Arc::clone(&backend),
            Arc::clone(&metadata),
            &config.server.public_url,
            config.rivet.allow_private_networks,
            Duration::from_secs(config.rivet.connect_timeout_secs),
        ));

        Self {
            config: Arc::new(config),
            backend,
            metadata,
            coalescer,
            proxy,
            retriever,
            read_only,
        }
    }

    /// Whether the process is in read-only maintenance mode.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }
}
