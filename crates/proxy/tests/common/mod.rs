//! Common test fixtures for the proxy crate.

use bytes::Bytes;
use silo_metadata::{MetadataStore, SqliteStore};
use silo_proxy::{ContentStore, PassthroughStore, PoolProxy, WriteCoalescer};
use silo_storage::{BlobBackend, ByteStream, FilesystemBackend};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

/// A content store wired to a filesystem backend and SQLite metadata in a
/// temp directory.
#[allow(dead_code)]
pub struct TestPool {
    pub store: Arc<ContentStore>,
    pub proxy: PoolProxy,
    pub backend: Arc<dyn BlobBackend>,
    pub metadata: Arc<dyn MetadataStore>,
    pub coalescer: Arc<WriteCoalescer>,
    pub read_only: Arc<AtomicBool>,
    pub storage_root: PathBuf,
    pub dumps_root: PathBuf,
    _temp: TempDir,
}

#[allow(dead_code)]
impl TestPool {
    pub async fn new() -> Self {
        let temp = tempfile::tempdir().expect("failed to create temp directory");
        let storage_root = temp.path().join("storage");
        let dumps_root = temp.path().join("dumps");

        let backend: Arc<dyn BlobBackend> = Arc::new(
            FilesystemBackend::new(&storage_root)
                .await
                .expect("failed to create storage backend"),
        );
        let dumps_backend: Arc<dyn BlobBackend> = Arc::new(
            FilesystemBackend::new(&dumps_root)
                .await
                .expect("failed to create dumps backend"),
        );
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp.path().join("metadata.db"))
                .await
                .expect("failed to create metadata store"),
        );
        let coalescer = Arc::new(WriteCoalescer::new());
        let read_only = Arc::new(AtomicBool::new(false));

        let store = Arc::new(ContentStore::new(
            Arc::clone(&backend),
            Arc::clone(&metadata),
            Arc::clone(&coalescer),
            Arc::clone(&read_only),
        ));
        let dumps = Arc::new(PassthroughStore::new(dumps_backend, Arc::clone(&read_only)));
        let proxy = PoolProxy::new(Arc::clone(&store), dumps);

        Self {
            store,
            proxy,
            backend,
            metadata,
            coalescer,
            read_only,
            storage_root,
            dumps_root,
            _temp: temp,
        }
    }

    /// Number of blob files currently stored under `blobs/`.
    pub fn blob_count(&self) -> usize {
        count_files(&self.storage_root.join("blobs"))
    }

    /// Number of staged multipart temp objects.
    pub fn temp_object_count(&self) -> usize {
        count_files(&self.storage_root.join("multitmp"))
    }
}

fn count_files(dir: &Path) -> usize {
    let mut count = 0;
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            count += count_files(&path);
        } else {
            count += 1;
        }
    }
    count
}

/// A one-shot byte stream over an owned payload.
pub fn byte_stream(data: Vec<u8>) -> ByteStream {
    Box::pin(futures::stream::iter(vec![Ok(Bytes::from(data))]))
}

/// A stream that trickles its payload out with a pause in the middle,
/// keeping the write in flight long enough for readers to observe it.
pub fn slow_stream(data: Vec<u8>, pause: std::time::Duration) -> ByteStream {
    let mid = data.len() / 2;
    let head = Bytes::from(data[..mid].to_vec());
    let tail = Bytes::from(data[mid..].to_vec());
    Box::pin(async_stream::stream! {
        yield Ok(head);
        tokio::time::sleep(pause).await;
        yield Ok(tail);
    })
}

// Minimal PNG builders shared by the dedup scenario tests.

pub fn png_chunk(chunk_type: [u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&chunk_type);
    out.extend_from_slice(data);
    let mut crc = crc32fast::Hasher::new();
    crc.update(&chunk_type);
    crc.update(data);
    out.extend_from_slice(&crc.finalize().to_be_bytes());
    out
}

pub fn png_file(chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut out = silo_core::png::PNG_SIGNATURE.to_vec();
    for c in chunks {
        out.extend_from_slice(c);
    }
    out
}
