//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Options applied when writing an object.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Content type recorded on the object, if any.
    pub content_type: Option<String>,
    /// Whether the object is world-readable once written.
    pub public_read: bool,
}

impl PutOptions {
    /// Options for a publicly readable object with the given content type.
    pub fn public(content_type: Option<&str>) -> Self {
        Self {
            content_type: content_type.map(|s| s.to_string()),
            public_read: true,
        }
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
}

/// A part that has been uploaded within a multipart upload.
#[derive(Clone, Debug)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: i32,
    /// Backend-assigned entity tag for the part.
    pub etag: String,
}

/// A part reported by a part listing.
#[derive(Clone, Debug)]
pub struct PartSummary {
    /// 1-based part number.
    pub part_number: i32,
    /// Part size in bytes.
    pub size: u64,
    /// Backend-assigned entity tag for the part.
    pub etag: String,
}

/// Object store abstraction over an S3-compatible (or local) backend.
///
/// This is the collaborator boundary: everything above it addresses
/// objects purely by key and never sees bucket or credential details.
/// There is deliberately no listing API.
#[async_trait]
pub trait BlobBackend: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StorageResult<()>;

    /// Start a streaming upload.
    async fn put_stream(
        &self,
        key: &str,
        opts: &PutOptions,
    ) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Server-side copy of an object. Content metadata travels with it.
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Change an object's public readability.
    async fn set_access(&self, key: &str, public: bool) -> StorageResult<()>;

    /// Begin a client-driven multipart upload, returning its opaque ID.
    async fn initiate_multipart(&self, key: &str, opts: &PutOptions) -> StorageResult<String>;

    /// Upload one part of a multipart upload. Parts may arrive in any
    /// order; `part_number` fixes their position.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<CompletedPart>;

    /// List the parts uploaded so far.
    async fn list_parts(&self, key: &str, upload_id: &str) -> StorageResult<Vec<PartSummary>>;

    /// Complete a multipart upload from the given parts.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    /// Abort a multipart upload, discarding its parts.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    /// Static identifier for the backend type ("s3", "filesystem").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify backend connectivity.
    ///
    /// Called during startup so misconfiguration surfaces before the
    /// server accepts requests. The default is a no-op, suitable for
    /// backends with nothing to probe.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
