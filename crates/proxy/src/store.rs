//! The tenant-facing capability interface.
//!
//! An explicit trait rather than a forwarding proxy: the
//! content-addressing layer implements it once, a plain pass-through
//! implementation covers the dumps namespace, and a predicate selects
//! between them per object name.

use crate::error::ProxyResult;
use async_trait::async_trait;
use bytes::Bytes;
use silo_core::ContentHash;
use silo_storage::{ByteStream, CompletedPart, ObjectMeta, PartSummary};

/// An in-progress multipart upload as seen by a tenant.
///
/// The tenant addresses the upload by its original object name; the
/// content store transparently re-keys all operations onto the temporary
/// backend object recorded at initiation.
#[derive(Clone, Debug)]
pub struct MultipartUpload {
    /// The object name the upload will commit to.
    pub name: String,
    /// Opaque backend upload ID.
    pub upload_id: String,
}

/// Capability set exposed to the S3-protocol front end for one tenant.
///
/// Returned hashes are `Some` for content-addressed objects and `None`
/// where no content addressing is involved (the dumps namespace).
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Whether the named object exists.
    async fn exists(&self, identity: &str, name: &str) -> ProxyResult<bool>;

    /// The named object's backend metadata.
    async fn metadata(&self, identity: &str, name: &str) -> ProxyResult<ObjectMeta>;

    /// Fetch the named object's bytes.
    async fn get(&self, identity: &str, name: &str) -> ProxyResult<Bytes>;

    /// Fetch the named object as a stream.
    async fn get_stream(&self, identity: &str, name: &str) -> ProxyResult<ByteStream>;

    /// Store an object under a name.
    async fn put(
        &self,
        identity: &str,
        name: &str,
        body: ByteStream,
        content_type: Option<&str>,
    ) -> ProxyResult<Option<ContentHash>>;

    /// Make `to_name` refer to the same content as `from_name`.
    async fn copy(
        &self,
        identity: &str,
        from_name: &str,
        to_name: &str,
    ) -> ProxyResult<Option<ContentHash>>;

    /// Remove the named object.
    async fn remove(&self, identity: &str, name: &str) -> ProxyResult<()>;

    /// Begin a multipart upload to the named object.
    async fn initiate_multipart(
        &self,
        identity: &str,
        name: &str,
        content_type: Option<&str>,
    ) -> ProxyResult<MultipartUpload>;

    /// Upload one part. Parts may arrive in any order.
    async fn upload_part(
        &self,
        identity: &str,
        upload: &MultipartUpload,
        part_number: i32,
        data: Bytes,
    ) -> ProxyResult<CompletedPart>;

    /// List the parts uploaded so far.
    async fn list_parts(
        &self,
        identity: &str,
        upload: &MultipartUpload,
    ) -> ProxyResult<Vec<PartSummary>>;

    /// Complete the upload, committing the object.
    async fn complete_multipart(
        &self,
        identity: &str,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> ProxyResult<Option<ContentHash>>;

    /// Abort the upload, discarding its parts and session.
    async fn abort_multipart(
        &self,
        identity: &str,
        upload: &MultipartUpload,
    ) -> ProxyResult<()>;
}
