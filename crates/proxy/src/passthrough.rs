//! Plain pass-through store for the dumps namespace.
//!
//! Dump objects (database exports and the like) are excluded from all
//! addressing logic: no canonicalization, no hashing, no dedup. They go
//! straight to a dedicated backend under their tenant-scoped key.

use crate::error::{ProxyError, ProxyResult};
use crate::spool::Spool;
use crate::store::{MultipartUpload, TenantStore};
use async_trait::async_trait;
use bytes::Bytes;
use silo_core::ContentHash;
use silo_storage::{
    BlobBackend, ByteStream, CompletedPart, ObjectMeta, PartSummary, PutOptions, StreamingUpload,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pass-through store delegating every operation to a raw backend.
pub struct PassthroughStore {
    backend: Arc<dyn BlobBackend>,
    read_only: Arc<AtomicBool>,
}

impl PassthroughStore {
    pub fn new(backend: Arc<dyn BlobBackend>, read_only: Arc<AtomicBool>) -> Self {
        Self { backend, read_only }
    }

    fn check_read_only(&self) -> ProxyResult<()> {
        if self.read_only.load(Ordering::Relaxed) {
            Err(ProxyError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn key(identity: &str, name: &str) -> String {
        format!("{}/{}", identity, name.trim_start_matches('/'))
    }
}

#[async_trait]
impl TenantStore for PassthroughStore {
    async fn exists(&self, identity: &str, name: &str) -> ProxyResult<bool> {
        Ok(self.backend.exists(&Self::key(identity, name)).await?)
    }

    async fn metadata(&self, identity: &str, name: &str) -> ProxyResult<ObjectMeta> {
        Ok(self.backend.head(&Self::key(identity, name)).await?)
    }

    async fn get(&self, identity: &str, name: &str) -> ProxyResult<Bytes> {
        Ok(self.backend.get(&Self::key(identity, name)).await?)
    }

    async fn get_stream(&self, identity: &str, name: &str) -> ProxyResult<ByteStream> {
        Ok(self.backend.get_stream(&Self::key(identity, name)).await?)
    }

    async fn put(
        &self,
        identity: &str,
        name: &str,
        body: ByteStream,
        content_type: Option<&str>,
    ) -> ProxyResult<Option<ContentHash>> {
        use futures::StreamExt;

        self.check_read_only()?;
        let key = Self::key(identity, name);
        let opts = PutOptions::public(content_type);
        let spool = Spool::from_stream(body).await?;
        let mut stream = spool.into_stream()?;
        let mut upload: Box<dyn StreamingUpload> =
            self.backend.put_stream(&key, &opts).await?;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    if let Err(e) = upload.write(chunk).await {
                        let _ = upload.abort().await;
                        return Err(e.into());
                    }
                }
                Err(e) => {
                    let _ = upload.abort().await;
                    return Err(e.into());
                }
            }
        }
        upload.finish().await?;
        Ok(None)
    }

    async fn copy(
        &self,
        identity: &str,
        from_name: &str,
        to_name: &str,
    ) -> ProxyResult<Option<ContentHash>> {
        self.check_read_only()?;
        self.backend
            .copy(
                &Self::key(identity, from_name),
                &Self::key(identity, to_name),
            )
            .await?;
        Ok(None)
    }

    async fn remove(&self, identity: &str, name: &str) -> ProxyResult<()> {
        self.check_read_only()?;
        Ok(self.backend.delete(&Self::key(identity, name)).await?)
    }

    async fn initiate_multipart(
        &self,
        identity: &str,
        name: &str,
        content_type: Option<&str>,
    ) -> ProxyResult<MultipartUpload> {
        self.check_read_only()?;
        let upload_id = self
            .backend
            .initiate_multipart(&Self::key(identity, name), &PutOptions::public(content_type))
            .await?;
        Ok(MultipartUpload {
            name: name.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        identity: &str,
        upload: &MultipartUpload,
        part_number: i32,
        data: Bytes,
    ) -> ProxyResult<CompletedPart> {
        self.check_read_only()?;
        Ok(self
            .backend
            .upload_part(
                &Self::key(identity, &upload.name),
                &upload.upload_id,
                part_number,
                data,
            )
            .await?)
    }

    async fn list_parts(
        &self,
        identity: &str,
        upload: &MultipartUpload,
    ) -> ProxyResult<Vec<PartSummary>> {
        Ok(self
            .backend
            .list_parts(&Self::key(identity, &upload.name), &upload.upload_id)
            .await?)
    }

    async fn complete_multipart(
        &self,
        identity: &str,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> ProxyResult<Option<ContentHash>> {
        self.check_read_only()?;
        self.backend
            .complete_multipart(
                &Self::key(identity, &upload.name),
                &upload.upload_id,
                parts,
            )
            .await?;
        Ok(None)
    }

    async fn abort_multipart(
        &self,
        identity: &str,
        upload: &MultipartUpload,
    ) -> ProxyResult<()> {
        self.check_read_only()?;
        Ok(self
            .backend
            .abort_multipart(&Self::key(identity, &upload.name), &upload.upload_id)
            .await?)
    }
}
