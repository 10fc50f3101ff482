//! The content-addressing store.
//!
//! Every "real" object write funnels through here: bytes are
//! canonicalized and hashed on the way in, at most one copy per hash is
//! kept on the backend, and tenant-visible names are just rows in the
//! name map pointing at hashes.

use crate::coalesce::WriteCoalescer;
use crate::error::{ProxyError, ProxyResult};
use crate::spool::{Spool, SpoolWriter};
use crate::store::{MultipartUpload, TenantStore};
use async_trait::async_trait;
use bytes::Bytes;
use silo_core::{canonicalize, ContentHash, ContentHasher};
use silo_metadata::{BackupRepo, FileSizeRepo, MetadataStore, MultipartRepo, NameMapRepo};
use silo_storage::{
    BlobBackend, ByteStream, CompletedPart, ObjectMeta, PartSummary, PutOptions, StreamingUpload,
};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Pause between consecutive backend calls during multipart completion.
/// Several calls land in quick succession there, which trips the request
/// rate limits of at least one production S3 provider.
const BACKEND_PACING: Duration = Duration::from_millis(100);

/// Prefix under which in-progress multipart payloads are staged.
const MULTIPART_TEMP_PREFIX: &str = "multitmp";

/// The content-addressing facade over a raw blob backend.
pub struct ContentStore {
    backend: Arc<dyn BlobBackend>,
    metadata: Arc<dyn MetadataStore>,
    coalescer: Arc<WriteCoalescer>,
    read_only: Arc<AtomicBool>,
}

impl ContentStore {
    pub fn new(
        backend: Arc<dyn BlobBackend>,
        metadata: Arc<dyn MetadataStore>,
        coalescer: Arc<WriteCoalescer>,
        read_only: Arc<AtomicBool>,
    ) -> Self {
        Self {
            backend,
            metadata,
            coalescer,
            read_only,
        }
    }

    /// The backend this store writes to.
    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    /// The metadata store backing the name map.
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// The shared write-coalescing registry.
    pub fn coalescer(&self) -> &Arc<WriteCoalescer> {
        &self.coalescer
    }

    /// Fail fast when the process is in read-only maintenance mode.
    /// Checked before any other work so no side effect can precede it.
    pub fn check_read_only(&self) -> ProxyResult<()> {
        if self.read_only.load(Ordering::Relaxed) {
            Err(ProxyError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Resolve a name to the backend path of its blob.
    async fn resolve_path(&self, identity: &str, name: &str) -> ProxyResult<String> {
        let hash = self
            .metadata
            .get_mapping(identity, name)
            .await?
            .ok_or_else(|| ProxyError::NotFound(format!("{identity}/{name}")))?;
        Ok(hash.blob_path())
    }

    /// Canonicalize and hash a spooled payload, discarding the canonical
    /// bytes. Used where only the identity of the content matters.
    async fn hash_canonicalized(raw: Spool) -> ProxyResult<(ContentHash, u64)> {
        let (_spool, hash, len) = canonicalize_to_spool(raw).await?;
        Ok((hash, len))
    }

    /// Upload a spool to the backend at `path`.
    async fn upload_spool(
        &self,
        path: &str,
        spool: Spool,
        opts: &PutOptions,
    ) -> ProxyResult<()> {
        use futures::StreamExt;

        let mut stream = spool.into_stream()?;
        let mut upload: Box<dyn StreamingUpload> = self.backend.put_stream(path, opts).await?;
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
        Ok(())
    }

    /// Multipart completion body; failures are logged with full detail by
    /// the caller before being re-raised.
    async fn complete_multipart_inner(
        &self,
        identity: &str,
        upload: &MultipartUpload,
        tempname: &str,
        parts: &[CompletedPart],
    ) -> ProxyResult<ContentHash> {
        self.backend
            .complete_multipart(tempname, &upload.upload_id, parts)
            .await?;

        // Multipart payloads cannot be intercepted mid-stream, so this is
        // the one path that hashes after the backend already has bytes.
        let stream = self.backend.get_stream(tempname).await?;
        let raw = Spool::from_stream(stream).await?;
        let (hash, size) = Self::hash_canonicalized(raw).await?;
        let path = hash.blob_path();

        tokio::time::sleep(BACKEND_PACING).await;
        if self.backend.exists(&path).await? {
            tracing::info!(
                identity,
                name = %upload.name,
                hash = %hash,
                "multipart completion deduplicated against existing blob"
            );
            tokio::time::sleep(BACKEND_PACING).await;
        } else {
            tokio::time::sleep(BACKEND_PACING).await;
            // Promote with a backend-side copy rather than re-uploading.
            self.backend.copy(tempname, &path).await?;
            tokio::time::sleep(BACKEND_PACING).await;
            self.backend.set_access(&path, true).await?;
            self.metadata.put_pending_backup(&hash).await?;
        }

        self.metadata.put_file_size(&hash, size).await?;
        self.metadata.put_mapping(identity, &upload.name, &hash).await?;
        self.metadata.delete_multipart(tempname).await?;
        tokio::time::sleep(BACKEND_PACING).await;
        self.backend.delete(tempname).await?;

        Ok(hash)
    }

    async fn masked_tempname(
        &self,
        identity: &str,
        name: &str,
    ) -> ProxyResult<String> {
        self.metadata
            .get_multipart_temp(identity, name)
            .await?
            .ok_or_else(|| {
                ProxyError::NotFound(format!("no multipart upload in progress for {identity}/{name}"))
            })
    }
}

#[async_trait]
impl TenantStore for ContentStore {
    async fn exists(&self, identity: &str, name: &str) -> ProxyResult<bool> {
        let path = self.resolve_path(identity, name).await?;
        Ok(self.backend.exists(&path).await?)
    }

    async fn metadata(&self, identity: &str, name: &str) -> ProxyResult<ObjectMeta> {
        let path = self.resolve_path(identity, name).await?;
        Ok(self.backend.head(&path).await?)
    }

    async fn get(&self, identity: &str, name: &str) -> ProxyResult<Bytes> {
        let path = self.resolve_path(identity, name).await?;
        Ok(self.backend.get(&path).await?)
    }

    async fn get_stream(&self, identity: &str, name: &str) -> ProxyResult<ByteStream> {
        let path = self.resolve_path(identity, name).await?;
        Ok(self.backend.get_stream(&path).await?)
    }

    #[tracing::instrument(skip(self, body))]
    async fn put(
        &self,
        identity: &str,
        name: &str,
        body: ByteStream,
        content_type: Option<&str>,
    ) -> ProxyResult<Option<ContentHash>> {
        self.check_read_only()?;

        // Registered for the whole hash-and-commit window; the guard's
        // drop wakes waiters on every exit path.
        let _guard = self.coalescer.begin_write(identity, name);

        let raw = Spool::from_stream(body).await?;
        let (canonical, hash, size) = canonicalize_to_spool(raw).await?;
        let path = hash.blob_path();

        if self.backend.exists(&path).await? {
            // True dedup: the bytes are already pooled, only the name
            // needs to exist.
            tracing::debug!(identity, name, hash = %hash, "put deduplicated");
            self.metadata.put_mapping(identity, name, &hash).await?;
            return Ok(Some(hash));
        }

        self.upload_spool(&path, canonical, &PutOptions::public(content_type))
            .await?;
        self.metadata.put_pending_backup(&hash).await?;
        self.metadata.put_file_size(&hash, size).await?;
        // The mapping commits last: a crash before this line leaves an
        // orphaned blob, never a mapping to missing bytes.
        self.metadata.put_mapping(identity, name, &hash).await?;

        tracing::info!(identity, name, hash = %hash, size, "object stored");
        Ok(Some(hash))
    }

    async fn copy(
        &self,
        identity: &str,
        from_name: &str,
        to_name: &str,
    ) -> ProxyResult<Option<ContentHash>> {
        self.check_read_only()?;
        let hash = self
            .metadata
            .get_mapping(identity, from_name)
            .await?
            .ok_or_else(|| ProxyError::NotFound(format!("{identity}/{from_name}")))?;
        // No bytes move: the new name points at the same hash.
        self.metadata.put_mapping(identity, to_name, &hash).await?;
        Ok(Some(hash))
    }

    async fn remove(&self, identity: &str, name: &str) -> ProxyResult<()> {
        self.check_read_only()?;
        let hash = self
            .metadata
            .get_mapping(identity, name)
            .await?
            .ok_or_else(|| ProxyError::NotFound(format!("{identity}/{name}")))?;

        if self.metadata.delete_mapping(identity, name).await? {
            let remaining = self.metadata.reference_count(&hash).await?;
            if remaining == 0 {
                let path = hash.blob_path();
                self.backend.delete(&path).await?;
                self.metadata.delete_file_size(&hash).await?;
                self.metadata.delete_pending_backup(&hash).await?;
                tracing::info!(identity, name, hash = %hash, "last reference removed, blob deleted");
            }
        }
        Ok(())
    }

    async fn initiate_multipart(
        &self,
        identity: &str,
        name: &str,
        content_type: Option<&str>,
    ) -> ProxyResult<MultipartUpload> {
        self.check_read_only()?;
        let tempname = format!("{}/{}-{}", MULTIPART_TEMP_PREFIX, identity, Uuid::new_v4());
        self.metadata.put_multipart(identity, name, &tempname).await?;
        let upload_id = self
            .backend
            .initiate_multipart(&tempname, &PutOptions::public(content_type))
            .await?;
        tracing::debug!(identity, name, %tempname, %upload_id, "multipart upload initiated");
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
        let tempname = self.masked_tempname(identity, &upload.name).await?;
        Ok(self
            .backend
            .upload_part(&tempname, &upload.upload_id, part_number, data)
            .await?)
    }

    async fn list_parts(
        &self,
        identity: &str,
        upload: &MultipartUpload,
    ) -> ProxyResult<Vec<PartSummary>> {
        let tempname = self.masked_tempname(identity, &upload.name).await?;
        Ok(self
            .backend
            .list_parts(&tempname, &upload.upload_id)
            .await?)
    }

    #[tracing::instrument(skip(self, parts))]
    async fn complete_multipart(
        &self,
        identity: &str,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> ProxyResult<Option<ContentHash>> {
        self.check_read_only()?;
        let tempname = self.masked_tempname(identity, &upload.name).await?;
        let _guard = self.coalescer.begin_write(identity, &upload.name);

        match self
            .complete_multipart_inner(identity, upload, &tempname, parts)
            .await
        {
            Ok(hash) => Ok(Some(hash)),
            Err(e) => {
                // This is the one place partial state (a committed temp
                // object without a mapping) can persist, so the failure is
                // recorded in full before propagating.
                tracing::error!(
                    identity,
                    name = %upload.name,
                    %tempname,
                    upload_id = %upload.upload_id,
                    error = ?e,
                    "multipart completion failed"
                );
                Err(e)
            }
        }
    }

    async fn abort_multipart(
        &self,
        identity: &str,
        upload: &MultipartUpload,
    ) -> ProxyResult<()> {
        self.check_read_only()?;
        let tempname = self.masked_tempname(identity, &upload.name).await?;
        self.backend
            .abort_multipart(&tempname, &upload.upload_id)
            .await?;
        self.metadata.delete_multipart(&tempname).await?;
        Ok(())
    }
}

/// A blocking writer that tees canonical bytes into a SHA-512 digest and
/// a spool at the same time.
struct HashingSpoolWriter {
    hasher: ContentHasher,
    spool: SpoolWriter,
}

impl HashingSpoolWriter {
    fn new() -> Self {
        Self {
            hasher: ContentHash::hasher(),
            spool: SpoolWriter::new(),
        }
    }

    fn finish(self) -> std::io::Result<(Spool, ContentHash, u64)> {
        let len = self.spool.len();
        let spool = self.spool.into_spool()?;
        Ok((spool, self.hasher.finalize(), len))
    }
}

impl Write for HashingSpoolWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.spool.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.spool.flush()
    }
}

/// Canonicalize and hash a spooled payload in one pass, producing the
/// canonical bytes in a fresh spool along with their SHA-512 and length.
/// Runs on the blocking pool; the work is pure CPU and file I/O.
pub async fn canonicalize_to_spool(raw: Spool) -> ProxyResult<(Spool, ContentHash, u64)> {
    tokio::task::spawn_blocking(move || -> ProxyResult<(Spool, ContentHash, u64)> {
        let reader = raw.into_sync_reader()?;
        let mut writer = HashingSpoolWriter::new();
        canonicalize(reader, &mut writer)?;
        let (spool, hash, len) = writer.finish()?;
        Ok((spool, hash, len))
    })
    .await
    .map_err(|e| ProxyError::Internal(format!("canonicalize task failed: {e}")))?
}

/// Hash a raw (non-canonicalized) spool. Used by the Rivet upload path,
/// where the caller pre-commits to the hash of the exact bytes sent.
pub async fn hash_spool_raw(spool: Spool) -> ProxyResult<(Spool, ContentHash)> {
    tokio::task::spawn_blocking(move || -> ProxyResult<(Spool, ContentHash)> {
        let mut reader = spool.into_sync_reader()?;
        let mut writer = HashingSpoolWriter::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
        }
        let (spool, hash, _len) = writer.finish()?;
        Ok((spool, hash))
    })
    .await
    .map_err(|e| ProxyError::Internal(format!("hashing task failed: {e}")))?
}
