//! Local filesystem storage backend.
//!
//! Backs the dumps namespace and the test suites. Multipart uploads are
//! staged as individual part files and concatenated on completion.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    BlobBackend, ByteStream, CompletedPart, ObjectMeta, PartSummary, PutOptions, StreamingUpload,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Directory under the root where multipart parts are staged.
const UPLOADS_DIR: &str = ".uploads";

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Get the full path for a key, rejecting traversal attempts.
    ///
    /// Keys are tenant-influenced, so every component must be a plain
    /// path segment.
    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "contains unsafe path component: {key}"
                    )));
                }
            }
        }
        Ok(self.root.join(key))
    }

    fn upload_dir(&self, upload_id: &str) -> StorageResult<PathBuf> {
        // Upload IDs are generated by us as UUIDs; reject anything else.
        Uuid::parse_str(upload_id)
            .map_err(|_| StorageError::UnknownUpload(upload_id.to_string()))?;
        Ok(self.root.join(UPLOADS_DIR).join(upload_id))
    }

    fn part_path(&self, upload_id: &str, part_number: i32) -> StorageResult<PathBuf> {
        Ok(self.upload_dir(upload_id)?.join(format!("{part_number:05}.part")))
    }

    /// Ensure parent directory exists.
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write a file atomically via a sibling temp file and rename.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.ensure_parent(path).await?;
        let tmp = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn map_not_found(err: std::io::Error, key: &str) -> StorageError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(err)
        }
    }
}

#[async_trait]
impl BlobBackend for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key)?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| Self::map_not_found(e, key))?;

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
            content_type: None,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| Self::map_not_found(e, key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| Self::map_not_found(e, key))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data, _opts), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, _opts: &PutOptions) -> StorageResult<()> {
        let path = self.key_path(key)?;
        self.write_atomic(&path, &data).await
    }

    #[instrument(skip(self, _opts), fields(backend = "filesystem"))]
    async fn put_stream(
        &self,
        key: &str,
        _opts: &PutOptions,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.key_path(key)?;
        self.ensure_parent(&path).await?;
        let tmp = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        let file = fs::File::create(&tmp).await?;
        Ok(Box::new(FilesystemUpload {
            file: Some(file),
            tmp,
            dest: path,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::map_not_found(e, key))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let from_path = self.key_path(from)?;
        let to_path = self.key_path(to)?;
        self.ensure_parent(&to_path).await?;
        fs::copy(&from_path, &to_path)
            .await
            .map_err(|e| Self::map_not_found(e, from))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn set_access(&self, key: &str, _public: bool) -> StorageResult<()> {
        // The filesystem has no access-control notion; validate the key
        // and confirm the object exists so the call stays meaningful.
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self, _opts), fields(backend = "filesystem"))]
    async fn initiate_multipart(&self, key: &str, _opts: &PutOptions) -> StorageResult<String> {
        self.key_path(key)?;
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;
        Ok(upload_id)
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<CompletedPart> {
        self.key_path(key)?;
        let dir = self.upload_dir(upload_id)?;
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::UnknownUpload(upload_id.to_string()));
        }
        let part_path = self.part_path(upload_id, part_number)?;
        self.write_atomic(&part_path, &data).await?;
        Ok(CompletedPart {
            part_number,
            etag: format!("fs-{}-{}", part_number, data.len()),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list_parts(&self, key: &str, upload_id: &str) -> StorageResult<Vec<PartSummary>> {
        self.key_path(key)?;
        let dir = self.upload_dir(upload_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::UnknownUpload(upload_id.to_string()));
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            let Some(stem) = name.strip_suffix(".part") else {
                continue;
            };
            let Ok(part_number) = stem.parse::<i32>() else {
                continue;
            };
            let size = entry.metadata().await?.len();
            parts.push(PartSummary {
                part_number,
                size,
                etag: format!("fs-{}-{}", part_number, size),
            });
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    #[instrument(skip(self, parts), fields(backend = "filesystem", parts = parts.len()))]
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        use tokio::io::AsyncReadExt;

        let dest = self.key_path(key)?;
        let dir = self.upload_dir(upload_id)?;
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::UnknownUpload(upload_id.to_string()));
        }

        let mut ordered: Vec<&CompletedPart> = parts.iter().collect();
        ordered.sort_by_key(|p| p.part_number);

        self.ensure_parent(&dest).await?;
        let tmp = dest.with_extension(format!("tmp.{}", Uuid::new_v4()));
        let mut out = fs::File::create(&tmp).await?;
        for part in ordered {
            let part_path = self.part_path(upload_id, part.part_number)?;
            let mut file = fs::File::open(&part_path)
                .await
                .map_err(|e| Self::map_not_found(e, &format!("part {}", part.part_number)))?;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
            }
        }
        out.sync_all().await?;
        drop(out);
        fs::rename(&tmp, &dest).await?;
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> StorageResult<()> {
        let dir = self.upload_dir(upload_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::UnknownUpload(upload_id.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

/// Streaming upload writing to a temp file and renaming on finish.
struct FilesystemUpload {
    file: Option<fs::File>,
    tmp: PathBuf,
    dest: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("upload already finished")))?;
        file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        if let Some(mut file) = self.file.take() {
            file.sync_all().await?;
        }
        fs::rename(&self.tmp, &self.dest).await?;
        Ok(self.bytes_written)
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.file.take();
        match fs::remove_file(&self.tmp).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn backend() -> (tempfile::TempDir, FilesystemBackend) {
        let temp = tempdir().unwrap();
        let backend = FilesystemBackend::new(temp.path()).await.unwrap();
        (temp, backend)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_temp, backend) = backend().await;
        backend
            .put("blobs/a/bcd/key", Bytes::from_static(b"data"), &PutOptions::default())
            .await
            .unwrap();
        assert!(backend.exists("blobs/a/bcd/key").await.unwrap());
        assert_eq!(backend.get("blobs/a/bcd/key").await.unwrap().as_ref(), b"data");
        assert_eq!(backend.head("blobs/a/bcd/key").await.unwrap().size, 4);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_temp, backend) = backend().await;
        assert!(matches!(
            backend.get("nope").await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_key_traversal_rejected() {
        let (_temp, backend) = backend().await;
        for key in ["../escape", "/absolute", "a/../b"] {
            assert!(matches!(
                backend.get(key).await.unwrap_err(),
                StorageError::InvalidKey(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_copy_duplicates_bytes() {
        let (_temp, backend) = backend().await;
        backend
            .put("src", Bytes::from_static(b"payload"), &PutOptions::default())
            .await
            .unwrap();
        backend.copy("src", "dir/dst").await.unwrap();
        assert_eq!(backend.get("dir/dst").await.unwrap().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_multipart_out_of_order_parts() {
        let (_temp, backend) = backend().await;
        let opts = PutOptions::default();
        let upload_id = backend.initiate_multipart("assembled", &opts).await.unwrap();

        let p2 = backend
            .upload_part("assembled", &upload_id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let p1 = backend
            .upload_part("assembled", &upload_id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        let listed = backend.list_parts("assembled", &upload_id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].part_number, 1);

        backend
            .complete_multipart("assembled", &upload_id, &[p2, p1])
            .await
            .unwrap();
        assert_eq!(
            backend.get("assembled").await.unwrap().as_ref(),
            b"hello world"
        );
        // Staging area is cleaned up.
        assert!(matches!(
            backend.list_parts("assembled", &upload_id).await.unwrap_err(),
            StorageError::UnknownUpload(_)
        ));
    }

    #[tokio::test]
    async fn test_multipart_abort_discards_parts() {
        let (_temp, backend) = backend().await;
        let upload_id = backend
            .initiate_multipart("gone", &PutOptions::default())
            .await
            .unwrap();
        backend
            .upload_part("gone", &upload_id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        backend.abort_multipart("gone", &upload_id).await.unwrap();
        assert!(!backend.exists("gone").await.unwrap());
        assert!(matches!(
            backend
                .upload_part("gone", &upload_id, 2, Bytes::from_static(b"y"))
                .await
                .unwrap_err(),
            StorageError::UnknownUpload(_)
        ));
    }

    #[tokio::test]
    async fn test_streaming_upload_renames_on_finish() {
        let (_temp, backend) = backend().await;
        let mut upload = backend
            .put_stream("streamed", &PutOptions::default())
            .await
            .unwrap();
        upload.write(Bytes::from_static(b"abc")).await.unwrap();
        upload.write(Bytes::from_static(b"def")).await.unwrap();
        assert!(!backend.exists("streamed").await.unwrap());
        let written = upload.finish().await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(backend.get("streamed").await.unwrap().as_ref(), b"abcdef");
    }
}
