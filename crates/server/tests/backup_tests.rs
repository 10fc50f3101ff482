//! Tests for the pending-backup replication sweep.

mod common;

use common::{TestServer, TEST_IDENTITY};
use futures::stream;
use silo_core::ContentHash;
use silo_metadata::BackupRepo;
use silo_proxy::TenantStore;
use silo_server::backup::run_backup_sweep;
use silo_storage::{BlobBackend, ByteStream, FilesystemBackend, PutOptions};
use std::sync::Arc;

fn body_stream(data: &'static [u8]) -> ByteStream {
    Box::pin(stream::iter(vec![Ok(bytes::Bytes::from_static(data))]))
}

async fn backup_backend() -> (tempfile::TempDir, Arc<dyn BlobBackend>) {
    let temp = tempfile::tempdir().unwrap();
    let backend: Arc<dyn BlobBackend> =
        Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
    (temp, backend)
}

#[tokio::test]
async fn test_sweep_replicates_and_drains() {
    let server = TestServer::new().await;
    let (_temp, backup) = backup_backend().await;

    let hash = server
        .state
        .proxy
        .store_for("a.bin")
        .put(TEST_IDENTITY, "a.bin", body_stream(b"replicate me"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.state.metadata.list_pending_backups().await.unwrap().len(), 1);

    let stats = run_backup_sweep(&server.state.backend, &backup, &server.state.metadata)
        .await
        .unwrap();
    assert_eq!(stats.replicated, 1);
    assert_eq!(stats.errors, 0);

    assert!(backup.exists(&hash.blob_path()).await.unwrap());
    assert_eq!(
        backup.get(&hash.blob_path()).await.unwrap().as_ref(),
        b"replicate me"
    );
    assert!(server.state.metadata.list_pending_backups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_is_idempotent() {
    let server = TestServer::new().await;
    let (_temp, backup) = backup_backend().await;

    let hash = server
        .state
        .proxy
        .store_for("b.bin")
        .put(TEST_IDENTITY, "b.bin", body_stream(b"twice"), None)
        .await
        .unwrap()
        .unwrap();

    run_backup_sweep(&server.state.backend, &backup, &server.state.metadata)
        .await
        .unwrap();

    // Re-queue the same hash: a second sweep finds it already present and
    // just drains the row.
    server.state.metadata.put_pending_backup(&hash).await.unwrap();
    let stats = run_backup_sweep(&server.state.backend, &backup, &server.state.metadata)
        .await
        .unwrap();
    assert_eq!(stats.already_present, 1);
    assert_eq!(stats.replicated, 0);
    assert!(server.state.metadata.list_pending_backups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_restores_from_backup() {
    let server = TestServer::new().await;
    let (_temp, backup) = backup_backend().await;

    // A blob that exists only on the backup side but is queued as pending.
    let hash = ContentHash::compute(b"lost from primary");
    backup
        .put(
            &hash.blob_path(),
            bytes::Bytes::from_static(b"lost from primary"),
            &PutOptions::public(None),
        )
        .await
        .unwrap();
    server.state.metadata.put_pending_backup(&hash).await.unwrap();

    let stats = run_backup_sweep(&server.state.backend, &backup, &server.state.metadata)
        .await
        .unwrap();
    assert_eq!(stats.restored, 1);
    assert!(server.state.backend.exists(&hash.blob_path()).await.unwrap());
    assert!(server.state.metadata.list_pending_backups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_leaves_unresolvable_rows() {
    let server = TestServer::new().await;
    let (_temp, backup) = backup_backend().await;

    // Pending hash with no bytes anywhere: the row stays for a later sweep.
    let hash = ContentHash::compute(b"phantom");
    server.state.metadata.put_pending_backup(&hash).await.unwrap();

    let stats = run_backup_sweep(&server.state.backend, &backup, &server.state.metadata)
        .await
        .unwrap();
    assert_eq!(stats.errors, 1);
    assert_eq!(server.state.metadata.list_pending_backups().await.unwrap().len(), 1);
}
