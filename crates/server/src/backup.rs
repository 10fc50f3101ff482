//! Pending-backup replication sweep.
//!
//! Hashes land in the pending set whenever a new blob is first stored;
//! the sweep drains the set by copying each blob to the secondary
//! backend. Replication is at-least-once: redoing a hash is always safe,
//! and a row is only removed after its copy succeeded.

use futures::StreamExt;
use silo_metadata::{BackupRepo, MetadataStore};
use silo_storage::{BlobBackend, PutOptions, StorageError};
use std::sync::Arc;
use std::time::Duration;

/// Outcome counters for one sweep.
#[derive(Debug, Default)]
pub struct SweepStats {
    pub replicated: usize,
    pub already_present: usize,
    pub restored: usize,
    pub errors: usize,
}

/// Drain the pending-backup set once.
pub async fn run_backup_sweep(
    primary: &Arc<dyn BlobBackend>,
    backup: &Arc<dyn BlobBackend>,
    metadata: &Arc<dyn MetadataStore>,
) -> Result<SweepStats, silo_metadata::MetadataError> {
    let pending = metadata.list_pending_backups().await?;
    let mut stats = SweepStats::default();

    for hash in pending {
        let path = hash.blob_path();

        let on_primary = match primary.exists(&path).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(%path, error = %e, "backup sweep: primary probe failed");
                stats.errors += 1;
                continue;
            }
        };

        if !on_primary {
            // Odd state: the blob is pending backup but missing from the
            // primary. If the backup has it, restore it; otherwise leave
            // the row for a later sweep once someone re-stores the bytes.
            match copy_between(backup, primary, &path).await {
                Ok(true) => {
                    tracing::warn!(%path, "backup sweep: restored blob from backup to primary");
                    stats.restored += 1;
                }
                Ok(false) => {
                    tracing::error!(%path, "backup sweep: blob missing from both backends");
                    stats.errors += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(%path, error = %e, "backup sweep: restore failed");
                    stats.errors += 1;
                    continue;
                }
            }
        } else {
            match backup.exists(&path).await {
                Ok(true) => stats.already_present += 1,
                Ok(false) => match copy_between(primary, backup, &path).await {
                    Ok(true) => stats.replicated += 1,
                    Ok(false) => {
                        stats.errors += 1;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(%path, error = %e, "backup sweep: replication failed");
                        stats.errors += 1;
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(%path, error = %e, "backup sweep: backup probe failed");
                    stats.errors += 1;
                    continue;
                }
            }
        }

        metadata.delete_pending_backup(&hash).await?;
    }

    tracing::info!(
        replicated = stats.replicated,
        already_present = stats.already_present,
        restored = stats.restored,
        errors = stats.errors,
        "backup sweep finished"
    );
    Ok(stats)
}

/// Stream one blob from `from` to `to`. Returns false if the source does
/// not have it.
async fn copy_between(
    from: &Arc<dyn BlobBackend>,
    to: &Arc<dyn BlobBackend>,
    path: &str,
) -> Result<bool, StorageError> {
    let mut stream = match from.get_stream(path).await {
        Ok(stream) => stream,
        Err(StorageError::NotFound(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    let mut upload = to.put_stream(path, &PutOptions::public(None)).await?;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                if let Err(e) = upload.write(chunk).await {
                    let _ = upload.abort().await;
                    return Err(e);
                }
            }
            Err(e) => {
                let _ = upload.abort().await;
                return Err(e);
            }
        }
    }
    upload.finish().await?;
    Ok(true)
}

/// Spawn the periodic sweep task. Sweeps run strictly one after another.
pub fn spawn_backup_task(
    primary: Arc<dyn BlobBackend>,
    backup: Arc<dyn BlobBackend>,
    metadata: Arc<dyn MetadataStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = run_backup_sweep(&primary, &backup, &metadata).await {
                tracing::error!(error = %e, "backup sweep failed");
            }
        }
    })
}
