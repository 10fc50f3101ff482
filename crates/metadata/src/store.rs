//! Metadata store trait and the SQLite implementation.
//!
//! Every statement here is a single logical operation: there are no
//! multi-statement transactions spanning canonicalization or network
//! fetches. Consistency between "bytes are stored" and "name points at
//! that hash" is achieved by sequencing in the callers, not two-phase
//! commit.

use crate::error::{MetadataError, MetadataResult};
use async_trait::async_trait;
use silo_core::{to_short_name, ContentHash};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Name-to-hash mapping operations.
///
/// Object names are shortened to their 255-byte surrogate inside every
/// method, so callers never have to remember to do it.
#[async_trait]
pub trait NameMapRepo: Send + Sync {
    /// Look up the hash a (identity, name) pair maps to.
    async fn get_mapping(&self, identity: &str, name: &str)
        -> MetadataResult<Option<ContentHash>>;

    /// Insert or update a mapping.
    async fn put_mapping(
        &self,
        identity: &str,
        name: &str,
        hash: &ContentHash,
    ) -> MetadataResult<()>;

    /// Delete a mapping. Returns whether a row was removed.
    async fn delete_mapping(&self, identity: &str, name: &str) -> MetadataResult<bool>;

    /// Number of mappings referencing a hash, across all identities.
    async fn reference_count(&self, hash: &ContentHash) -> MetadataResult<u64>;

    /// Whether any mapping references this hash.
    async fn hash_mapped(&self, hash: &ContentHash) -> MetadataResult<bool> {
        Ok(self.reference_count(hash).await? > 0)
    }
}

/// Write-once size accounting per hash.
#[async_trait]
pub trait FileSizeRepo: Send + Sync {
    /// Record a hash's size. Insert-if-absent: an existing record is
    /// never updated.
    async fn put_file_size(&self, hash: &ContentHash, size: u64) -> MetadataResult<()>;

    /// Fetch a hash's recorded size.
    async fn get_file_size(&self, hash: &ContentHash) -> MetadataResult<Option<u64>>;

    /// Remove the size record for a hash.
    async fn delete_file_size(&self, hash: &ContentHash) -> MetadataResult<()>;
}

/// The set of hashes awaiting replication to the backup backend.
#[async_trait]
pub trait BackupRepo: Send + Sync {
    /// Mark a hash as pending backup. Insert-if-absent.
    async fn put_pending_backup(&self, hash: &ContentHash) -> MetadataResult<()>;

    /// All hashes currently pending backup.
    async fn list_pending_backups(&self) -> MetadataResult<Vec<ContentHash>>;

    /// Remove a hash from the pending set.
    async fn delete_pending_backup(&self, hash: &ContentHash) -> MetadataResult<()>;
}

/// Bidirectional multipart session bookkeeping.
#[async_trait]
pub trait MultipartRepo: Send + Sync {
    /// Record a session mapping (identity, name) to a temp object name.
    async fn put_multipart(
        &self,
        identity: &str,
        name: &str,
        tempname: &str,
    ) -> MetadataResult<()>;

    /// Forward lookup: the temp name for an in-progress upload.
    async fn get_multipart_temp(
        &self,
        identity: &str,
        name: &str,
    ) -> MetadataResult<Option<String>>;

    /// Reverse lookup: the original (shortened) object name for a temp name.
    async fn get_multipart_name(&self, tempname: &str) -> MetadataResult<Option<String>>;

    /// Delete a session by its temp name.
    async fn delete_multipart(&self, tempname: &str) -> MetadataResult<()>;
}

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    NameMapRepo + FileSizeRepo + BackupRepo + MultipartRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store, running migrations.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // avoids persistent "database is locked" failures under axum
            // concurrency.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn decode_hash(bytes: &[u8]) -> MetadataResult<ContentHash> {
    ContentHash::from_slice(bytes)
        .map_err(|e| MetadataError::InvalidData(format!("stored hash column: {e}")))
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS name_map (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL,
                name TEXT NOT NULL,
                hash BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_name_map_forward ON name_map (identity, name)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_name_map_reverse ON name_map (hash)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS multipart_uploads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL,
                name TEXT NOT NULL,
                tempname TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_multipart_forward ON multipart_uploads (identity, name)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_multipart_reverse ON multipart_uploads (tempname)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS filesizes (
                hash BLOB NOT NULL PRIMARY KEY,
                size INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_backup (
                hash BLOB NOT NULL PRIMARY KEY
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NameMapRepo for SqliteStore {
    async fn get_mapping(
        &self,
        identity: &str,
        name: &str,
    ) -> MetadataResult<Option<ContentHash>> {
        let name = to_short_name(name);
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT hash FROM name_map WHERE identity = ? AND name = ?")
                .bind(identity)
                .bind(name.as_ref())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(bytes,)| decode_hash(&bytes)).transpose()
    }

    async fn put_mapping(
        &self,
        identity: &str,
        name: &str,
        hash: &ContentHash,
    ) -> MetadataResult<()> {
        let name = to_short_name(name);
        sqlx::query(
            r#"
            INSERT INTO name_map (identity, name, hash) VALUES (?, ?, ?)
            ON CONFLICT (identity, name) DO UPDATE SET hash = excluded.hash
            "#,
        )
        .bind(identity)
        .bind(name.as_ref())
        .bind(hash.as_bytes().as_slice())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_mapping(&self, identity: &str, name: &str) -> MetadataResult<bool> {
        let name = to_short_name(name);
        let result = sqlx::query("DELETE FROM name_map WHERE identity = ? AND name = ?")
            .bind(identity)
            .bind(name.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reference_count(&self, hash: &ContentHash) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM name_map WHERE hash = ?")
            .bind(hash.as_bytes().as_slice())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl FileSizeRepo for SqliteStore {
    async fn put_file_size(&self, hash: &ContentHash, size: u64) -> MetadataResult<()> {
        sqlx::query("INSERT OR IGNORE INTO filesizes (hash, size) VALUES (?, ?)")
            .bind(hash.as_bytes().as_slice())
            .bind(size as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_file_size(&self, hash: &ContentHash) -> MetadataResult<Option<u64>> {
        let size: Option<i64> = sqlx::query_scalar("SELECT size FROM filesizes WHERE hash = ?")
            .bind(hash.as_bytes().as_slice())
            .fetch_optional(&self.pool)
            .await?;
        Ok(size.map(|s| s as u64))
    }

    async fn delete_file_size(&self, hash: &ContentHash) -> MetadataResult<()> {
        sqlx::query("DELETE FROM filesizes WHERE hash = ?")
            .bind(hash.as_bytes().as_slice())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BackupRepo for SqliteStore {
    async fn put_pending_backup(&self, hash: &ContentHash) -> MetadataResult<()> {
        sqlx::query("INSERT OR IGNORE INTO pending_backup (hash) VALUES (?)")
            .bind(hash.as_bytes().as_slice())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_pending_backups(&self) -> MetadataResult<Vec<ContentHash>> {
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as("SELECT hash FROM pending_backup")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|(bytes,)| decode_hash(bytes)).collect()
    }

    async fn delete_pending_backup(&self, hash: &ContentHash) -> MetadataResult<()> {
        sqlx::query("DELETE FROM pending_backup WHERE hash = ?")
            .bind(hash.as_bytes().as_slice())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MultipartRepo for SqliteStore {
    async fn put_multipart(
        &self,
        identity: &str,
        name: &str,
        tempname: &str,
    ) -> MetadataResult<()> {
        let name = to_short_name(name);
        sqlx::query(
            r#"
            INSERT INTO multipart_uploads (identity, name, tempname) VALUES (?, ?, ?)
            ON CONFLICT (identity, name) DO UPDATE SET tempname = excluded.tempname
            "#,
        )
        .bind(identity)
        .bind(name.as_ref())
        .bind(tempname)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_multipart_temp(
        &self,
        identity: &str,
        name: &str,
    ) -> MetadataResult<Option<String>> {
        let name = to_short_name(name);
        let tempname: Option<String> = sqlx::query_scalar(
            "SELECT tempname FROM multipart_uploads WHERE identity = ? AND name = ?",
        )
        .bind(identity)
        .bind(name.as_ref())
        .fetch_optional(&self.pool)
        .await?;
        Ok(tempname)
    }

    async fn get_multipart_name(&self, tempname: &str) -> MetadataResult<Option<String>> {
        let name: Option<String> =
            sqlx::query_scalar("SELECT name FROM multipart_uploads WHERE tempname = ?")
                .bind(tempname)
                .fetch_optional(&self.pool)
                .await?;
        Ok(name)
    }

    async fn delete_multipart(&self, tempname: &str) -> MetadataResult<()> {
        sqlx::query("DELETE FROM multipart_uploads WHERE tempname = ?")
            .bind(tempname)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let temp = tempdir().unwrap();
        let store = SqliteStore::new(temp.path().join("metadata.db"))
            .await
            .unwrap();
        (temp, store)
    }

    #[tokio::test]
    async fn test_mapping_upsert_and_lookup() {
        let (_temp, store) = store().await;
        let first = ContentHash::compute(b"one");
        let second = ContentHash::compute(b"two");

        assert!(store.get_mapping("id", "a.png").await.unwrap().is_none());
        store.put_mapping("id", "a.png", &first).await.unwrap();
        assert_eq!(store.get_mapping("id", "a.png").await.unwrap(), Some(first));

        // Upsert replaces the hash in place.
        store.put_mapping("id", "a.png", &second).await.unwrap();
        assert_eq!(
            store.get_mapping("id", "a.png").await.unwrap(),
            Some(second)
        );
        assert_eq!(store.reference_count(&first).await.unwrap(), 0);
        assert_eq!(store.reference_count(&second).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mappings_are_identity_scoped() {
        let (_temp, store) = store().await;
        let hash = ContentHash::compute(b"shared");
        store.put_mapping("alpha", "x", &hash).await.unwrap();
        assert!(store.get_mapping("beta", "x").await.unwrap().is_none());
        store.put_mapping("beta", "x", &hash).await.unwrap();
        assert_eq!(store.reference_count(&hash).await.unwrap(), 2);
        assert!(store.hash_mapped(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_mapping_reports_removal() {
        let (_temp, store) = store().await;
        let hash = ContentHash::compute(b"here");
        store.put_mapping("id", "n", &hash).await.unwrap();
        assert!(store.delete_mapping("id", "n").await.unwrap());
        assert!(!store.delete_mapping("id", "n").await.unwrap());
        assert!(!store.hash_mapped(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_size_is_write_once() {
        let (_temp, store) = store().await;
        let hash = ContentHash::compute(b"sized");
        store.put_file_size(&hash, 100).await.unwrap();
        // Second insert for the same hash is ignored, never updated.
        store.put_file_size(&hash, 999).await.unwrap();
        assert_eq!(store.get_file_size(&hash).await.unwrap(), Some(100));
        store.delete_file_size(&hash).await.unwrap();
        assert_eq!(store.get_file_size(&hash).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_backup_set_semantics() {
        let (_temp, store) = store().await;
        let a = ContentHash::compute(b"a");
        let b = ContentHash::compute(b"b");
        store.put_pending_backup(&a).await.unwrap();
        store.put_pending_backup(&a).await.unwrap();
        store.put_pending_backup(&b).await.unwrap();
        let mut pending = store.list_pending_backups().await.unwrap();
        pending.sort_by_key(|h| h.to_hex());
        assert_eq!(pending.len(), 2);
        store.delete_pending_backup(&a).await.unwrap();
        assert_eq!(store.list_pending_backups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_multipart_bidirectional_lookup() {
        let (_temp, store) = store().await;
        store
            .put_multipart("id", "video.mp4", "multitmp/id-abc")
            .await
            .unwrap();
        assert_eq!(
            store.get_multipart_temp("id", "video.mp4").await.unwrap(),
            Some("multitmp/id-abc".to_string())
        );
        assert_eq!(
            store.get_multipart_name("multitmp/id-abc").await.unwrap(),
            Some("video.mp4".to_string())
        );
        store.delete_multipart("multitmp/id-abc").await.unwrap();
        assert!(store
            .get_multipart_temp("id", "video.mp4")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_long_names_use_surrogates_consistently() {
        let (_temp, store) = store().await;
        let long_name = "segment/".repeat(64);
        assert!(long_name.len() > silo_core::MAX_NAME_BYTES);
        let hash = ContentHash::compute(b"long");

        store.put_mapping("id", &long_name, &hash).await.unwrap();
        // Read path applies the same surrogate derivation.
        assert_eq!(
            store.get_mapping("id", &long_name).await.unwrap(),
            Some(hash)
        );
        assert!(store.delete_mapping("id", &long_name).await.unwrap());
    }
}
