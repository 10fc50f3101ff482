//! Tests for the dumps pass-through namespace.

mod common;

use common::{byte_stream, TestPool};
use silo_metadata::NameMapRepo;
use silo_proxy::{is_dump_name, ProxyError, TenantStore};

#[tokio::test]
async fn test_dump_put_bypasses_content_addressing() {
    let pool = TestPool::new().await;
    let name = "backups/dumps/2024-05-01.sql";
    assert!(is_dump_name(name));

    let store = pool.proxy.store_for(name);
    let hash = store
        .put("id", name, byte_stream(b"CREATE TABLE ...".to_vec()), Some("application/sql"))
        .await
        .unwrap();

    // No content hash, no name-map row, no pooled blob.
    assert!(hash.is_none());
    assert!(pool.metadata.get_mapping("id", name).await.unwrap().is_none());
    assert_eq!(pool.blob_count(), 0);

    // The object is readable back through the same route.
    let data = store.get("id", name).await.unwrap();
    assert_eq!(data.as_ref(), b"CREATE TABLE ...");
    assert!(pool.dumps_root.join("id/backups/dumps/2024-05-01.sql").exists());
}

#[tokio::test]
async fn test_dump_leading_slash_normalized() {
    let pool = TestPool::new().await;
    let name = "/backups/dumps/x.sql";
    let store = pool.proxy.store_for(name);
    store
        .put("id", name, byte_stream(b"dump".to_vec()), None)
        .await
        .unwrap();
    assert!(pool.dumps_root.join("id/backups/dumps/x.sql").exists());
}

#[tokio::test]
async fn test_copy_across_namespaces_rejected() {
    let pool = TestPool::new().await;
    let err = pool
        .proxy
        .copy("id", "backups/dumps/a.sql", "regular-object")
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::InvalidRequest(_)));

    let err = pool
        .proxy
        .copy("id", "regular-object", "backups/dumps/b.sql")
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_regular_names_route_to_content_store() {
    let pool = TestPool::new().await;
    let store = pool.proxy.store_for("photo.png");
    let hash = store
        .put("id", "photo.png", byte_stream(b"pixels".to_vec()), None)
        .await
        .unwrap();
    assert!(hash.is_some());
    assert_eq!(pool.blob_count(), 1);
}
