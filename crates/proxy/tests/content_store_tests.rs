//! End-to-end tests for the content-addressing store.

mod common;

use common::{byte_stream, png_chunk, png_file, slow_stream, TestPool};
use silo_core::ContentHash;
use silo_metadata::{BackupRepo, FileSizeRepo, MultipartRepo, NameMapRepo};
use silo_proxy::{ProxyError, TenantStore};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_put_twice_stores_one_blob() {
    let pool = TestPool::new().await;
    let payload = b"the same bytes".to_vec();

    let first = pool
        .store
        .put("id", "one.bin", byte_stream(payload.clone()), None)
        .await
        .unwrap()
        .unwrap();
    let second = pool
        .store
        .put("id", "two.bin", byte_stream(payload.clone()), None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(pool.blob_count(), 1);
    assert_eq!(pool.metadata.reference_count(&first).await.unwrap(), 2);
    assert_eq!(
        pool.metadata.get_file_size(&first).await.unwrap(),
        Some(payload.len() as u64)
    );
}

#[tokio::test]
async fn test_put_hash_is_of_canonical_bytes() {
    let pool = TestPool::new().await;
    let with_time = png_file(&[
        png_chunk(*b"IHDR", &[0, 0, 0, 1, 0, 0, 0, 1, 8, 6, 0, 0, 0]),
        png_chunk(*b"tIME", &[7, 230, 1, 1, 0, 0, 0]),
        png_chunk(*b"IDAT", &[1, 2, 3, 4]),
        png_chunk(*b"IEND", &[]),
    ]);
    let canonical = png_file(&[
        png_chunk(*b"IHDR", &[0, 0, 0, 1, 0, 0, 0, 1, 8, 6, 0, 0, 0]),
        png_chunk(*b"IDAT", &[1, 2, 3, 4]),
        png_chunk(*b"IEND", &[]),
    ]);

    let hash = pool
        .store
        .put("id", "pic.png", byte_stream(with_time.clone()), Some("image/png"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(hash, ContentHash::compute(&canonical));
    // The stored blob is the canonical form, not the raw upload.
    let stored = pool.store.get("id", "pic.png").await.unwrap();
    assert_eq!(stored.as_ref(), canonical.as_slice());
    assert_eq!(
        pool.metadata.get_file_size(&hash).await.unwrap(),
        Some(canonical.len() as u64)
    );
}

#[tokio::test]
async fn test_timestamp_variants_deduplicate() {
    let pool = TestPool::new().await;
    let image1 = png_file(&[
        png_chunk(*b"IHDR", &[0, 0, 0, 2, 0, 0, 0, 2, 8, 2, 0, 0, 0]),
        png_chunk(*b"tIME", &[7, 230, 1, 1, 11, 22, 33]),
        png_chunk(*b"IDAT", &[9, 9, 9, 9, 9, 9]),
        png_chunk(*b"IEND", &[]),
    ]);
    let image2 = png_file(&[
        png_chunk(*b"IHDR", &[0, 0, 0, 2, 0, 0, 0, 2, 8, 2, 0, 0, 0]),
        png_chunk(*b"tIME", &[7, 231, 6, 30, 1, 2, 3]),
        png_chunk(*b"tEXt", b"date:create\02023-06-30T01:02:03\0"),
        png_chunk(*b"IDAT", &[9, 9, 9, 9, 9, 9]),
        png_chunk(*b"IEND", &[]),
    ]);

    let h1 = pool
        .store
        .put("id", "image1.png", byte_stream(image1), Some("image/png"))
        .await
        .unwrap()
        .unwrap();
    let h2 = pool
        .store
        .put("id", "image2.png", byte_stream(image2), Some("image/png"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h1, h2);
    assert_eq!(pool.blob_count(), 1);
}

#[tokio::test]
async fn test_reads_fail_not_found_without_mapping() {
    let pool = TestPool::new().await;
    let err = pool.store.get("id", "missing").await.unwrap_err();
    assert!(err.is_not_found());
    let err = TenantStore::metadata(&*pool.store, "id", "missing").await.unwrap_err();
    assert!(err.is_not_found());
    let err = pool.store.exists("id", "missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_copy_creates_alias_without_moving_bytes() {
    let pool = TestPool::new().await;
    let hash = pool
        .store
        .put("id", "original", byte_stream(b"payload".to_vec()), None)
        .await
        .unwrap()
        .unwrap();

    let copied = pool
        .store
        .copy("id", "original", "alias")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(copied, hash);
    assert_eq!(pool.blob_count(), 1);
    assert_eq!(pool.metadata.reference_count(&hash).await.unwrap(), 2);
    assert_eq!(pool.store.get("id", "alias").await.unwrap().as_ref(), b"payload");
}

#[tokio::test]
async fn test_remove_respects_reference_counts() {
    let pool = TestPool::new().await;
    let hash = pool
        .store
        .put("id", "a", byte_stream(b"shared".to_vec()), None)
        .await
        .unwrap()
        .unwrap();
    pool.store
        .put("id", "b", byte_stream(b"shared".to_vec()), None)
        .await
        .unwrap();

    // Removing a non-last reference leaves the blob intact.
    pool.store.remove("id", "a").await.unwrap();
    assert_eq!(pool.blob_count(), 1);
    assert_eq!(pool.metadata.get_file_size(&hash).await.unwrap(), Some(6));

    // Removing the last reference deletes the blob and its bookkeeping.
    pool.store.remove("id", "b").await.unwrap();
    assert_eq!(pool.blob_count(), 0);
    assert_eq!(pool.metadata.get_file_size(&hash).await.unwrap(), None);
    assert!(pool
        .metadata
        .list_pending_backups()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_remove_unmapped_name_is_not_found() {
    let pool = TestPool::new().await;
    let err = pool.store.remove("id", "never-stored").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_read_only_mode_fails_before_side_effects() {
    let pool = TestPool::new().await;
    pool.store
        .put("id", "existing", byte_stream(b"x".to_vec()), None)
        .await
        .unwrap();

    pool.read_only.store(true, Ordering::Relaxed);

    assert!(matches!(
        pool.store
            .put("id", "new", byte_stream(b"y".to_vec()), None)
            .await
            .unwrap_err(),
        ProxyError::ReadOnly
    ));
    assert!(matches!(
        pool.store.copy("id", "existing", "copy").await.unwrap_err(),
        ProxyError::ReadOnly
    ));
    assert!(matches!(
        pool.store.remove("id", "existing").await.unwrap_err(),
        ProxyError::ReadOnly
    ));
    assert!(matches!(
        pool.store
            .initiate_multipart("id", "mp", None)
            .await
            .unwrap_err(),
        ProxyError::ReadOnly
    ));

    // No side effects happened.
    assert!(pool.metadata.get_mapping("id", "new").await.unwrap().is_none());
    assert!(pool.metadata.get_mapping("id", "copy").await.unwrap().is_none());
    assert!(pool.metadata.get_mapping("id", "existing").await.unwrap().is_some());

    // Reads still work.
    assert_eq!(pool.store.get("id", "existing").await.unwrap().as_ref(), b"x");
}

#[tokio::test]
async fn test_multipart_out_of_order_completion() {
    let pool = TestPool::new().await;
    let upload = pool
        .store
        .initiate_multipart("id", "big.bin", Some("application/octet-stream"))
        .await
        .unwrap();

    let p3 = pool
        .store
        .upload_part("id", &upload, 3, bytes::Bytes::from_static(b"!!"))
        .await
        .unwrap();
    let p1 = pool
        .store
        .upload_part("id", &upload, 1, bytes::Bytes::from_static(b"hello "))
        .await
        .unwrap();
    let p2 = pool
        .store
        .upload_part("id", &upload, 2, bytes::Bytes::from_static(b"world"))
        .await
        .unwrap();

    let listed = pool.store.list_parts("id", &upload).await.unwrap();
    assert_eq!(listed.len(), 3);

    let hash = pool
        .store
        .complete_multipart("id", &upload, &[p3, p1, p2])
        .await
        .unwrap()
        .unwrap();

    let reassembled = b"hello world!!";
    assert_eq!(hash, ContentHash::compute(reassembled));
    assert_eq!(
        pool.metadata.get_mapping("id", "big.bin").await.unwrap(),
        Some(hash)
    );
    assert_eq!(
        pool.metadata.get_file_size(&hash).await.unwrap(),
        Some(reassembled.len() as u64)
    );
    assert_eq!(pool.store.get("id", "big.bin").await.unwrap().as_ref(), reassembled);

    // The temp object and its session are both gone.
    assert_eq!(pool.temp_object_count(), 0);
    assert!(pool
        .metadata
        .get_multipart_temp("id", "big.bin")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_multipart_completion_deduplicates() {
    let pool = TestPool::new().await;
    let payload = b"already pooled".to_vec();
    let existing = pool
        .store
        .put("id", "single.bin", byte_stream(payload.clone()), None)
        .await
        .unwrap()
        .unwrap();

    let upload = pool
        .store
        .initiate_multipart("id", "multi.bin", None)
        .await
        .unwrap();
    let p1 = pool
        .store
        .upload_part("id", &upload, 1, bytes::Bytes::from(payload))
        .await
        .unwrap();
    let hash = pool
        .store
        .complete_multipart("id", &upload, &[p1])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(hash, existing);
    assert_eq!(pool.blob_count(), 1);
    assert_eq!(pool.metadata.reference_count(&hash).await.unwrap(), 2);
}

#[tokio::test]
async fn test_multipart_abort_clears_session() {
    let pool = TestPool::new().await;
    let upload = pool
        .store
        .initiate_multipart("id", "doomed.bin", None)
        .await
        .unwrap();
    pool.store
        .upload_part("id", &upload, 1, bytes::Bytes::from_static(b"data"))
        .await
        .unwrap();

    pool.store.abort_multipart("id", &upload).await.unwrap();

    assert!(pool
        .metadata
        .get_multipart_temp("id", "doomed.bin")
        .await
        .unwrap()
        .is_none());
    assert!(pool
        .metadata
        .get_mapping("id", "doomed.bin")
        .await
        .unwrap()
        .is_none());
    assert_eq!(pool.blob_count(), 0);
}

#[tokio::test]
async fn test_reader_blocks_until_write_commits() {
    let pool = TestPool::new().await;
    let payload = b"slowly but surely written payload".to_vec();

    let writer = {
        let store = std::sync::Arc::clone(&pool.store);
        let stream = slow_stream(payload.clone(), Duration::from_millis(400));
        tokio::spawn(async move { store.put("id", "contested", stream, None).await })
    };

    // Let the write register itself.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pool.coalescer.is_writing("id", "contested"));

    // A reader arriving mid-write waits and then sees the committed
    // mapping, never a not-found race.
    let waited = pool.coalescer.await_if_writing("id", "contested").await;
    assert!(waited);
    let mapping = pool.metadata.get_mapping("id", "contested").await.unwrap();
    assert!(mapping.is_some());

    let hash = writer.await.unwrap().unwrap().unwrap();
    assert_eq!(mapping, Some(hash));
}

#[tokio::test]
async fn test_long_names_roundtrip() {
    let pool = TestPool::new().await;
    let long_name = format!("cache/{}", "ab/".repeat(120));
    assert!(long_name.len() > silo_core::MAX_NAME_BYTES);

    let hash = pool
        .store
        .put("id", &long_name, byte_stream(b"long-named".to_vec()), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        pool.store.get("id", &long_name).await.unwrap().as_ref(),
        b"long-named"
    );
    assert_eq!(pool.metadata.reference_count(&hash).await.unwrap(), 1);
    pool.store.remove("id", &long_name).await.unwrap();
    assert_eq!(pool.blob_count(), 0);
}
