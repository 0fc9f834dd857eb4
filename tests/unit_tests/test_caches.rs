// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use fileproto_rs::{
    errors::ProtocolError,
    files::caches::{CachedHandle, FileLocks, HandleCache, TtlMap},
    utils::adler32,
};

use crate::unit_tests::scratch_dir;

#[tokio::test(start_paused = true)]
async fn test_ttl_map_expires_entries() {
    let map: TtlMap<bool> = TtlMap::new(Duration::from_secs(5));
    map.insert("alice/notes.txt", true);
    assert!(map.contains("alice/notes.txt"));

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(!map.contains("alice/notes.txt"));
    assert!(map.get_cloned("alice/notes.txt").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_ttl_map_update_refreshes_ttl() {
    let map: TtlMap<u32> = TtlMap::new(Duration::from_secs(5));
    map.insert("key", 1);

    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(map.update("key", |v| *v += 1), Some(()));

    // The update pushed expiry out another full TTL.
    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(map.get_cloned("key"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_ttl_map_sweep() {
    let map: TtlMap<u32> = TtlMap::new(Duration::from_secs(5));
    map.insert("a", 1);
    map.insert("b", 2);
    tokio::time::advance(Duration::from_secs(6)).await;
    map.insert("c", 3);

    map.sweep();
    assert_eq!(map.len(), 1);
    assert_eq!(map.get_cloned("c"), Some(3));
}

#[tokio::test]
async fn test_lock_same_identity_is_reentrant() -> Result<()> {
    let locks = FileLocks::new(Duration::from_secs(30));
    let first = locks
        .acquire(
            "alice/notes.txt",
            "alice",
            "alice",
            "notes.txt",
            Duration::from_millis(200),
        )
        .await?;
    let second = locks
        .acquire(
            "alice/notes.txt",
            "alice",
            "alice",
            "notes.txt",
            Duration::from_millis(200),
        )
        .await?;
    assert_eq!(first, second);
    assert_eq!(first, adler32(b"alice"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lock_contention_times_out() -> Result<()> {
    let locks = FileLocks::new(Duration::from_secs(30));
    locks
        .acquire(
            "bob/notes.txt",
            "alice",
            "bob",
            "notes.txt",
            Duration::from_millis(500),
        )
        .await?;

    let err = locks
        .acquire(
            "bob/notes.txt",
            "mallory",
            "bob",
            "notes.txt",
            Duration::from_millis(500),
        )
        .await
        .expect_err("a second holder must be refused");
    assert!(matches!(err, ProtocolError::FileContested { .. }));
    Ok(())
}

#[tokio::test]
async fn test_lock_release_frees_path() -> Result<()> {
    let locks = FileLocks::new(Duration::from_secs(30));
    let checksum = locks
        .acquire(
            "bob/a.txt",
            "alice",
            "bob",
            "a.txt",
            Duration::from_millis(200),
        )
        .await?;
    locks.release("bob/a.txt", checksum);

    // A different identity can now take it immediately.
    locks
        .acquire(
            "bob/a.txt",
            "mallory",
            "bob",
            "a.txt",
            Duration::from_millis(200),
        )
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_deleted_barrier_blocks_acquisition() {
    let locks = FileLocks::new(Duration::from_secs(30));
    locks.set_deleted_barrier("bob/gone.txt");

    let err = locks
        .acquire(
            "bob/gone.txt",
            "alice",
            "bob",
            "gone.txt",
            Duration::from_millis(200),
        )
        .await
        .expect_err("NULL holder is a deletion barrier");
    assert!(matches!(err, ProtocolError::FileJustDeleted));
    assert_eq!(locks.holder("bob/gone.txt"), None);
}

async fn make_handle(dir: &std::path::Path, name: &str) -> CachedHandle {
    let path = dir.join(name);
    tokio::fs::write(&path, b"contents").await.expect("write");
    CachedHandle {
        file: tokio::fs::File::open(&path).await.expect("open"),
        cursor: 0,
    }
}

#[tokio::test]
async fn test_handle_cache_take_put() {
    let dir = scratch_dir("handles");
    let cache = HandleCache::new(Duration::from_secs(30));

    let handle = make_handle(&dir, "notes.txt").await;
    cache.put("alice/notes.txt", "bobby", handle);
    assert!(cache.contains("alice/notes.txt", "bobby"));

    // Taking removes the handle; a second take sees nothing.
    assert!(cache.take("alice/notes.txt", "bobby").is_some());
    assert!(cache.take("alice/notes.txt", "bobby").is_none());

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_handle_cache_purge_path_closes_all_identities() {
    let dir = scratch_dir("purge");
    let cache = HandleCache::new(Duration::from_secs(30));

    cache.put("alice/a.txt", "bobby", make_handle(&dir, "a.txt").await);
    cache.put("alice/a.txt", "carol", make_handle(&dir, "a2.txt").await);
    assert_eq!(cache.purge_path("alice/a.txt"), 2);
    assert!(!cache.contains("alice/a.txt", "bobby"));
    assert!(!cache.contains("alice/a.txt", "carol"));

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_handle_cache_rename_rekeys() {
    let dir = scratch_dir("rename");
    let cache = HandleCache::new(Duration::from_secs(30));

    cache.put("alice/a.txt", "bobby", make_handle(&dir, "a.txt").await);
    cache.rename_path("alice/a.txt", "carol/a.txt");
    assert!(!cache.contains("alice/a.txt", "bobby"));
    assert!(cache.contains("carol/a.txt", "bobby"));

    std::fs::remove_dir_all(&dir).ok();
}
