// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Write-behind cache of per-user storage bookkeeping.
//!
//! Mutations touch only the in-memory entry; a background task periodically
//! evicts the least-recently-used entries and flushes them to `users` and
//! `files` in a single LOW-priority transaction. Shutdown flushes the whole
//! cache synchronously.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::FileConfig,
    db::pool::{ConnectionPoolManager, ConnectionPriority, ConnectionProxy},
    errors::{ProtocolError, ProtocolResult},
};

const STORAGE_FETCH_SQL: &str =
    "SELECT file_count, storage_used FROM users WHERE username = $1;";
const FILE_SIZE_FETCH_SQL: &str =
    "SELECT file_size FROM files WHERE owner = $1 AND filename = $2;";
const STORAGE_FLUSH_SQL: &str =
    "UPDATE users SET file_count = $1, storage_used = $2 WHERE username = $3;";
const FILE_FLUSH_SQL: &str =
    "UPDATE files SET file_size = $1 WHERE owner = $2 AND filename = $3;";

/// In-memory storage numbers for one user.
#[derive(Debug, Clone, Default)]
pub struct StorageData {
    pub filecount: i64,
    pub storage_used: i64,
    /// filename → size, only for files touched since the last flush.
    pub file_data: HashMap<String, i64>,
}

struct CacheInner {
    entries: HashMap<String, (StorageData, Instant)>,
}

pub struct StorageCache {
    pool: Arc<ConnectionPoolManager>,
    inner: Mutex<CacheInner>,
    flush_batch_size: usize,
    disk_flush_interval: Duration,
}

impl StorageCache {
    pub fn new(pool: Arc<ConnectionPoolManager>, cfg: &FileConfig) -> Arc<Self> {
        Arc::new(Self {
            pool,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
            }),
            flush_batch_size: cfg.flush_batch_size,
            disk_flush_interval: cfg.disk_flush_interval,
        })
    }

    /// Returns the cached numbers, fetching from `users` on a miss.
    pub async fn get_storage_data(&self, username: &str) -> ProtocolResult<StorageData> {
        {
            let mut inner = self.inner.lock().await;
            if let Some((data, last_access)) = inner.entries.get_mut(username) {
                *last_access = Instant::now();
                return Ok(data.clone());
            }
        }

        let proxy = self
            .pool
            .request_connection(ConnectionPriority::Low, None)
            .await?;
        let row = proxy.query_opt(STORAGE_FETCH_SQL, &[&username]).await;
        self.pool.reclaim_connection(proxy);

        let Some(row) = row? else {
            return Err(ProtocolError::UserAuthentication(format!(
                "user {username} not found"
            )));
        };
        let data = StorageData {
            filecount: row.get(0),
            storage_used: row.get(1),
            file_data: HashMap::new(),
        };

        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .entry(username.to_string())
            .or_insert_with(|| (data.clone(), Instant::now()));
        entry.1 = Instant::now();
        Ok(entry.0.clone())
    }

    /// Applies a byte delta to the user's total without touching storage.
    pub async fn update_file_size(
        &self,
        username: &str,
        file: &str,
        delta: i64,
    ) -> ProtocolResult<i64> {
        self.get_storage_data(username).await?;
        let mut inner = self.inner.lock().await;
        let (data, last_access) = inner
            .entries
            .get_mut(username)
            .ok_or_else(|| ProtocolError::Internal(anyhow::anyhow!("entry evicted")))?;
        *last_access = Instant::now();
        data.storage_used += delta;
        *data.file_data.entry(file.to_string()).or_insert(0) += delta;
        Ok(data.storage_used)
    }

    /// Applies a file-count delta (create/delete), registering the file in
    /// the per-file size map.
    pub async fn update_file_count(
        &self,
        username: &str,
        file: &str,
        delta: i64,
    ) -> ProtocolResult<i64> {
        self.get_storage_data(username).await?;
        let mut inner = self.inner.lock().await;
        let (data, last_access) = inner
            .entries
            .get_mut(username)
            .ok_or_else(|| ProtocolError::Internal(anyhow::anyhow!("entry evicted")))?;
        *last_access = Instant::now();
        data.filecount += delta;
        if delta > 0 {
            data.file_data.entry(file.to_string()).or_insert(0);
        } else {
            data.file_data.remove(file);
        }
        Ok(data.filecount)
    }

    /// Size of one file, from the cache or the `files` table.
    pub async fn get_file_size(&self, username: &str, file: &str) -> ProtocolResult<i64> {
        {
            let mut inner = self.inner.lock().await;
            if let Some((data, last_access)) = inner.entries.get_mut(username) {
                *last_access = Instant::now();
                if let Some(size) = data.file_data.get(file) {
                    return Ok(*size);
                }
            }
        }

        let proxy = self
            .pool
            .request_connection(ConnectionPriority::Low, None)
            .await?;
        let row = proxy
            .query_opt(FILE_SIZE_FETCH_SQL, &[&username, &file])
            .await;
        self.pool.reclaim_connection(proxy);

        let Some(row) = row? else {
            return Err(ProtocolError::FileNotFound {
                owner: username.to_string(),
                file: file.to_string(),
            });
        };
        let size: i64 = row.get(0);

        let mut inner = self.inner.lock().await;
        if let Some((data, _)) = inner.entries.get_mut(username) {
            data.file_data.entry(file.to_string()).or_insert(size);
        }
        Ok(size)
    }

    /// Subtracts a deleted file: returns its size for reporting.
    pub async fn remove_file(&self, username: &str, file: &str) -> ProtocolResult<i64> {
        let size = self.get_file_size(username, file).await?;
        let mut inner = self.inner.lock().await;
        let (data, last_access) = inner
            .entries
            .get_mut(username)
            .ok_or_else(|| ProtocolError::Internal(anyhow::anyhow!("entry evicted")))?;
        *last_access = Instant::now();
        data.file_data.remove(file);
        data.storage_used -= size;
        data.filecount -= 1;
        Ok(size)
    }

    /// Subtracts an already-measured deleted file without consulting the
    /// `files` table (the row may be gone by now).
    pub async fn reflect_removed_file(
        &self,
        username: &str,
        file: &str,
        size: i64,
    ) -> ProtocolResult<i64> {
        self.get_storage_data(username).await?;
        let mut inner = self.inner.lock().await;
        let (data, last_access) = inner
            .entries
            .get_mut(username)
            .ok_or_else(|| ProtocolError::Internal(anyhow::anyhow!("entry evicted")))?;
        *last_access = Instant::now();
        data.file_data.remove(file);
        data.storage_used -= size;
        data.filecount -= 1;
        Ok(data.storage_used)
    }

    /// Drops a user's entry without flushing (account deletion).
    pub async fn forget_user(&self, username: &str) {
        self.inner.lock().await.entries.remove(username);
    }

    async fn flush_buffer(
        &self,
        buffer: &HashMap<String, StorageData>,
    ) -> ProtocolResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let proxy = self
            .pool
            .request_connection(ConnectionPriority::Low, None)
            .await?;
        let result = Self::flush_buffer_with(&proxy, buffer).await;
        if result.is_err() {
            let _ = proxy.rollback().await;
        }
        self.pool.reclaim_connection(proxy);
        result
    }

    async fn flush_buffer_with(
        proxy: &ConnectionProxy,
        buffer: &HashMap<String, StorageData>,
    ) -> ProtocolResult<()> {
        proxy.begin().await?;
        for (username, data) in buffer {
            proxy
                .execute(
                    STORAGE_FLUSH_SQL,
                    &[&data.filecount, &data.storage_used, username],
                )
                .await?;
            for (file, size) in &data.file_data {
                proxy.execute(FILE_FLUSH_SQL, &[size, username, file]).await?;
            }
        }
        proxy.commit().await
    }

    /// Evicts up to `flush_batch_size` least-recently-used entries and
    /// flushes them in one transaction.
    async fn flush_lru_batch(&self) {
        let buffer: HashMap<String, StorageData> = {
            let mut inner = self.inner.lock().await;
            let mut keys: Vec<(String, Instant)> = inner
                .entries
                .iter()
                .map(|(k, (_, at))| (k.clone(), *at))
                .collect();
            keys.sort_by_key(|(_, at)| *at);
            keys.truncate(self.flush_batch_size);

            keys.into_iter()
                .filter_map(|(k, _)| {
                    inner.entries.remove(&k).map(|(data, _)| (k, data))
                })
                .collect()
        };
        if let Err(e) = self.flush_buffer(&buffer).await {
            warn!("storage flush failed, retaining entries in memory: {e}");
            let mut inner = self.inner.lock().await;
            for (k, data) in buffer {
                inner.entries.entry(k).or_insert((data, Instant::now()));
            }
        }
    }

    /// Flushes everything still cached. Called on shutdown.
    pub async fn flush_all(&self) {
        let buffer: HashMap<String, StorageData> = {
            let mut inner = self.inner.lock().await;
            inner
                .entries
                .drain()
                .map(|(k, (data, _))| (k, data))
                .collect()
        };
        if let Err(e) = self.flush_buffer(&buffer).await {
            warn!("final storage flush failed: {e}");
        }
    }

    /// Background write-behind loop.
    pub fn spawn_flush_task(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(cache.disk_flush_interval) => {},
                }
                cache.flush_lru_batch().await;
            }
            debug!("storage cache: final flush");
            cache.flush_all().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::ConnectionPoolManager;

    fn test_cache() -> Arc<StorageCache> {
        let pool = ConnectionPoolManager::empty(
            Duration::from_secs(5),
            Duration::from_millis(100),
        );
        let cfg = FileConfig {
            root_directory: "/tmp/fileproto-test".into(),
            cache_ttl: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(60),
            tombstone_ttl: Duration::from_secs(30),
            contention_timeout: Duration::from_secs(1),
            transfer_timeout: Duration::from_secs(5),
            user_max_files: 16,
            disk_flush_interval: Duration::from_secs(5),
            flush_batch_size: 8,
        };
        StorageCache::new(pool, &cfg)
    }

    async fn seed(cache: &StorageCache, user: &str, filecount: i64, used: i64) {
        cache.inner.lock().await.entries.insert(
            user.to_string(),
            (
                StorageData {
                    filecount,
                    storage_used: used,
                    file_data: HashMap::new(),
                },
                Instant::now(),
            ),
        );
    }

    #[tokio::test]
    async fn test_update_file_size_tracks_delta() {
        let cache = test_cache();
        seed(&cache, "alice", 2, 100).await;

        let used = cache
            .update_file_size("alice", "notes.txt", 50)
            .await
            .expect("entry is cached");
        assert_eq!(used, 150);
        let used = cache
            .update_file_size("alice", "notes.txt", -30)
            .await
            .expect("entry is cached");
        assert_eq!(used, 120);

        let data = cache.get_storage_data("alice").await.expect("cached");
        assert_eq!(data.file_data.get("notes.txt"), Some(&20));
    }

    #[tokio::test]
    async fn test_file_count_create_and_delete() {
        let cache = test_cache();
        seed(&cache, "alice", 0, 0).await;

        let count = cache
            .update_file_count("alice", "a.txt", 1)
            .await
            .expect("cached");
        assert_eq!(count, 1);
        let count = cache
            .update_file_count("alice", "a.txt", -1)
            .await
            .expect("cached");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_reflect_removed_file() {
        let cache = test_cache();
        seed(&cache, "alice", 3, 300).await;

        let used = cache
            .reflect_removed_file("alice", "big.bin", 200)
            .await
            .expect("cached");
        assert_eq!(used, 100);
        let data = cache.get_storage_data("alice").await.expect("cached");
        assert_eq!(data.filecount, 2);
    }

    #[tokio::test]
    async fn test_forget_user_drops_entry() {
        let cache = test_cache();
        seed(&cache, "alice", 1, 10).await;
        cache.forget_user("alice").await;
        assert!(cache.inner.lock().await.entries.is_empty());
    }
}
