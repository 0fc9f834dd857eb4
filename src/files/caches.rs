// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory TTL state around the filesystem: per-path locks, cached
//! buffered handles keyed by `(path, identity)`, and deletion tombstones.
//!
//! Keys are relative paths of the form `owner/filename`. All maps expire
//! entries lazily on access plus via periodic sweeps.

use std::{collections::HashMap, time::Duration};

use dashmap::DashMap;
use tokio::{fs::File, time::Instant};

use crate::{
    cfg::config::FileConfig,
    errors::{ProtocolError, ProtocolResult},
    utils::adler32,
};

/// Minimal TTL map over [`DashMap`], expiring lazily.
pub struct TtlMap<V> {
    inner: DashMap<String, (V, Instant)>,
    ttl: Duration,
}

impl<V> TtlMap<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.inner
            .insert(key.into(), (value, Instant::now() + self.ttl));
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner.remove(key).map(|(_, (value, _))| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        let live = match self.inner.get(key) {
            Some(entry) => entry.1 > Instant::now(),
            None => return false,
        };
        if !live {
            self.inner.remove(key);
        }
        live
    }

    pub fn get_cloned(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let value = match self.inner.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Some(entry.0.clone()),
            Some(_) => None,
            None => return None,
        };
        self.inner.remove(key);
        value
    }

    /// Mutates the live entry in place, refreshing its TTL.
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut entry = self.inner.get_mut(key)?;
        if entry.1 <= Instant::now() {
            drop(entry);
            self.inner.remove(key);
            return None;
        }
        let result = f(&mut entry.0);
        entry.1 = Instant::now() + self.ttl;
        Some(result)
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.inner.retain(|_, (_, expires_at)| *expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// A buffered file handle plus the offset the server believes it is at.
#[derive(Debug)]
pub struct CachedHandle {
    pub file: File,
    pub cursor: u64,
}

/// Cache of open handles: path → (identity → handle). One cache instance per
/// operation class (readers vs. amendments).
pub struct HandleCache {
    inner: DashMap<String, (HashMap<String, CachedHandle>, Instant)>,
    ttl: Duration,
}

impl HandleCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            ttl,
        }
    }

    /// Removes and returns the cached handle for `(path, identity)`. The
    /// caller owns it for the duration of the request and `put`s it back to
    /// keep it cached.
    pub fn take(&self, path: &str, identity: &str) -> Option<CachedHandle> {
        let mut entry = self.inner.get_mut(path)?;
        if entry.1 <= Instant::now() {
            drop(entry);
            self.inner.remove(path);
            return None;
        }
        entry.0.remove(identity)
    }

    pub fn put(&self, path: &str, identity: &str, handle: CachedHandle) {
        let mut entry = self
            .inner
            .entry(path.to_string())
            .or_insert_with(|| (HashMap::new(), Instant::now() + self.ttl));
        entry.0.insert(identity.to_string(), handle);
        entry.1 = Instant::now() + self.ttl;
    }

    pub fn contains(&self, path: &str, identity: &str) -> bool {
        self.inner
            .get(path)
            .map(|entry| entry.1 > Instant::now() && entry.0.contains_key(identity))
            .unwrap_or(false)
    }

    /// Drops every handle cached under the path. Returns how many were open;
    /// the handles close on drop.
    pub fn purge_path(&self, path: &str) -> usize {
        self.inner
            .remove(path)
            .map(|(_, (handles, _))| handles.len())
            .unwrap_or(0)
    }

    /// Drops one identity's handle under the path.
    pub fn purge_identity(&self, path: &str, identity: &str) {
        if let Some(mut entry) = self.inner.get_mut(path) {
            entry.0.remove(identity);
        }
    }

    /// Re-keys cached handles after a rename/transfer.
    pub fn rename_path(&self, old_path: &str, new_path: &str) {
        if let Some((_, entry)) = self.inner.remove(old_path) {
            self.inner.insert(new_path.to_string(), entry);
        }
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.inner.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

/// Outcome of a single lock-acquisition attempt.
enum LockAttempt {
    Acquired,
    AlreadyHeld,
    Contested,
    Deleted,
}

/// Per-path single-writer locks. The holder slot stores an adler32 checksum
/// of the holder identity; a `None` slot is the deletion barrier.
pub struct FileLocks {
    inner: DashMap<String, (Option<u32>, Instant)>,
    ttl: Duration,
}

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

impl FileLocks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            ttl,
        }
    }

    fn try_acquire(&self, path: &str, checksum: u32) -> LockAttempt {
        let now = Instant::now();
        let mut entry = self
            .inner
            .entry(path.to_string())
            .or_insert_with(|| (Some(checksum), now + self.ttl));

        match entry.0 {
            None => LockAttempt::Deleted,
            Some(holder) if holder == checksum => {
                if entry.1 <= now {
                    // Expired but re-requested by the same holder: renew.
                    entry.1 = now + self.ttl;
                    return LockAttempt::Acquired;
                }
                // Either the entry we just inserted or a re-entrant request.
                entry.1 = now + self.ttl;
                LockAttempt::AlreadyHeld
            },
            Some(_) if entry.1 <= now => {
                // Abandoned lock; steal it.
                *entry = (Some(checksum), now + self.ttl);
                LockAttempt::Acquired
            },
            Some(_) => LockAttempt::Contested,
        }
    }

    /// Acquires the lock for `identity`, retrying until `contention_timeout`
    /// elapses. Returns the holder checksum for the eventual release.
    pub async fn acquire(
        &self,
        path: &str,
        identity: &str,
        owner: &str,
        file: &str,
        contention_timeout: Duration,
    ) -> ProtocolResult<u32> {
        let checksum = adler32(identity.as_bytes());
        let deadline = Instant::now() + contention_timeout;

        loop {
            match self.try_acquire(path, checksum) {
                LockAttempt::Acquired | LockAttempt::AlreadyHeld => return Ok(checksum),
                LockAttempt::Deleted => return Err(ProtocolError::FileJustDeleted),
                LockAttempt::Contested => {
                    if Instant::now() >= deadline {
                        return Err(ProtocolError::FileContested {
                            owner: owner.to_string(),
                            file: file.to_string(),
                        });
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                },
            }
        }
    }

    /// Releases only if `checksum` still holds the lock.
    pub fn release(&self, path: &str, checksum: u32) {
        let held_by_us = self
            .inner
            .get(path)
            .map(|entry| entry.0 == Some(checksum))
            .unwrap_or(false);
        if held_by_us {
            self.inner.remove(path);
        }
    }

    /// Deletion barrier: a NULL holder makes every concurrent amendment
    /// attempt fail until the entry expires.
    pub fn set_deleted_barrier(&self, path: &str) {
        self.inner
            .insert(path.to_string(), (None, Instant::now() + self.ttl));
    }

    pub fn holder(&self, path: &str) -> Option<u32> {
        self.inner.get(path).and_then(|entry| entry.0)
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.inner.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

/// The process-wide file-state singletons, grouped for injection.
pub struct FileCaches {
    pub readers: HandleCache,
    pub amendments: HandleCache,
    pub deleted: TtlMap<bool>,
    pub locks: FileLocks,
}

impl FileCaches {
    pub fn new(cfg: &FileConfig) -> Self {
        Self {
            readers: HandleCache::new(cfg.cache_ttl),
            amendments: HandleCache::new(cfg.cache_ttl),
            deleted: TtlMap::new(cfg.tombstone_ttl),
            locks: FileLocks::new(cfg.lock_ttl),
        }
    }

    /// Closes every cached handle for the path across both caches and plants
    /// a tombstone. Invoked on deletion.
    pub fn purge_file(&self, path: &str) {
        self.deleted.insert(path, true);
        self.readers.purge_path(path);
        self.amendments.purge_path(path);
    }

    /// Closes the handles one identity holds on the given paths. Invoked on
    /// user deletion, ban and session replay purge.
    pub fn purge_identity(&self, identity: &str, paths: &[String]) {
        for path in paths {
            self.readers.purge_identity(path, identity);
            self.amendments.purge_identity(path, identity);
        }
    }

    /// Re-keys cached state after an ownership transfer.
    pub fn rename_file(&self, old_path: &str, new_path: &str) {
        self.readers.rename_path(old_path, new_path);
        self.amendments.rename_path(old_path, new_path);
    }

    pub fn sweep(&self) {
        self.readers.sweep();
        self.amendments.sweep();
        self.deleted.sweep();
        self.locks.sweep();
    }
}
