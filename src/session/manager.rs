// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session and account management: registration, login, token/digest
//! lifecycle, bans and the background expiry sweep.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::ServerConfig,
    db::{
        models::{ActivityLog, LogAuthor, LogCategory, Severity},
        pool::{ConnectionPoolManager, ConnectionPriority, ConnectionProxy},
    },
    errors::{ProtocolError, ProtocolResult},
    files::caches::{FileCaches, TtlMap},
    logsink::ActivityLogger,
    session::{
        metadata::SessionMetadata,
        password::{
            constant_time_eq, generate_salt, hash_password_offloaded,
            verify_password_offloaded,
        },
    },
    utils::{random_bytes, unix_timestamp},
};

/// How many retired digests are kept per user for replay detection.
const DIGEST_HISTORY_BOUND: usize = 2;

/// Result of a refresh attempt that did not fail outright.
pub enum RefreshOutcome {
    Refreshed { digest: Vec<u8>, iteration: u32 },
    /// A retired digest was replayed; the session has been purged and the
    /// caller must close the user's cached file handles.
    Replay,
}

pub struct SessionManager {
    config: Arc<ServerConfig>,
    pool: Arc<ConnectionPoolManager>,
    logger: ActivityLogger,

    sessions: DashMap<String, SessionMetadata>,
    /// identity → up to two retired digests, expiring with the session TTL.
    previous_digests: TtlMap<Vec<Vec<u8>>>,

    lifespan: Duration,
    refresh_nbf: Duration,
}

impl SessionManager {
    pub fn new(
        config: Arc<ServerConfig>,
        pool: Arc<ConnectionPoolManager>,
        logger: ActivityLogger,
    ) -> Arc<Self> {
        let lifespan = config.auth.session_lifespan;
        Arc::new(Self {
            refresh_nbf: config.session_refresh_nbf(),
            previous_digests: TtlMap::new(lifespan),
            sessions: DashMap::new(),
            lifespan,
            config,
            pool,
            logger,
        })
    }

    fn generate_token(&self) -> Vec<u8> {
        random_bytes(self.config.protocol.token_length)
    }

    fn generate_digest(&self) -> Vec<u8> {
        random_bytes(self.config.protocol.digest_length)
    }

    fn check_username(&self, username: &str) -> ProtocolResult<String> {
        let username = username.trim();
        if !self.config.protocol.valid_username(username) {
            return Err(ProtocolError::UserAuthentication(
                "invalid username".to_string(),
            ));
        }
        Ok(username.to_string())
    }

    /// Registers a new account and creates the owner directory.
    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        make_dir: bool,
    ) -> ProtocolResult<()> {
        let username = self.check_username(username)?;

        let proxy = self
            .pool
            .request_connection(ConnectionPriority::High, None)
            .await?;
        let existing = proxy
            .query_opt(
                "SELECT username FROM users WHERE username = $1;",
                &[&username],
            )
            .await?;
        if existing.is_some() {
            self.pool.reclaim_connection(proxy);
            return Err(ProtocolError::UserAuthentication(format!(
                "user {username} already exists"
            )));
        }

        let (hash, salt) =
            hash_password_offloaded(password.to_string(), generate_salt()).await;
        let result = proxy
            .execute(
                "INSERT INTO users \
                 (username, password_hash, password_salt, file_count, storage_used) \
                 VALUES ($1, $2, $3, 0, 0);",
                &[&username, &hash, &salt],
            )
            .await;
        self.pool.reclaim_connection(proxy);
        result?;

        if make_dir {
            let dir = self.config.file.root_directory.join(&username);
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                ProtocolError::Internal(anyhow::anyhow!(
                    "failed to create user directory {dir:?}: {e}"
                ))
            })?;
        }
        Ok(())
    }

    /// LOGIN: verifies the password and mints a fresh session.
    pub async fn authorize_session(
        &self,
        username: &str,
        password: &str,
    ) -> ProtocolResult<SessionMetadata> {
        let username = self.check_username(username)?;

        let proxy = self
            .pool
            .request_connection(ConnectionPriority::High, None)
            .await?;
        if self.check_banned(&username, &proxy, false).await? {
            self.pool.reclaim_connection(proxy);
            return Err(ProtocolError::Banned(username));
        }
        let row = proxy
            .query_opt(
                "SELECT password_hash, password_salt FROM users WHERE username = $1;",
                &[&username],
            )
            .await?;
        self.pool.reclaim_connection(proxy);

        let Some(row) = row else {
            return Err(ProtocolError::UserAuthentication(format!(
                "no user named {username} exists"
            )));
        };
        let stored_hash: Vec<u8> = row.get(0);
        let stored_salt: Vec<u8> = row.get(1);

        if !verify_password_offloaded(password.to_string(), stored_hash, stored_salt)
            .await
        {
            self.logger
                .enqueue(
                    ActivityLog::new(
                        Severity::Error,
                        LogAuthor::SessionManager,
                        LogCategory::User,
                        "login rejected: incorrect password",
                    )
                    .with_user(&username),
                )
                .await;
            return Err(ProtocolError::UserAuthentication(format!(
                "invalid password for user {username}"
            )));
        }

        // A re-login replaces whatever session existed.
        let metadata = SessionMetadata::new(
            self.generate_token(),
            self.generate_digest(),
            self.lifespan,
        );
        self.sessions.insert(username, metadata.clone());
        Ok(metadata)
    }

    /// Validates a bearer token against the live session table.
    pub fn authenticate_session(
        &self,
        username: &str,
        token: &[u8],
    ) -> ProtocolResult<SessionMetadata> {
        let Some(metadata) = self.sessions.get(username).map(|m| m.value().clone())
        else {
            return Err(ProtocolError::UserAuthentication(format!(
                "no session for user {username} found"
            )));
        };
        if metadata.is_expired(unix_timestamp()) {
            self.sessions.remove(username);
            return Err(ProtocolError::ExpiredAuthToken);
        }
        if !constant_time_eq(metadata.token(), token) {
            return Err(ProtocolError::UserAuthentication(
                "invalid authentication token".to_string(),
            ));
        }
        Ok(metadata)
    }

    /// Rotates the refresh digest, guarding against replay of retired ones.
    /// The bearer token is deliberately not rotated here.
    pub fn refresh_session(
        &self,
        username: &str,
        token: &[u8],
        digest: &[u8],
    ) -> ProtocolResult<RefreshOutcome> {
        let metadata = self.authenticate_session(username, token)?;

        let now = unix_timestamp();
        if now < metadata.last_refresh() + self.refresh_nbf.as_secs_f64() {
            return Err(ProtocolError::UserAuthentication(
                "session not old enough to refresh yet".to_string(),
            ));
        }

        let retired = self.previous_digests.get_cloned(username).unwrap_or_default();
        if retired.iter().any(|old| constant_time_eq(old, digest)) {
            // Replay of a retired digest: the session is forfeit.
            self.sessions.remove(username);
            self.previous_digests.remove(username);
            warn!(user = username, "retired refresh digest replayed");
            return Ok(RefreshOutcome::Replay);
        }

        if !constant_time_eq(metadata.refresh_digest(), digest) {
            return Err(ProtocolError::UserAuthentication(
                "invalid refresh digest".to_string(),
            ));
        }

        let new_digest = self.generate_digest();
        let mut outcome = None;
        self.sessions.alter(username, |_, mut session| {
            let mut history = retired.clone();
            history.push(session.refresh_digest().to_vec());
            if history.len() > DIGEST_HISTORY_BOUND {
                history.remove(0);
            }
            self.previous_digests.insert(username, history);

            session.update_digest(new_digest.clone());
            outcome = Some(RefreshOutcome::Refreshed {
                digest: new_digest.clone(),
                iteration: session.iteration(),
            });
            session
        });

        outcome.ok_or_else(|| {
            ProtocolError::UserAuthentication(
                "session vanished during refresh".to_string(),
            )
        })
    }

    /// LOGOUT: drops the session and returns the terminated metadata so the
    /// caller can report forgone validity.
    pub fn terminate_session(
        &self,
        username: &str,
        token: &[u8],
    ) -> ProtocolResult<SessionMetadata> {
        let metadata = self.authenticate_session(username, token)?;
        self.sessions.remove(username);
        self.previous_digests.remove(username);
        Ok(metadata)
    }

    /// Re-hashes under a fresh salt; identical hashes are rejected. Forces
    /// re-login by dropping the session.
    pub async fn change_password(
        &self,
        username: &str,
        new_password: &str,
    ) -> ProtocolResult<()> {
        let proxy = self
            .pool
            .request_connection(ConnectionPriority::Mid, None)
            .await?;
        let result = self
            .change_password_locked(&proxy, username, new_password)
            .await;
        if result.is_err() {
            let _ = proxy.rollback().await;
        }
        self.pool.reclaim_connection(proxy);
        result?;

        self.sessions.remove(username);
        self.previous_digests.remove(username);
        Ok(())
    }

    async fn change_password_locked(
        &self,
        proxy: &ConnectionProxy,
        username: &str,
        new_password: &str,
    ) -> ProtocolResult<()> {
        proxy.begin().await?;
        let row = proxy
            .query_opt(
                "SELECT password_hash, password_salt FROM users \
                 WHERE username = $1 FOR UPDATE NOWAIT;",
                &[&username],
            )
            .await?;
        // The record exists whenever authentication already passed.
        let Some(row) = row else {
            return Err(ProtocolError::UserAuthentication(format!(
                "no user named {username} exists"
            )));
        };
        let stored_hash: Vec<u8> = row.get(0);
        let stored_salt: Vec<u8> = row.get(1);
        if verify_password_offloaded(new_password.to_string(), stored_hash, stored_salt)
            .await
        {
            return Err(ProtocolError::InvalidAuthData(
                "password cannot be the same as the previous password".to_string(),
            ));
        }

        let (hash, salt) =
            hash_password_offloaded(new_password.to_string(), generate_salt()).await;
        proxy
            .execute(
                "UPDATE users SET password_hash = $1, password_salt = $2 \
                 WHERE username = $3;",
                &[&hash, &salt, &username],
            )
            .await?;
        proxy.commit().await
    }

    /// Removes the account row, the session and (asynchronously) every
    /// buffered handle the user held anywhere.
    pub async fn delete_user(
        self: &Arc<Self>,
        username: &str,
        password: &str,
        caches: Arc<FileCaches>,
    ) -> ProtocolResult<()> {
        let username = self.check_username(username)?;

        let proxy = self
            .pool
            .request_connection(ConnectionPriority::High, None)
            .await?;
        let result = self.delete_user_locked(&proxy, &username, password).await;
        if result.is_err() {
            let _ = proxy.rollback().await;
        }
        self.pool.reclaim_connection(proxy);
        result?;

        self.sessions.remove(&username);
        self.previous_digests.remove(&username);
        self.spawn_cache_termination(username, caches);
        Ok(())
    }

    async fn delete_user_locked(
        &self,
        proxy: &ConnectionProxy,
        username: &str,
        password: &str,
    ) -> ProtocolResult<()> {
        proxy.begin().await?;
        let row = proxy
            .query_opt(
                "SELECT password_hash, password_salt FROM users \
                 WHERE username = $1 FOR UPDATE NOWAIT;",
                &[&username],
            )
            .await?;
        let Some(row) = row else {
            return Err(ProtocolError::UserAuthentication(format!(
                "no user named {username} exists"
            )));
        };
        let stored_hash: Vec<u8> = row.get(0);
        let stored_salt: Vec<u8> = row.get(1);
        if !verify_password_offloaded(password.to_string(), stored_hash, stored_salt)
            .await
        {
            return Err(ProtocolError::UserAuthentication(format!(
                "invalid password for user {username}"
            )));
        }

        proxy
            .execute("DELETE FROM users WHERE username = $1;", &[&username])
            .await?;
        proxy.commit().await
    }

    /// Closes cached buffered handles this identity may hold on any file it
    /// can access. Runs detached since it only pre-empts the cache TTL.
    pub fn spawn_cache_termination(
        self: &Arc<Self>,
        identity: String,
        caches: Arc<FileCaches>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.terminate_user_cache(&identity, &caches).await {
                debug!(user = identity, "cache termination failed: {e}");
            }
        });
    }

    async fn terminate_user_cache(
        &self,
        identity: &str,
        caches: &FileCaches,
    ) -> ProtocolResult<()> {
        let proxy = self
            .pool
            .request_connection(ConnectionPriority::Low, None)
            .await?;
        let rows = proxy
            .query(
                "SELECT file_owner, filename FROM file_permissions \
                 WHERE grantee = $1 \
                 UNION \
                 SELECT owner, filename FROM files WHERE public IS TRUE;",
                &[&identity],
            )
            .await;
        self.pool.reclaim_connection(proxy);

        let paths: Vec<String> = rows?
            .into_iter()
            .map(|row| {
                let owner: String = row.get(0);
                let filename: String = row.get(1);
                format!("{owner}/{filename}")
            })
            .collect();
        caches.purge_identity(identity, &paths);
        Ok(())
    }

    /// Whether the user currently has an unlifted ban. Fails closed: a
    /// row-lock or backend failure counts as banned.
    pub async fn check_banned(
        &self,
        username: &str,
        proxy: &ConnectionProxy,
        lock_row: bool,
    ) -> ProtocolResult<bool> {
        let mut sql = "SELECT username FROM ban_logs \
                       WHERE username = $1 \
                       AND (lifted_at IS NULL OR lifted_at > $2) \
                       ORDER BY banned_at DESC LIMIT 1"
            .to_string();
        if lock_row {
            sql.push_str(" FOR UPDATE NOWAIT");
        }
        sql.push(';');

        match proxy.query_opt(&sql, &[&username, &Utc::now()]).await {
            Ok(row) => Ok(row.is_some()),
            Err(ProtocolError::OperationContested) => Ok(true),
            Err(e) => {
                self.logger
                    .enqueue(
                        ActivityLog::new(
                            Severity::NonCritical,
                            LogAuthor::SessionManager,
                            LogCategory::Database,
                            format!("ban check failed: {e}"),
                        )
                        .with_user(username),
                    )
                    .await;
                Ok(true)
            },
        }
    }

    /// Records a ban and applies the same cleanup as account deletion.
    pub async fn ban(
        self: &Arc<Self>,
        username: &str,
        reason: &str,
        description: Option<&str>,
        caches: Arc<FileCaches>,
    ) -> ProtocolResult<()> {
        let username = self.check_username(username)?;

        let proxy = self
            .pool
            .request_connection(ConnectionPriority::High, None)
            .await?;
        if self.check_banned(&username, &proxy, false).await? {
            self.pool.reclaim_connection(proxy);
            return Err(ProtocolError::OperationalConflict(format!(
                "user {username} is already banned"
            )));
        }
        let result = proxy
            .execute(
                "INSERT INTO ban_logs (username, reason, description, banned_at) \
                 VALUES ($1, $2, $3, $4);",
                &[
                    &username,
                    &reason.trim(),
                    &description.map(str::trim),
                    &Utc::now(),
                ],
            )
            .await;
        self.pool.reclaim_connection(proxy);
        result?;

        self.sessions.remove(&username);
        self.previous_digests.remove(&username);
        self.spawn_cache_termination(username, caches);
        Ok(())
    }

    /// Lifts the active ban, if any.
    pub async fn unban(&self, username: &str) -> ProtocolResult<()> {
        let username = self.check_username(username)?;

        let proxy = self
            .pool
            .request_connection(ConnectionPriority::High, None)
            .await?;
        let result = proxy
            .execute(
                "UPDATE ban_logs SET lifted_at = $1 \
                 WHERE username = $2 AND lifted_at IS NULL;",
                &[&Utc::now(), &username],
            )
            .await;
        self.pool.reclaim_connection(proxy);

        if result? == 0 {
            return Err(ProtocolError::OperationalConflict(format!(
                "user {username} has no active ban"
            )));
        }
        Ok(())
    }

    /// Background sweep dropping expired sessions and digest histories.
    /// Sleeps a third of the lifespan between passes.
    pub fn spawn_expiry_sweep(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.lifespan / 3;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {},
                }
                let threshold = unix_timestamp();
                manager
                    .sessions
                    .retain(|_, metadata| !metadata.is_expired(threshold));
                manager.previous_digests.sweep();
            }
        })
    }

    /// Number of live sessions (INFO queries).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::ConnectionPoolManager;

    const TEST_CONFIG: &str = r#"
        version = "0.1.0"

        [network]
        host = "127.0.0.1"
        port = 8625
        read_timeout = 5.0
        connection_timeout = 1.0

        [database]
        high_priority_conns = 1
        mid_priority_conns = 1
        low_priority_conns = 1
        lease_duration = 5.0
        connection_timeout = 0.2
        refresh_interval = 600.0

        [file]
        root_directory = "/tmp/fileproto-test"
        cache_ttl = 60.0
        lock_ttl = 60.0
        tombstone_ttl = 30.0
        contention_timeout = 1.0
        transfer_timeout = 5.0
        user_max_files = 16
        disk_flush_interval = 5.0
        flush_batch_size = 8

        [auth]
        max_attempts = 5
        lock_timeouts = [30.0]
        session_lifespan = 3600.0

        [logging]
        level = "info"
        output = "stderr"
        batch_size = 8
        flush_interval = 1.0
        waiting_period = 0.5
        max_retries = 1
        queue_size = 16

        [tls]
        credentials_directory = "/tmp/fileproto-test-creds"
        dns_name = "localhost"
        rollover_grace_window = 3600.0
        rollover_nonce_length = 16
        rollover_history_length = 4
        rollover_check_poll_interval = 5.0
    "#;

    fn test_manager() -> Arc<SessionManager> {
        let config: ServerConfig =
            toml::from_str(TEST_CONFIG).expect("test config must parse");
        let config = Arc::new(config);
        let pool = ConnectionPoolManager::empty(
            config.database.lease_duration,
            config.database.connection_timeout,
        );
        let (logger, _flusher) = crate::logsink::LogFlusher::start(
            Arc::clone(&pool),
            &config.logging,
            CancellationToken::new(),
        );
        SessionManager::new(config, pool, logger)
    }

    fn seed_session(manager: &SessionManager, user: &str) -> SessionMetadata {
        let metadata = SessionMetadata::new(
            manager.generate_token(),
            manager.generate_digest(),
            manager.lifespan,
        );
        manager.sessions.insert(user.to_string(), metadata.clone());
        metadata
    }

    #[tokio::test]
    async fn test_authenticate_missing_session() {
        let manager = test_manager();
        let result = manager.authenticate_session("ghost-user", &[0u8; 32]);
        assert!(matches!(
            result,
            Err(ProtocolError::UserAuthentication(_))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_wrong_token() {
        let manager = test_manager();
        seed_session(&manager, "alice");
        let result = manager.authenticate_session("alice", &[0u8; 32]);
        assert!(matches!(
            result,
            Err(ProtocolError::UserAuthentication(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_drops_session() {
        let manager = test_manager();
        let metadata = seed_session(&manager, "alice");
        let terminated = manager
            .terminate_session("alice", metadata.token())
            .expect("termination should succeed");
        assert_eq!(terminated.token(), metadata.token());
        assert!(manager.sessions.get("alice").is_none());
    }

    #[tokio::test]
    async fn test_refresh_not_before_bound() {
        let manager = test_manager();
        let metadata = seed_session(&manager, "alice");
        // A refresh straight after login is premature: nbf is lifespan/2.
        let result = manager.refresh_session(
            "alice",
            metadata.token(),
            metadata.refresh_digest(),
        );
        assert!(matches!(
            result,
            Err(ProtocolError::UserAuthentication(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotates_digest_not_token() {
        let manager = test_manager();
        let metadata = seed_session(&manager, "alice");
        // Age the session past the not-before bound.
        manager.sessions.alter("alice", |_, mut m| {
            m.set_last_refresh_for_tests(
                unix_timestamp() - manager.refresh_nbf.as_secs_f64() - 1.0,
            );
            m
        });

        let outcome = manager
            .refresh_session("alice", metadata.token(), metadata.refresh_digest())
            .expect("refresh should succeed");
        let RefreshOutcome::Refreshed { digest, iteration } = outcome else {
            panic!("expected a refreshed session");
        };
        assert_ne!(digest, metadata.refresh_digest().to_vec());
        assert_eq!(iteration, 2);

        let live = manager.sessions.get("alice").expect("session stays live");
        assert_eq!(live.token(), metadata.token());
        assert_eq!(live.refresh_digest(), digest.as_slice());
    }

    #[tokio::test]
    async fn test_refresh_replay_purges_session() {
        let manager = test_manager();
        let metadata = seed_session(&manager, "alice");
        let retired = manager.generate_digest();
        manager
            .previous_digests
            .insert("alice", vec![retired.clone()]);
        manager.sessions.alter("alice", |_, mut m| {
            m.set_last_refresh_for_tests(
                unix_timestamp() - manager.refresh_nbf.as_secs_f64() - 1.0,
            );
            m
        });

        let outcome = manager
            .refresh_session("alice", metadata.token(), &retired)
            .expect("replay is reported, not an error");
        assert!(matches!(outcome, RefreshOutcome::Replay));
        assert!(manager.sessions.get("alice").is_none());
        assert!(manager.previous_digests.get_cloned("alice").is_none());
    }
}
