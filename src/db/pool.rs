// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Three-lane pool of pre-established Postgres connections.
//!
//! Lanes are plain FIFO queues ordered by importance: HIGH for account and
//! session-state mutations, MID for per-file metadata, LOW for background
//! flushers and logging. A borrowed connection travels inside a
//! [`ConnectionProxy`] whose every database-facing call is gated on a
//! per-lease usage token and lease expiry; an expired lease is forcibly
//! reclaimed by a timer task, after which the proxy only returns
//! `ServerTimeout`. Holders are expected to reclaim cooperatively in a
//! scoped acquisition; the `Drop` impl is a safety net, not the contract.

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    time::{sleep, timeout},
};
use tokio_postgres::{Client, NoTls, Row, types::ToSql};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    cfg::config::DatabaseConfig,
    errors::{ProtocolError, ProtocolResult},
};

/// Importance lane a connection request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPriority {
    High = 0,
    Mid = 1,
    Low = 2,
}

struct ConnInner {
    client: Client,
    priority: ConnectionPriority,
    /// Token of the current lease; `None` while pooled.
    usage_token: Mutex<Option<String>>,
    /// Bumped on every lease/reclaim so a stale timer never revokes a
    /// re-leased connection.
    generation: AtomicU64,
    lease_expired: AtomicBool,
}

struct Lane {
    tx: mpsc::UnboundedSender<Arc<ConnInner>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Arc<ConnInner>>>,
}

impl Lane {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: AsyncMutex::new(rx),
        }
    }
}

pub struct ConnectionPoolManager {
    lanes: [Lane; 3],
    default_lease: Duration,
    connection_timeout: Duration,
}

impl ConnectionPoolManager {
    /// A pool with empty lanes: every request waits until the connection
    /// timeout. `connect` populates one of these with live connections.
    pub fn empty(default_lease: Duration, connection_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            lanes: [Lane::new(), Lane::new(), Lane::new()],
            default_lease,
            connection_timeout,
        })
    }

    /// Builds the pool from environment credentials (`PG_USERNAME`,
    /// `PG_PASSWORD`, `PG_HOST`, `PG_PORT`, `PG_DBNAME`) and populates every
    /// lane with live connections.
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Arc<Self>> {
        let pg_config = pg_config_from_env()?;

        let pool = Self::empty(cfg.lease_duration, cfg.connection_timeout);

        let lane_sizes = [
            (ConnectionPriority::High, cfg.high_priority_conns),
            (ConnectionPriority::Mid, cfg.mid_priority_conns),
            (ConnectionPriority::Low, cfg.low_priority_conns),
        ];
        for (priority, size) in lane_sizes {
            for _ in 0..size {
                let conn = establish(&pg_config, priority).await?;
                pool.requeue(conn);
            }
        }
        Ok(pool)
    }

    /// Borrows a connection from the given lane, waiting until one frees up
    /// or the pool-wide connection timeout elapses.
    ///
    /// `max_lease` shortens the lease; asking for more than the configured
    /// default is clamped to the default.
    pub async fn request_connection(
        self: &Arc<Self>,
        level: ConnectionPriority,
        max_lease: Option<Duration>,
    ) -> ProtocolResult<ConnectionProxy> {
        let lease = match max_lease {
            Some(requested) if requested > self.default_lease => {
                warn!(
                    requested_secs = requested.as_secs_f64(),
                    "requested lease exceeds the pool default; clamping"
                );
                self.default_lease
            },
            Some(requested) => requested,
            None => self.default_lease,
        };

        let conn = {
            let mut rx = self.lanes[level as usize].rx.lock().await;
            match timeout(self.connection_timeout, rx.recv()).await {
                Ok(Some(conn)) => conn,
                Ok(None) => return Err(ProtocolError::ServerShutdown),
                Err(_) => return Err(ProtocolError::ServerTimeout),
            }
        };

        let token = Uuid::new_v4().simple().to_string();
        if let Ok(mut slot) = conn.usage_token.lock() {
            *slot = Some(token.clone());
        }
        conn.lease_expired.store(false, Ordering::SeqCst);
        let generation = conn.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Lease timer: on expiry the connection is forcibly pulled back into
        // its lane and the proxy becomes inert.
        let timer_conn = Arc::clone(&conn);
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            sleep(lease).await;
            if timer_conn.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            timer_conn.lease_expired.store(true, Ordering::SeqCst);
            if let Ok(mut slot) = timer_conn.usage_token.lock() {
                *slot = None;
            }
            debug!("lease expired, reclaiming connection");
            if let Some(pool) = pool.upgrade() {
                pool.requeue(timer_conn);
            }
        });

        Ok(ConnectionProxy {
            conn,
            usage_token: token,
            pool: Arc::downgrade(self),
            reclaimed: false,
        })
    }

    /// Returns a cooperatively-released connection to its original lane.
    pub fn reclaim_connection(&self, mut proxy: ConnectionProxy) {
        proxy.release_internal();
    }

    fn requeue(&self, conn: Arc<ConnInner>) {
        let lane = &self.lanes[conn.priority as usize];
        // Send only fails when the pool is shutting down; the connection is
        // then simply dropped and closed.
        let _ = lane.tx.send(conn);
    }

    /// Drains every lane, dropping (and thereby closing) the clients.
    pub async fn close(&self) {
        for lane in &self.lanes {
            let mut rx = lane.rx.lock().await;
            while rx.try_recv().is_ok() {}
        }
    }
}

/// Leased handle to a pooled connection. Every database-facing method checks
/// the usage token and lease expiry before touching the backend.
pub struct ConnectionProxy {
    conn: Arc<ConnInner>,
    usage_token: String,
    pool: Weak<ConnectionPoolManager>,
    reclaimed: bool,
}

impl ConnectionProxy {
    fn ensure_valid(&self) -> ProtocolResult<&Client> {
        if self.conn.lease_expired.load(Ordering::SeqCst) {
            return Err(ProtocolError::ServerTimeout);
        }
        let token_matches = self
            .conn
            .usage_token
            .lock()
            .map(|slot| slot.as_deref() == Some(self.usage_token.as_str()))
            .unwrap_or(false);
        if !token_matches {
            return Err(ProtocolError::ServerTimeout);
        }
        Ok(&self.conn.client)
    }

    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> ProtocolResult<Vec<Row>> {
        let client = self.ensure_valid()?;
        client.query(sql, params).await.map_err(ProtocolError::from_db)
    }

    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> ProtocolResult<Option<Row>> {
        let client = self.ensure_valid()?;
        client
            .query_opt(sql, params)
            .await
            .map_err(ProtocolError::from_db)
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> ProtocolResult<u64> {
        let client = self.ensure_valid()?;
        client
            .execute(sql, params)
            .await
            .map_err(ProtocolError::from_db)
    }

    pub async fn batch_execute(&self, sql: &str) -> ProtocolResult<()> {
        let client = self.ensure_valid()?;
        client
            .batch_execute(sql)
            .await
            .map_err(ProtocolError::from_db)
    }

    /// The pool itself is transaction-agnostic; callers bracket their own
    /// work with these.
    pub async fn begin(&self) -> ProtocolResult<()> {
        self.batch_execute("BEGIN").await
    }

    pub async fn commit(&self) -> ProtocolResult<()> {
        self.batch_execute("COMMIT").await
    }

    pub async fn rollback(&self) -> ProtocolResult<()> {
        self.batch_execute("ROLLBACK").await
    }

    /// Hands the connection back to its lane if this lease is still live.
    pub fn release(mut self) {
        self.release_internal();
    }

    fn release_internal(&mut self) {
        if self.reclaimed {
            return;
        }
        self.reclaimed = true;

        let still_leased = self
            .conn
            .usage_token
            .lock()
            .map(|mut slot| {
                if slot.as_deref() == Some(self.usage_token.as_str()) {
                    *slot = None;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !still_leased {
            // The lease timer already reclaimed this connection.
            return;
        }

        self.conn.generation.fetch_add(1, Ordering::SeqCst);
        self.conn.lease_expired.store(false, Ordering::SeqCst);
        if let Some(pool) = self.pool.upgrade() {
            pool.requeue(Arc::clone(&self.conn));
        }
    }
}

impl Drop for ConnectionProxy {
    fn drop(&mut self) {
        self.release_internal();
    }
}

async fn establish(
    pg_config: &tokio_postgres::Config,
    priority: ConnectionPriority,
) -> Result<Arc<ConnInner>> {
    let (client, connection) = pg_config
        .connect(NoTls)
        .await
        .context("failed to establish backend connection")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("backend connection task exited: {e}");
        }
    });
    Ok(Arc::new(ConnInner {
        client,
        priority,
        usage_token: Mutex::new(None),
        generation: AtomicU64::new(0),
        lease_expired: AtomicBool::new(false),
    }))
}

fn pg_config_from_env() -> Result<tokio_postgres::Config> {
    let mut config = tokio_postgres::Config::new();
    config
        .user(&std::env::var("PG_USERNAME").context("PG_USERNAME not set")?)
        .password(std::env::var("PG_PASSWORD").context("PG_PASSWORD not set")?)
        .host(&std::env::var("PG_HOST").context("PG_HOST not set")?)
        .port(
            std::env::var("PG_PORT")
                .context("PG_PORT not set")?
                .parse::<u16>()
                .context("PG_PORT must be a port number")?,
        )
        .dbname(&std::env::var("PG_DBNAME").context("PG_DBNAME not set")?);
    Ok(config)
}
