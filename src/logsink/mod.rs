// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Activity-log sink: a bounded queue drained by a batching flusher.
//!
//! Entries accumulate until `batch_size` is reached or `waiting_period`
//! elapses, then land in `activity_logs` over a LOW-priority connection.
//! Recoverable backend errors are retried with sleeps; anything else drops
//! the batch after emitting one meta-log over a HIGH-priority connection.
//! Shutdown drains whatever is queued synchronously with HIGH priority.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::LoggingConfig,
    db::{
        models::{ActivityLog, LogAuthor, LogCategory, Severity},
        pool::{ConnectionPoolManager, ConnectionPriority},
    },
    errors::ProtocolResult,
};

const LOG_INSERTION_SQL: &str = "INSERT INTO activity_logs \
    (occurrence_time, severity, logged_by, log_category, log_details, \
     user_concerned, host_concerned) \
    VALUES ($1, $2, $3, $4, $5, $6, $7);";

/// Cheap cloneable producer handle.
#[derive(Clone)]
pub struct ActivityLogger {
    tx: mpsc::Sender<ActivityLog>,
    waiting_period: Duration,
}

impl ActivityLogger {
    /// Enqueues an entry, waiting at most the configured period before
    /// dropping it. Logging never blocks a request for longer than that.
    pub async fn enqueue(&self, log: ActivityLog) {
        if timeout(self.waiting_period, self.tx.send(log)).await.is_err() {
            debug!("activity log dropped: queue full past waiting period");
        }
    }
}

/// The flusher half. Owns the queue consumer and the background task.
pub struct LogFlusher {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogFlusher {
    /// Spawns the flush loop and hands back the producer side.
    pub fn start(
        pool: Arc<ConnectionPoolManager>,
        cfg: &LoggingConfig,
        shutdown: CancellationToken,
    ) -> (ActivityLogger, LogFlusher) {
        let (tx, rx) = mpsc::channel(cfg.queue_size);
        let logger = ActivityLogger {
            tx,
            waiting_period: cfg.waiting_period,
        };

        let flush_cfg = FlushConfig {
            batch_size: cfg.batch_size,
            flush_interval: cfg.flush_interval,
            waiting_period: cfg.waiting_period,
            max_retries: cfg.max_retries,
        };
        let handle = tokio::spawn(flush_loop(pool, rx, flush_cfg, shutdown));

        (
            logger,
            LogFlusher {
                handle: Mutex::new(Some(handle)),
            },
        )
    }

    /// Waits for the flush loop (including its shutdown drain) to finish.
    pub async fn join(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[derive(Clone, Copy)]
struct FlushConfig {
    batch_size: usize,
    flush_interval: Duration,
    waiting_period: Duration,
    max_retries: u32,
}

async fn flush_loop(
    pool: Arc<ConnectionPoolManager>,
    mut rx: mpsc::Receiver<ActivityLog>,
    cfg: FlushConfig,
    shutdown: CancellationToken,
) {
    let mut batch: Vec<ActivityLog> = Vec::with_capacity(cfg.batch_size);

    loop {
        while batch.len() < cfg.batch_size && !shutdown.is_cancelled() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = timeout(cfg.waiting_period, rx.recv()) => {
                    match received {
                        Ok(Some(log)) => batch.push(log),
                        // Producers all dropped; drain and leave.
                        Ok(None) => break,
                        // Waiting period elapsed with a partial batch.
                        Err(_) => break,
                    }
                },
            }
        }

        if shutdown.is_cancelled() {
            break;
        }
        if !batch.is_empty() {
            flush_with_retries(&pool, &mut batch, ConnectionPriority::Low, cfg).await;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(cfg.flush_interval) => {},
        }
    }

    // Shutdown: drain whatever is still queued with HIGH priority.
    while let Ok(log) = rx.try_recv() {
        batch.push(log);
    }
    if !batch.is_empty() {
        debug!(entries = batch.len(), "draining activity logs on shutdown");
        flush_with_retries(&pool, &mut batch, ConnectionPriority::High, cfg).await;
    }
}

async fn flush_with_retries(
    pool: &Arc<ConnectionPoolManager>,
    batch: &mut Vec<ActivityLog>,
    priority: ConnectionPriority,
    cfg: FlushConfig,
) {
    for _ in 0..cfg.max_retries {
        match flush_batch(pool, batch, priority).await {
            Ok(()) => {
                batch.clear();
                return;
            },
            Err(err) if err.is_recoverable_db() => {
                sleep(cfg.waiting_period).await;
            },
            Err(err) => {
                warn!("dropping {} activity logs: {err}", batch.len());
                emit_meta_log(pool, &err.to_string()).await;
                batch.clear();
                return;
            },
        }
    }
    // Retries exhausted; drop intentionally.
    batch.clear();
}

async fn flush_batch(
    pool: &Arc<ConnectionPoolManager>,
    batch: &[ActivityLog],
    priority: ConnectionPriority,
) -> ProtocolResult<()> {
    let proxy = pool.request_connection(priority, None).await?;
    proxy.begin().await?;
    for log in batch {
        let host = log.host_concerned.map(|h| h.to_string());
        proxy
            .execute(
                LOG_INSERTION_SQL,
                &[
                    &log.occurrence_time,
                    &log.severity.as_i16(),
                    &log.logged_by.as_str(),
                    &log.log_category.as_str(),
                    &log.log_details,
                    &log.user_concerned,
                    &host,
                ],
            )
            .await?;
    }
    proxy.commit().await?;
    proxy.release();
    Ok(())
}

/// Single best-effort entry recording that a batch was lost.
async fn emit_meta_log(pool: &Arc<ConnectionPoolManager>, detail: &str) {
    let meta = ActivityLog::new(
        Severity::Critical,
        LogAuthor::ExceptionFallback,
        LogCategory::Database,
        format!("activity log batch dropped: {detail}"),
    );
    let Ok(proxy) = pool
        .request_connection(ConnectionPriority::High, None)
        .await
    else {
        return;
    };
    let host = meta.host_concerned.map(|h| h.to_string());
    let _ = proxy
        .execute(
            LOG_INSERTION_SQL,
            &[
                &meta.occurrence_time,
                &meta.severity.as_i16(),
                &meta.logged_by.as_str(),
                &meta.log_category.as_str(),
                &meta.log_details,
                &meta.user_concerned,
                &host,
            ],
        )
        .await;
    proxy.release();
}
