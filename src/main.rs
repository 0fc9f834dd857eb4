// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use fileproto_rs::{
    cfg::{cli::effective_config_path, config::ServerConfig, logger::init_logger},
    db::{
        models::{ActivityLog, LogAuthor, LogCategory, Severity},
        pool::ConnectionPoolManager,
    },
    files::{caches::FileCaches, storage::StorageCache},
    logsink::LogFlusher,
    server::{
        context::AppContext,
        process::{run_server, spawn_rotation_task},
    },
    session::manager::SessionManager,
    tlscreds::credentials::ensure_credentials,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/server.toml";
const DEFAULT_CLEANUP_WAITING_PERIOD: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    let config = effective_config_path(std::env::args().nth(1), DEFAULT_CONFIG_PATH)
        .and_then(ServerConfig::load_from_file)
        .context("failed to resolve or load server config")?;
    let config = Arc::new(config);

    let _logger_guard = init_logger(&config.logging)?;

    tokio::fs::create_dir_all(&config.file.root_directory)
        .await
        .context("failed to create storage root")?;
    ensure_credentials(&config.tls).context("failed to prepare TLS credentials")?;

    let shutdown = CancellationToken::new();
    let pool = ConnectionPoolManager::connect(&config.database)
        .await
        .context("failed to populate connection pool")?;
    let (activity_logger, flusher) =
        LogFlusher::start(Arc::clone(&pool), &config.logging, shutdown.clone());
    let sessions = SessionManager::new(
        Arc::clone(&config),
        Arc::clone(&pool),
        activity_logger.clone(),
    );
    let caches = Arc::new(FileCaches::new(&config.file));
    let storage = StorageCache::new(Arc::clone(&pool), &config.file);

    let ctx = Arc::new(AppContext {
        config: Arc::clone(&config),
        pool: Arc::clone(&pool),
        sessions: Arc::clone(&sessions),
        caches,
        storage: Arc::clone(&storage),
        logger: activity_logger.clone(),
        shutdown: shutdown.clone(),
    });

    let expiry_task = sessions.spawn_expiry_sweep(shutdown.clone());
    let storage_task = storage.spawn_flush_task(shutdown.clone());
    let rotation_task = spawn_rotation_task(&ctx);

    activity_logger
        .enqueue(ActivityLog::new(
            Severity::Info,
            LogAuthor::Bootup,
            LogCategory::Internal,
            "server bootstrap complete",
        ))
        .await;
    info!(
        host = %config.network.host,
        port = config.network.port,
        "starting server"
    );

    let server_task = tokio::spawn(run_server(Arc::clone(&ctx)));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    shutdown.cancel();

    let cleanup_waiting = std::env::var("CLEANUP_WAITING_PERIOD")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_CLEANUP_WAITING_PERIOD);
    let cleanup = async {
        flusher.join().await;
        let _ = storage_task.await;
        let _ = expiry_task.await;
        if let Some(task) = rotation_task {
            let _ = task.await;
        }
        let _ = server_task.await;
        pool.close().await;
    };
    if timeout(Duration::from_secs(cleanup_waiting), cleanup)
        .await
        .is_err()
    {
        warn!("cleanup did not finish within {cleanup_waiting}s");
    }

    info!("server stopped");
    Ok(())
}
