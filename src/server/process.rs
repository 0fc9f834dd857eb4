// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The outer server process: TLS accept loop, certificate-mtime hot reload,
//! optional scheduled rotation, shutdown sequencing.

use std::{sync::Arc, time::SystemTime};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, task::JoinHandle, time::sleep};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::{
    server::{conn::handle_connection, context::AppContext},
    tlscreds::credentials::{
        build_server_config, load_credentials, rotate_server_credentials,
    },
};

fn certificate_mtime(ctx: &AppContext) -> Option<SystemTime> {
    std::fs::metadata(ctx.config.tls.certificate_path())
        .and_then(|m| m.modified())
        .ok()
}

async fn accept_loop(ctx: Arc<AppContext>, listener: TcpListener, acceptor: TlsAcceptor) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            },
        };

        let ctx = Arc::clone(&ctx);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let handshake = tokio::time::timeout(
                ctx.config.network.connection_timeout,
                acceptor.accept(stream),
            )
            .await;
            match handshake {
                Ok(Ok(tls_stream)) => {
                    handle_connection(&ctx, tls_stream, peer).await;
                },
                Ok(Err(e)) => warn!(peer = %peer, "TLS handshake failed: {e}"),
                Err(_) => warn!(peer = %peer, "TLS handshake timed out"),
            }
        });
    }
}

/// Runs the listener until shutdown, restarting it with a fresh TLS context
/// whenever the certificate file's mtime changes.
pub async fn run_server(ctx: Arc<AppContext>) -> Result<()> {
    let mut reference_mtime = certificate_mtime(&ctx);

    while !ctx.shutdown.is_cancelled() {
        let creds = load_credentials(
            &ctx.config.tls.certificate_path(),
            &ctx.config.tls.key_path(),
        )?;
        let tls_config = build_server_config(&creds, &ctx.config.tls.ciphers)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener =
            TcpListener::bind((ctx.config.network.host, ctx.config.network.port))
                .await
                .with_context(|| {
                    format!(
                        "failed to bind {}:{}",
                        ctx.config.network.host, ctx.config.network.port
                    )
                })?;
        info!(
            host = %ctx.config.network.host,
            port = ctx.config.network.port,
            fingerprint = creds.fingerprint(),
            "listener up"
        );

        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&ctx),
            listener,
            acceptor,
        ));

        // Poll the certificate mtime; a change restarts the listener with a
        // rebuilt context.
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => {
                    accept_task.abort();
                    return Ok(());
                },
                _ = sleep(ctx.config.tls.rollover_check_poll_interval) => {},
            }
            if accept_task.is_finished() {
                break;
            }
            let current = certificate_mtime(&ctx);
            if current != reference_mtime {
                info!("certificate changed on disk, reloading TLS context");
                reference_mtime = current;
                accept_task.abort();
                break;
            }
        }
    }
    Ok(())
}

/// Scheduled rotation, active only when `tls.rotation_interval` is set.
pub fn spawn_rotation_task(ctx: &Arc<AppContext>) -> Option<JoinHandle<()>> {
    let interval = ctx.config.tls.rotation_interval?;
    let ctx = Arc::clone(ctx);
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => return,
                _ = sleep(interval) => {},
            }
            let tls_cfg = ctx.config.tls.clone();
            let host = ctx.config.network.host.to_string();
            let port = ctx.config.network.port;
            let rotated = tokio::task::spawn_blocking(move || {
                rotate_server_credentials(&tls_cfg, &host, port, "periodic rotation")
            })
            .await;
            match rotated {
                Ok(Ok(())) => info!("server credentials rotated"),
                Ok(Err(e)) => warn!("credential rotation failed: {e}"),
                Err(e) => warn!("credential rotation task panicked: {e}"),
            }
        }
    }))
}
