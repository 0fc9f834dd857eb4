// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection pipeline: read header → (components, authenticate,
//! dispatch) → write response → repeat until `finish`, an unrecoverable
//! error, or shutdown. Requests on one connection are strictly serialized.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::{
    db::models::{ActivityLog, LogAuthor, LogCategory, Severity},
    errors::ProtocolError,
    proto::{response::ResponseHeader, wire},
    server::{context::AppContext, dispatch::dispatch_request},
};

pub async fn handle_connection<S>(ctx: &AppContext, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let limits = ctx.limits();
    let read_timeout = ctx.config.network.read_timeout;

    loop {
        let header = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            header = wire::read_request_header(&mut reader, limits, read_timeout) => header,
        };

        let header = match header {
            Ok(header) => header,
            Err(err) => {
                // The peer may simply have hung up between requests; a best
                // effort error response is all that is owed.
                let mut response = ResponseHeader::from_error(
                    &err,
                    ctx.config.version.clone(),
                    ctx.config.network.host,
                    ctx.config.network.port,
                    true,
                );
                let _ =
                    wire::write_response(&mut writer, &mut response, None, limits)
                        .await;
                break;
            },
        };

        // Drain the declared components before anything can fail, so an
        // error response leaves the stream aligned for the next request.
        let components =
            wire::read_raw_components(&mut reader, &header, read_timeout).await;
        let outcome = match components {
            Ok((auth_bytes, body_bytes)) => {
                dispatch_request(
                    ctx,
                    &header,
                    auth_bytes.as_deref(),
                    body_bytes.as_deref(),
                )
                .await
            },
            Err(err) => Err(err),
        };
        let ended = match outcome {
            Ok((mut response, body)) => {
                let ended = response.ended_connection;
                if wire::write_response(&mut writer, &mut response, body.as_ref(), limits)
                    .await
                    .is_err()
                {
                    break;
                }
                ended
            },
            Err(err) => {
                if let ProtocolError::Internal(source) = &err {
                    warn!(peer = %peer, "unhandled failure in request: {source}");
                    ctx.logger
                        .enqueue(
                            ActivityLog::new(
                                Severity::Critical,
                                LogAuthor::SocketHandler,
                                LogCategory::Internal,
                                source.to_string(),
                            )
                            .with_host(peer.ip()),
                        )
                        .await;
                }
                let ended = header.finish || err.requires_closure();
                let mut response = ResponseHeader::from_error(
                    &err,
                    header.version.clone(),
                    ctx.config.network.host,
                    ctx.config.network.port,
                    ended,
                );
                if wire::write_response(&mut writer, &mut response, None, limits)
                    .await
                    .is_err()
                {
                    break;
                }
                ended
            },
        };

        if ended {
            debug!(peer = %peer, "connection finished");
            break;
        }
    }
}
