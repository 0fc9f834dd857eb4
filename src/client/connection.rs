// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One TLS connection to the server. The writer lock spans a whole outgoing
//! message (header + auth + body) and the reader lock a whole incoming one,
//! so concurrent callers never interleave partial frames.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::TcpStream,
    sync::Mutex,
    time::timeout,
};
use tokio_rustls::{TlsConnector, client::TlsStream};

use crate::{
    client::{ClientConfig, tls::build_client_config},
    proto::{
        auth::AuthComponent,
        flags::RequestCategory,
        header::RequestHeader,
        response::{ResponseBody, ResponseHeader},
        wire,
    },
    utils::unix_timestamp,
};

pub struct ClientConnection {
    reader: Mutex<ReadHalf<TlsStream<TcpStream>>>,
    writer: Mutex<WriteHalf<TlsStream<TcpStream>>>,
    pub cfg: ClientConfig,
    local_addr: SocketAddr,
}

impl ClientConnection {
    /// Establishes the TCP + TLS session.
    pub async fn connect(cfg: ClientConfig) -> Result<Arc<Self>> {
        let stream = timeout(
            cfg.connection_timeout,
            TcpStream::connect((cfg.host.as_str(), cfg.port)),
        )
        .await
        .context("TCP connect timed out")?
        .context("TCP connect failed")?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;

        let tls_config = build_client_config(&cfg.trust)?;
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = rustls::pki_types::ServerName::try_from(cfg.host.clone())
            .context("invalid server name")?;
        let tls_stream = timeout(
            cfg.connection_timeout,
            connector.connect(server_name, stream),
        )
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;

        let (reader, writer) = tokio::io::split(tls_stream);
        Ok(Arc::new(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            cfg,
            local_addr,
        }))
    }

    /// A request header stamped with this client's identity. Component sizes
    /// are filled in at send time.
    pub fn make_header(
        &self,
        category: RequestCategory,
        subcategory: u8,
        finish: bool,
    ) -> RequestHeader {
        RequestHeader {
            version: self.cfg.version.clone(),
            auth_size: 0,
            body_size: 0,
            sender_hostname: self.local_addr.ip(),
            sender_port: self.local_addr.port(),
            sender_timestamp: unix_timestamp(),
            finish,
            category,
            subcategory,
        }
    }

    /// Emits one full request under the writer lock.
    pub async fn send_request<B: Serialize>(
        &self,
        header: &mut RequestHeader,
        auth: Option<&AuthComponent>,
        body: Option<&B>,
    ) -> Result<()> {
        let mut writer = self.writer.lock().await;
        wire::write_request(&mut *writer, header, auth, body, &self.cfg.limits)
            .await
            .map_err(|e| anyhow::anyhow!("failed to send request: {e}"))
    }

    /// Reads one full response under the reader lock.
    pub async fn read_response(&self) -> Result<(ResponseHeader, Option<ResponseBody>)> {
        let mut reader = self.reader.lock().await;
        wire::read_response(&mut *reader, &self.cfg.limits, self.cfg.read_timeout)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read response: {e}"))
    }

    /// Send-then-receive; the usual request/response exchange.
    pub async fn request<B: Serialize>(
        &self,
        header: &mut RequestHeader,
        auth: Option<&AuthComponent>,
        body: Option<&B>,
    ) -> Result<(ResponseHeader, Option<ResponseBody>)> {
        self.send_request(header, auth, body).await?;
        self.read_response().await
    }
}

/// Fails with the server's code and description when a response is not in
/// the expected set.
pub fn expect_codes(
    header: &ResponseHeader,
    expected: &[crate::proto::codes::ResponseCode],
) -> Result<()> {
    if expected.contains(&header.code) {
        return Ok(());
    }
    bail!(
        "server answered {}: {}",
        header.code,
        header.description.as_deref().unwrap_or("no description")
    )
}
