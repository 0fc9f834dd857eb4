// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Framing codec shared by server and client.
//!
//! A message is up to three JSON blobs in sequence: a fixed-width header,
//! then `auth_size` bytes of auth component, then `body_size` bytes of body.
//! The receiver always reads the fixed header width first; the header then
//! tells it exactly how much more to read. Short or stalled reads surface as
//! `SlowStreamRate` and close the connection.

use std::time::Duration;

use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::{
    errors::{ProtocolError, ProtocolResult},
    proto::{
        ProtocolLimits,
        auth::AuthComponent,
        header::RequestHeader,
        response::{ResponseBody, ResponseHeader},
    },
};

/// Reads exactly `n` bytes within `io_timeout`, mapping timeouts, EOF and
/// partial streams to [`ProtocolError::SlowStreamRate`].
pub async fn read_exact_timed<R>(
    reader: &mut R,
    n: usize,
    io_timeout: Duration,
) -> ProtocolResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; n];
    match timeout(io_timeout, reader.read_exact(&mut buf)).await {
        Ok(Ok(_)) => Ok(buf),
        Ok(Err(_)) | Err(_) => Err(ProtocolError::SlowStreamRate),
    }
}

/// Reads and validates the fixed-width request header.
pub async fn read_request_header<R>(
    reader: &mut R,
    limits: &ProtocolLimits,
    io_timeout: Duration,
) -> ProtocolResult<RequestHeader>
where
    R: AsyncRead + Unpin,
{
    let raw = read_exact_timed(reader, limits.header_width, io_timeout).await?;
    let header = RequestHeader::from_padded_bytes(&raw)?;
    header.validate(limits)?;
    Ok(header)
}

/// Reads the raw trailing components announced by the header. Both are
/// always drained so a later validation failure never leaves the stream
/// misaligned for the next request.
pub async fn read_raw_components<R>(
    reader: &mut R,
    header: &RequestHeader,
    io_timeout: Duration,
) -> ProtocolResult<(Option<Vec<u8>>, Option<Vec<u8>>)>
where
    R: AsyncRead + Unpin,
{
    let auth = if header.auth_size > 0 {
        Some(read_exact_timed(reader, header.auth_size, io_timeout).await?)
    } else {
        None
    };
    let body = if header.body_size > 0 {
        Some(read_exact_timed(reader, header.body_size, io_timeout).await?)
    } else {
        None
    };
    Ok((auth, body))
}

/// Serializes and writes one full request (header + optional auth + optional
/// body). Component sizes are recomputed into the header before emission so
/// callers never have to keep them in sync by hand.
pub async fn write_request<W, B>(
    writer: &mut W,
    header: &mut RequestHeader,
    auth: Option<&AuthComponent>,
    body: Option<&B>,
    limits: &ProtocolLimits,
) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
    B: Serialize,
{
    let auth_bytes = auth
        .map(serde_json::to_vec)
        .transpose()
        .map_err(|e| ProtocolError::InvalidAuthSemantic(e.to_string()))?;
    let body_bytes = body
        .map(serde_json::to_vec)
        .transpose()
        .map_err(|e| ProtocolError::InvalidBodyValues(e.to_string()))?;

    header.auth_size = auth_bytes.as_ref().map_or(0, Vec::len);
    header.body_size = body_bytes.as_ref().map_or(0, Vec::len);

    let header_bytes = header.to_padded_bytes(limits.header_width)?;
    writer
        .write_all(&header_bytes)
        .await
        .map_err(|_| ProtocolError::SlowStreamRate)?;
    if let Some(bytes) = auth_bytes {
        writer
            .write_all(&bytes)
            .await
            .map_err(|_| ProtocolError::SlowStreamRate)?;
    }
    if let Some(bytes) = body_bytes {
        writer
            .write_all(&bytes)
            .await
            .map_err(|_| ProtocolError::SlowStreamRate)?;
    }
    writer
        .flush()
        .await
        .map_err(|_| ProtocolError::SlowStreamRate)?;
    Ok(())
}

/// Serializes and writes one full response, filling in `body_size`.
pub async fn write_response<W>(
    writer: &mut W,
    header: &mut ResponseHeader,
    body: Option<&ResponseBody>,
    limits: &ProtocolLimits,
) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let body_bytes = body.map(ResponseBody::to_bytes).transpose()?;
    header.body_size = body_bytes.as_ref().map_or(0, Vec::len);

    let header_bytes = header.to_padded_bytes(limits.header_width)?;
    writer
        .write_all(&header_bytes)
        .await
        .map_err(|_| ProtocolError::SlowStreamRate)?;
    if let Some(bytes) = body_bytes {
        writer
            .write_all(&bytes)
            .await
            .map_err(|_| ProtocolError::SlowStreamRate)?;
    }
    writer
        .flush()
        .await
        .map_err(|_| ProtocolError::SlowStreamRate)?;
    Ok(())
}

/// Client side: reads the fixed-width response header, then the body when the
/// header announces one.
pub async fn read_response<R>(
    reader: &mut R,
    limits: &ProtocolLimits,
    io_timeout: Duration,
) -> ProtocolResult<(ResponseHeader, Option<ResponseBody>)>
where
    R: AsyncRead + Unpin,
{
    let raw = read_exact_timed(reader, limits.header_width, io_timeout).await?;
    let header = ResponseHeader::from_padded_bytes(&raw)?;

    let body = if header.body_size > 0 {
        let raw = read_exact_timed(reader, header.body_size, io_timeout).await?;
        Some(ResponseBody::from_bytes(&raw)?)
    } else {
        None
    };
    Ok((header, body))
}
