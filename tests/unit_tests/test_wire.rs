// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use anyhow::Result;
use fileproto_rs::{
    errors::ProtocolError,
    proto::{
        auth::AuthComponent,
        body::{FileBody, RequestBody},
        codes::ResponseCode,
        flags::{FileFlags, RequestCategory},
        header::RequestHeader,
        response::{ResponseBody, ResponseHeader},
        wire,
    },
    utils::unix_timestamp,
};
use tokio::io::AsyncWriteExt;

use crate::unit_tests::limits;

const IO_TIMEOUT: Duration = Duration::from_millis(500);

fn request_header(category: RequestCategory, subcategory: u8) -> RequestHeader {
    RequestHeader {
        version: "0.1.0".to_string(),
        auth_size: 0,
        body_size: 0,
        sender_hostname: IpAddr::V4(Ipv4Addr::LOCALHOST),
        sender_port: 40000,
        sender_timestamp: unix_timestamp(),
        finish: false,
        category,
        subcategory,
    }
}

#[tokio::test]
async fn test_request_round_trip_over_duplex() -> Result<()> {
    let limits = limits();
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);

    let mut header = request_header(RequestCategory::FILE_OP, FileFlags::WRITE.bits());
    let auth = AuthComponent::authentication(
        "alice",
        vec![1u8; limits.token_length],
        vec![2u8; limits.digest_length],
    );
    let body = FileBody {
        subject_file: "notes.txt".to_string(),
        subject_file_owner: "alice".to_string(),
        cursor_position: Some(64),
        write_data: Some(b"hello there".to_vec()),
        ..FileBody::default()
    };
    wire::write_request(&mut client, &mut header, Some(&auth), Some(&body), &limits)
        .await?;

    let received = wire::read_request_header(&mut server, &limits, IO_TIMEOUT).await?;
    assert_eq!(received, header);
    assert!(received.auth_size > 0);
    assert!(received.body_size > 0);

    let (auth_bytes, body_bytes) =
        wire::read_raw_components(&mut server, &received, IO_TIMEOUT).await?;
    let received_auth = AuthComponent::from_bytes(
        auth_bytes.as_deref().expect("auth declared"),
        &limits,
    )?;
    assert_eq!(received_auth.identity, "alice");
    assert_eq!(received_auth.token, auth.token);

    let received_body = RequestBody::parse(
        received.category,
        body_bytes.as_deref().expect("body declared"),
        &limits,
    )?;
    let RequestBody::File(file_body) = received_body else {
        panic!("expected a file body");
    };
    assert_eq!(file_body.cursor_position, Some(64));
    assert_eq!(file_body.write_data.as_deref(), Some(b"hello there".as_ref()));
    Ok(())
}

#[tokio::test]
async fn test_response_round_trip_over_duplex() -> Result<()> {
    let limits = limits();
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);

    let mut response = ResponseHeader::new(
        "0.1.0",
        ResponseCode::Read,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        8625,
    )
    .with_kwarg("chunk", "final");
    let body = ResponseBody::default()
        .insert("read", serde_json::json!(hex::encode(b"payload")));
    wire::write_response(&mut server, &mut response, Some(&body), &limits).await?;

    let (received, received_body) =
        wire::read_response(&mut client, &limits, IO_TIMEOUT).await?;
    assert_eq!(received.code, ResponseCode::Read);
    assert_eq!(received.body_size, response.body_size);
    assert_eq!(
        received.kwargs.as_ref().and_then(|k| k.get("chunk")),
        Some(&"final".to_string())
    );
    let received_body = received_body.expect("body advertised by header");
    assert_eq!(
        received_body.contents.get("read"),
        Some(&serde_json::json!(hex::encode(b"payload")))
    );
    Ok(())
}

#[tokio::test]
async fn test_header_one_byte_short_is_slow_stream() -> Result<()> {
    let limits = limits();
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);

    let header = request_header(RequestCategory::HEARTBEAT, 0);
    let mut encoded = header.to_padded_bytes(limits.header_width)?;
    encoded.pop();
    client.write_all(&encoded).await?;
    // Half-close so the reader sees EOF instead of waiting out the timeout.
    drop(client);

    let err = wire::read_request_header(&mut server, &limits, IO_TIMEOUT)
        .await
        .expect_err("incomplete header must fail");
    assert!(matches!(err, ProtocolError::SlowStreamRate));
    Ok(())
}

#[tokio::test]
async fn test_stalled_header_times_out() -> Result<()> {
    let limits = limits();
    let (_client, mut server) = tokio::io::duplex(64 * 1024);

    // Nothing is ever written; the read must give up after the timeout.
    let err = wire::read_request_header(&mut server, &limits, IO_TIMEOUT)
        .await
        .expect_err("stalled stream must fail");
    assert!(matches!(err, ProtocolError::SlowStreamRate));
    Ok(())
}

#[tokio::test]
async fn test_exact_width_header_accepted() -> Result<()> {
    let limits = limits();
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);

    let header = request_header(RequestCategory::HEARTBEAT, 0);
    let encoded = header.to_padded_bytes(limits.header_width)?;
    assert_eq!(encoded.len(), limits.header_width);
    client.write_all(&encoded).await?;

    let received = wire::read_request_header(&mut server, &limits, IO_TIMEOUT).await?;
    assert_eq!(received, header);
    Ok(())
}
