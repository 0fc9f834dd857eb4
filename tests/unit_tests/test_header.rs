// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::{IpAddr, Ipv4Addr};

use anyhow::Result;
use fileproto_rs::{
    errors::ProtocolError,
    proto::{
        HEADER_PAD_BYTE,
        flags::{AuthFlags, FileFlags, RequestCategory},
        header::RequestHeader,
    },
    utils::unix_timestamp,
};

use crate::unit_tests::limits;

fn sample_header() -> RequestHeader {
    RequestHeader {
        version: "0.1.0".to_string(),
        auth_size: 120,
        body_size: 0,
        sender_hostname: IpAddr::V4(Ipv4Addr::LOCALHOST),
        sender_port: 40000,
        sender_timestamp: unix_timestamp(),
        finish: false,
        category: RequestCategory::AUTH,
        subcategory: AuthFlags::LOGIN.bits(),
    }
}

#[test]
fn test_header_pad_and_parse_round_trip() -> Result<()> {
    let limits = limits();
    let header = sample_header();

    let encoded = header.to_padded_bytes(limits.header_width)?;
    assert_eq!(encoded.len(), limits.header_width);
    // Right-padded with ASCII spaces.
    assert_eq!(*encoded.last().expect("non-empty"), HEADER_PAD_BYTE);

    let parsed = RequestHeader::from_padded_bytes(&encoded)?;
    assert_eq!(parsed, header);
    Ok(())
}

#[test]
fn test_header_wider_than_fixed_width_is_rejected() {
    let header = sample_header();
    let err = header.to_padded_bytes(16).expect_err("16 bytes cannot fit");
    assert!(matches!(err, ProtocolError::InvalidHeaderValues(_)));
}

#[test]
fn test_header_garbage_is_a_semantic_error() {
    let raw = vec![b'{'; 256];
    let err = RequestHeader::from_padded_bytes(&raw).expect_err("not JSON");
    assert!(matches!(err, ProtocolError::InvalidHeaderSemantic(_)));
}

#[test]
fn test_header_validation_rejects_bad_version() {
    let limits = limits();
    let mut header = sample_header();
    header.version = "banana".to_string();
    assert!(matches!(
        header.validate(&limits),
        Err(ProtocolError::InvalidHeaderValues(_))
    ));
}

#[test]
fn test_header_validation_rejects_multiple_categories() {
    let limits = limits();
    let mut header = sample_header();
    header.category = RequestCategory::AUTH | RequestCategory::FILE_OP;
    assert!(matches!(
        header.validate(&limits),
        Err(ProtocolError::InvalidHeaderValues(_))
    ));
}

#[test]
fn test_header_validation_rejects_oversized_components() {
    let limits = limits();
    let mut header = sample_header();
    header.auth_size = limits.auth_max_size + 1;
    assert!(matches!(
        header.validate(&limits),
        Err(ProtocolError::InvalidHeaderValues(_))
    ));

    let mut header = sample_header();
    header.body_size = limits.body_max_size + 1;
    assert!(matches!(
        header.validate(&limits),
        Err(ProtocolError::InvalidHeaderValues(_))
    ));
}

#[test]
fn test_header_subcategory_accessors() {
    let mut header = sample_header();
    header.category = RequestCategory::FILE_OP;
    header.subcategory = FileFlags::APPEND.bits();
    assert_eq!(header.file_flags(), Some(FileFlags::APPEND));

    header.subcategory = 0b1100_0000;
    assert_eq!(header.file_flags(), None);
}

#[test]
fn test_header_category_serializes_as_decimal() -> Result<()> {
    let header = sample_header();
    let json: serde_json::Value = serde_json::to_value(&header)?;
    assert_eq!(json["category"], serde_json::json!(2));
    assert_eq!(json["subcategory"], serde_json::json!(2));
    Ok(())
}
