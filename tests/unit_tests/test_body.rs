// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use fileproto_rs::{
    errors::ProtocolError,
    proto::{
        body::{FileBody, PermissionBody, RequestBody},
        flags::{CursorFlags, RequestCategory},
    },
};

use crate::unit_tests::limits;

fn file_body() -> FileBody {
    FileBody {
        subject_file: "notes.txt".to_string(),
        subject_file_owner: "alice".to_string(),
        ..FileBody::default()
    }
}

#[test]
fn test_write_data_travels_as_hex() -> Result<()> {
    let mut body = file_body();
    body.write_data = Some(vec![0xDE, 0xAD, 0xBE, 0xEF]);

    let json: serde_json::Value = serde_json::to_value(&body)?;
    assert_eq!(json["write_data"], serde_json::json!("deadbeef"));

    let parsed: FileBody = serde_json::from_value(json)?;
    assert_eq!(parsed.write_data, body.write_data);
    Ok(())
}

#[test]
fn test_chunk_size_bounds() {
    let limits = limits();
    let mut body = file_body();

    body.chunk_size = Some(limits.chunk_max_size);
    assert!(body.validate(&limits).is_ok());

    body.chunk_size = Some(limits.chunk_max_size + 1);
    assert!(matches!(
        body.validate(&limits),
        Err(ProtocolError::InvalidBodyValues(_))
    ));

    body.chunk_size = Some(0);
    assert!(body.validate(&limits).is_err());
}

#[test]
fn test_filename_rules() {
    let limits = limits();
    let mut body = file_body();

    for bad in ["", ".", "..", "a/b", "nul\0byte"] {
        body.subject_file = bad.to_string();
        assert!(body.validate(&limits).is_err(), "{bad:?} should fail");
    }
}

#[test]
fn test_cursor_bitfield_is_authoritative() {
    let mut body = file_body();
    // Boolean says keepalive, bitfield says purge only: bitfield wins.
    body.cursor_keepalive = true;
    body.cursor_bitfield = CursorFlags::PURGE_CURSOR;
    assert!(!body.wants_keepalive());
    assert!(body.wants_purge());
    assert!(body.evict_after());

    // Empty bitfield falls back to the boolean.
    body.cursor_bitfield = CursorFlags::empty();
    assert!(body.wants_keepalive());
    assert!(!body.evict_after());
}

#[test]
fn test_post_operation_keepalive() {
    let mut body = file_body();
    body.end_operation = true;
    assert!(body.evict_after(), "closing request evicts by default");

    body.cursor_bitfield = CursorFlags::POST_OPERATION_CURSOR_KEEPALIVE;
    assert!(!body.evict_after(), "post-op keepalive retains the handle");

    // PURGE always wins.
    body.cursor_bitfield |= CursorFlags::PURGE_CURSOR;
    assert!(body.evict_after());
}

#[test]
fn test_permission_effect_duration_bounds() {
    let limits = limits();
    let mut body = PermissionBody {
        subject_file: "notes.txt".to_string(),
        subject_file_owner: "alice".to_string(),
        subject_user: Some("bobby".to_string()),
        effect_duration: Some(limits.effect_duration_max),
    };
    assert!(body.validate(&limits).is_ok());

    body.effect_duration = Some(limits.effect_duration_max + 1);
    assert!(matches!(
        body.validate(&limits),
        Err(ProtocolError::InvalidBodyValues(_))
    ));
}

#[test]
fn test_body_parse_follows_category() -> Result<()> {
    let limits = limits();
    let raw = serde_json::to_vec(&file_body())?;

    let parsed = RequestBody::parse(RequestCategory::FILE_OP, &raw, &limits)?;
    assert!(matches!(parsed, RequestBody::File(_)));

    // The same bytes do not satisfy the permission schema's required fields
    // differently, but a category without a body model must fail.
    let err = RequestBody::parse(RequestCategory::HEARTBEAT, &raw, &limits)
        .expect_err("heartbeat has no body");
    assert!(matches!(err, ProtocolError::UnsupportedOperation(_)));
    Ok(())
}
