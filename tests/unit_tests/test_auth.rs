// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use fileproto_rs::{errors::ProtocolError, proto::auth::AuthComponent};

use crate::unit_tests::limits;

#[test]
fn test_authorization_shape() -> Result<()> {
    let limits = limits();
    let auth = AuthComponent::authorization("alice", "correcthorse1");
    auth.validate(&limits)?;
    assert!(auth.is_authorization());
    assert!(!auth.is_authentication());
    Ok(())
}

#[test]
fn test_authentication_shape() -> Result<()> {
    let limits = limits();
    let auth = AuthComponent::authentication(
        "alice",
        vec![7u8; limits.token_length],
        vec![9u8; limits.digest_length],
    );
    auth.validate(&limits)?;
    assert!(auth.is_authentication());
    assert!(!auth.is_authorization());
    Ok(())
}

#[test]
fn test_missing_credentials_rejected() {
    let limits = limits();
    let auth = AuthComponent {
        identity: "alice".to_string(),
        ..AuthComponent::default()
    };
    assert!(matches!(
        auth.validate(&limits),
        Err(ProtocolError::InvalidAuthSemantic(_))
    ));
}

#[test]
fn test_digest_without_token_rejected() {
    let limits = limits();
    let auth = AuthComponent {
        identity: "alice".to_string(),
        password: Some("correcthorse1".to_string()),
        token: None,
        refresh_digest: Some(vec![1u8; limits.digest_length]),
    };
    assert!(matches!(
        auth.validate(&limits),
        Err(ProtocolError::InvalidAuthSemantic(_))
    ));
}

#[test]
fn test_password_length_bounds() {
    let limits = limits();

    // Exactly at the bounds passes.
    for len in [limits.password_min, limits.password_max] {
        let auth = AuthComponent::authorization("alice", "p".repeat(len));
        assert!(auth.validate(&limits).is_ok(), "length {len} should pass");
    }
    // One off either bound fails.
    for len in [limits.password_min - 1, limits.password_max + 1] {
        let auth = AuthComponent::authorization("alice", "p".repeat(len));
        assert!(auth.validate(&limits).is_err(), "length {len} should fail");
    }
}

#[test]
fn test_username_rules() {
    let limits = limits();
    assert!(limits.valid_username("alice"));
    assert!(limits.valid_username("alice.b-2_c"));
    // Too short, bad leading char, bad charset, too long.
    assert!(!limits.valid_username("abc"));
    assert!(!limits.valid_username("_alice"));
    assert!(!limits.valid_username("al ice"));
    assert!(!limits.valid_username(&"a".repeat(limits.username_max + 1)));
}

#[test]
fn test_token_length_is_exact() {
    let limits = limits();
    let auth = AuthComponent {
        identity: "alice".to_string(),
        password: None,
        token: Some(vec![1u8; limits.token_length - 1]),
        refresh_digest: None,
    };
    assert!(matches!(
        auth.validate(&limits),
        Err(ProtocolError::InvalidAuthSemantic(_))
    ));
}

#[test]
fn test_byte_fields_travel_as_hex() -> Result<()> {
    let limits = limits();
    let auth = AuthComponent::authentication(
        "alice",
        vec![0xAB; limits.token_length],
        vec![0xCD; limits.digest_length],
    );
    let json: serde_json::Value = serde_json::to_value(&auth)?;
    assert_eq!(
        json["token"].as_str().expect("token is a string"),
        "ab".repeat(limits.token_length)
    );

    let parsed: AuthComponent = serde_json::from_value(json)?;
    assert_eq!(parsed.token, auth.token);
    assert_eq!(parsed.refresh_digest, auth.refresh_digest);
    Ok(())
}
