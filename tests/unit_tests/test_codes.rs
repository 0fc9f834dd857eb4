// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use fileproto_rs::proto::codes::{ResponseClass, ResponseCode};

#[test]
fn test_all_codes_round_trip() -> Result<()> {
    for &code in ResponseCode::ALL {
        let parsed: ResponseCode = code.as_str().parse()?;
        assert_eq!(parsed, code);
    }
    Ok(())
}

#[test]
fn test_unknown_code_rejected() {
    assert!("4:nope".parse::<ResponseCode>().is_err());
    assert!("".parse::<ResponseCode>().is_err());
}

#[test]
fn test_class_prefixes() {
    assert_eq!(ResponseCode::PartialRead.class(), ResponseClass::Intermediary);
    assert_eq!(ResponseCode::Authenticated.class(), ResponseClass::Success);
    assert_eq!(ResponseCode::FileNotFound.class(), ResponseClass::ClientError);
    assert_eq!(
        ResponseCode::DatabaseFailure.class(),
        ResponseClass::ServerError
    );

    assert!(ResponseCode::Amended.is_success());
    assert!(ResponseCode::PartialAmend.is_intermediary());
    assert!(ResponseCode::Banned.is_error());
    assert!(!ResponseCode::Heartbeat.is_error());
}

#[test]
fn test_codes_serialize_as_strings() -> Result<()> {
    let json = serde_json::to_string(&ResponseCode::OwnershipTransferred)?;
    assert_eq!(json, "\"1:sft\"");
    let parsed: ResponseCode = serde_json::from_str("\"2:fcnt\"")?;
    assert_eq!(parsed, ResponseCode::FileContested);
    Ok(())
}

#[test]
fn test_expected_wire_strings() {
    // The mnemonics are a wire contract; spot-check the full families.
    let expectations = [
        (ResponseCode::UserCreated, "1:unew"),
        (ResponseCode::Authenticated, "1:auth"),
        (ResponseCode::SessionRefreshed, "1:ref"),
        (ResponseCode::SessionTerminated, "1:bye"),
        (ResponseCode::UserDeleted, "1:udel"),
        (ResponseCode::PasswordChanged, "1:pw"),
        (ResponseCode::FileCreated, "1:fnew"),
        (ResponseCode::Amended, "1:amnd"),
        (ResponseCode::Read, "1:read"),
        (ResponseCode::FileDeleted, "1:fdel"),
        (ResponseCode::FilePublicised, "1:pub"),
        (ResponseCode::FileHidden, "1:hide"),
        (ResponseCode::OwnershipTransferred, "1:sft"),
        (ResponseCode::Granted, "1:gnt"),
        (ResponseCode::Revoked, "1:rvk"),
        (ResponseCode::Heartbeat, "1:hb"),
        (ResponseCode::PartialAmend, "0:a"),
        (ResponseCode::PartialRead, "0:r"),
        (ResponseCode::UserAuthenticationError, "2:auth"),
        (ResponseCode::ExpiredAuthToken, "2:exp"),
        (ResponseCode::Banned, "2:ban"),
        (ResponseCode::FileContested, "2:fcnt"),
        (ResponseCode::FileJustDeleted, "2:df"),
        (ResponseCode::InsufficientPermissions, "2:perm"),
        (ResponseCode::InternalServerError, "3:*"),
        (ResponseCode::DatabaseFailure, "3:db"),
        (ResponseCode::OutOfDiskSpace, "3:disk"),
    ];
    for (code, wire) in expectations {
        assert_eq!(code.as_str(), wire);
    }
}
