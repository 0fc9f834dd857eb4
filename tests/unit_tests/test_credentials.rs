// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use fileproto_rs::{
    cfg::config::TlsConfig,
    client::{TrustPolicy, tls::build_client_config},
    tlscreds::{
        credentials::{
            build_server_config, ensure_credentials,
            generate_self_signed_credentials, load_credentials,
            rotate_server_credentials,
        },
        rollover::{load_ledger, verify_rollover_token},
    },
};

use crate::unit_tests::scratch_dir;

fn tls_config(dir: &std::path::Path) -> TlsConfig {
    TlsConfig {
        credentials_directory: dir.to_path_buf(),
        certificate_filename: "certfile.crt".to_string(),
        key_filename: "keyfile.pem".to_string(),
        rollover_filename: "rollover.json".to_string(),
        dns_name: "localhost".to_string(),
        ciphers: Vec::new(),
        rollover_grace_window: Duration::from_secs(3600),
        rollover_nonce_length: 16,
        rollover_history_length: 4,
        rollover_check_poll_interval: Duration::from_secs(5),
        rotation_interval: None,
    }
}

#[test]
#[serial]
fn test_generate_and_load_round_trip() -> Result<()> {
    let dir = scratch_dir("creds");
    let cert_path = dir.join("certfile.crt");
    let key_path = dir.join("keyfile.pem");

    generate_self_signed_credentials(&cert_path, &key_path, "localhost")?;
    let creds = load_credentials(&cert_path, &key_path)?;
    assert!(!creds.cert_der.is_empty());
    assert_eq!(creds.fingerprint().len(), 64);

    // The loaded pair must form a working server config.
    build_server_config(&creds, &[])?;

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
#[serial]
fn test_ensure_credentials_bootstraps_once() -> Result<()> {
    let dir = scratch_dir("bootstrap");
    let cfg = tls_config(&dir);

    let first = ensure_credentials(&cfg)?;
    let second = ensure_credentials(&cfg)?;
    // Second call loads, never regenerates.
    assert_eq!(first.fingerprint(), second.fingerprint());

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
#[serial]
fn test_cipher_allow_list_rejects_unknown_names() -> Result<()> {
    let dir = scratch_dir("ciphers");
    let cfg = tls_config(&dir);
    let creds = ensure_credentials(&cfg)?;

    let err = build_server_config(&creds, &["NOT_A_SUITE".to_string()])
        .expect_err("no suite matches");
    assert!(err.to_string().contains("cipher"));

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
#[serial]
fn test_rotation_appends_verifiable_token() -> Result<()> {
    let dir = scratch_dir("rotate");
    let cfg = tls_config(&dir);

    let before = ensure_credentials(&cfg)?;
    rotate_server_credentials(&cfg, "127.0.0.1", 8625, "test rotation")?;
    let after = load_credentials(&cfg.certificate_path(), &cfg.key_path())?;
    assert_ne!(before.fingerprint(), after.fingerprint());

    let ledger = load_ledger(&cfg.rollover_path())?;
    assert!(ledger.len() <= cfg.rollover_history_length);
    let token = ledger
        .get(&before.fingerprint())
        .expect("ledger is keyed by the retired fingerprint");
    // Signed by the retired key over old || new || nonce.
    assert!(verify_rollover_token(token, before.signing_key.verifying_key()));
    assert!(!verify_rollover_token(token, after.signing_key.verifying_key()));

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
#[serial]
fn test_client_config_builds_for_both_policies() -> Result<()> {
    build_client_config(&TrustPolicy::BlindTrust)?;
    build_client_config(&TrustPolicy::PinnedFingerprint([0u8; 32]))?;
    Ok(())
}
