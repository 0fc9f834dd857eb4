// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use fileproto_rs::tlscreds::rollover::{
    RolloverLedger, RolloverToken, append_to_ledger, generate_rollover_token,
    load_ledger, trim_ledger, verify_rollover_token,
};
use p256::{ecdsa::SigningKey, pkcs8::DecodePrivateKey};

use crate::unit_tests::scratch_dir;

fn fresh_key() -> SigningKey {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .expect("keygen");
    SigningKey::from_pkcs8_der(&key_pair.serialize_der()).expect("pkcs8")
}

fn sample_token(
    old_key: &SigningKey,
    new_key: &SigningKey,
    issued_offset: f64,
) -> (String, RolloverToken) {
    let (fingerprint, mut token) = generate_rollover_token(
        old_key,
        b"old-cert-der",
        new_key.verifying_key(),
        "localhost",
        8625,
        3600.0,
        16,
        "test rotation",
    )
    .expect("token generation");
    token.issued_at += issued_offset;
    (fingerprint, token)
}

#[test]
fn test_token_signature_verifies() {
    let old_key = fresh_key();
    let new_key = fresh_key();
    let (_, token) = sample_token(&old_key, &new_key, 0.0);

    assert!(verify_rollover_token(&token, old_key.verifying_key()));
    // The new key did not sign it.
    assert!(!verify_rollover_token(&token, new_key.verifying_key()));
}

#[test]
fn test_tampered_nonce_fails_verification() {
    let old_key = fresh_key();
    let new_key = fresh_key();
    let (_, mut token) = sample_token(&old_key, &new_key, 0.0);

    token.nonce = "00".repeat(16);
    assert!(!verify_rollover_token(&token, old_key.verifying_key()));
}

#[test]
fn test_grace_window_bounds() {
    let old_key = fresh_key();
    let new_key = fresh_key();
    let (_, token) = sample_token(&old_key, &new_key, 0.0);
    assert!((token.valid_until - token.issued_at - 3600.0).abs() < 1e-6);
    assert_eq!(token.nonce.len(), 32, "16 nonce bytes as hex");
}

#[test]
fn test_trim_keeps_most_recent() {
    let old_key = fresh_key();
    let new_key = fresh_key();

    let mut ledger = RolloverLedger::new();
    for i in 0..5 {
        let (_, token) = sample_token(&old_key, &new_key, i as f64);
        ledger.insert(format!("fingerprint-{i}"), token);
    }

    trim_ledger(&mut ledger, 2);
    assert_eq!(ledger.len(), 2);
    assert!(ledger.contains_key("fingerprint-4"));
    assert!(ledger.contains_key("fingerprint-3"));
}

#[test]
fn test_ledger_file_round_trip_and_bound() -> Result<()> {
    let dir = scratch_dir("ledger");
    let path = dir.join("rollover.json");
    let old_key = fresh_key();
    let new_key = fresh_key();

    let history_length = 3;
    for i in 0..6 {
        let (_, token) = sample_token(&old_key, &new_key, i as f64);
        append_to_ledger(&path, format!("fp-{i}"), token, history_length)?;
    }

    let ledger = load_ledger(&path)?;
    assert!(ledger.len() <= history_length);
    assert!(ledger.contains_key("fp-5"));

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn test_missing_ledger_is_empty() -> Result<()> {
    let dir = scratch_dir("ledger-missing");
    let ledger = load_ledger(&dir.join("nope.json"))?;
    assert!(ledger.is_empty());
    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}
