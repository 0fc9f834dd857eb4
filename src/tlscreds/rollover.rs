// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Rollover tokens: signed records chaining each certificate rotation to the
//! previous key, so pinning clients can upgrade their trust anchor.
//!
//! The ledger is a JSON object keyed by the SHA-256 fingerprint of the
//! certificate being retired. Each token is signed by the retiring private
//! key over `old_pubkey_hash || new_pubkey_hash || nonce` (ECDSA-SHA256).

use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Result, bail};
use p256::ecdsa::{
    Signature, SigningKey, VerifyingKey,
    signature::{Signer, Verifier},
};
use p256::pkcs8::EncodePublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::utils::{random_hex, unix_timestamp};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloverToken {
    pub hostname: String,
    pub port: u16,
    /// DER of the retiring certificate, hex.
    pub old_certificate: String,
    /// SHA-256 over the SubjectPublicKeyInfo DER, hex.
    pub old_pubkey_hash: String,
    pub new_pubkey_hash: String,
    pub issued_at: f64,
    pub valid_until: f64,
    pub reason: String,
    /// ECDSA-SHA256 signature (DER, hex) by the retiring private key.
    pub signature: String,
    pub nonce: String,
}

/// old-certificate fingerprint (SHA-256 hex) → token.
pub type RolloverLedger = HashMap<String, RolloverToken>;

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 hex over the public key's SPKI DER.
pub fn pubkey_sha256_hex(key: &VerifyingKey) -> Result<String> {
    let spki = key
        .to_public_key_der()
        .context("failed to encode public key")?;
    Ok(sha256_hex(spki.as_bytes()))
}

fn signed_message(
    old_pubkey_hash: &str,
    new_pubkey_hash: &str,
    nonce: &str,
) -> Result<Vec<u8>> {
    let mut message = hex::decode(old_pubkey_hash)?;
    message.extend(hex::decode(new_pubkey_hash)?);
    message.extend(hex::decode(nonce)?);
    Ok(message)
}

/// Builds one token attesting that `new` succeeds `old` for this host.
/// Returns the ledger key (old certificate fingerprint) alongside it.
#[allow(clippy::too_many_arguments)]
pub fn generate_rollover_token(
    old_key: &SigningKey,
    old_cert_der: &[u8],
    new_key: &VerifyingKey,
    hostname: &str,
    port: u16,
    grace_window_secs: f64,
    nonce_length: usize,
    reason: &str,
) -> Result<(String, RolloverToken)> {
    let issued_at = unix_timestamp();
    let old_pubkey_hash = pubkey_sha256_hex(old_key.verifying_key())?;
    let new_pubkey_hash = pubkey_sha256_hex(new_key)?;
    let nonce = random_hex(nonce_length);

    let message = signed_message(&old_pubkey_hash, &new_pubkey_hash, &nonce)?;
    let signature: Signature = old_key.sign(&message);

    let token = RolloverToken {
        hostname: hostname.to_string(),
        port,
        old_certificate: hex::encode(old_cert_der),
        old_pubkey_hash,
        new_pubkey_hash,
        issued_at,
        valid_until: issued_at + grace_window_secs,
        reason: reason.to_string(),
        signature: hex::encode(signature.to_der()),
        nonce,
    };
    Ok((sha256_hex(old_cert_der), token))
}

/// Verifies a token against the retiring certificate's public key.
pub fn verify_rollover_token(token: &RolloverToken, old_key: &VerifyingKey) -> bool {
    let Ok(message) =
        signed_message(&token.old_pubkey_hash, &token.new_pubkey_hash, &token.nonce)
    else {
        return false;
    };
    let Ok(raw) = hex::decode(&token.signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(&raw) else {
        return false;
    };
    old_key.verify(&message, &signature).is_ok()
}

/// Loads the on-disk ledger; a missing file is an empty ledger.
pub fn load_ledger(path: &Path) -> Result<RolloverLedger> {
    match fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(RolloverLedger::new()),
        Ok(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("corrupt rollover ledger at {path:?}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(RolloverLedger::new())
        },
        Err(e) => bail!("failed to read rollover ledger at {path:?}: {e}"),
    }
}

/// Keeps only the `keep` most recently issued tokens.
pub fn trim_ledger(ledger: &mut RolloverLedger, keep: usize) {
    if ledger.len() <= keep {
        return;
    }
    let mut issued: Vec<(String, f64)> = ledger
        .iter()
        .map(|(fingerprint, token)| (fingerprint.clone(), token.issued_at))
        .collect();
    // Most recent first.
    issued.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    for (fingerprint, _) in issued.into_iter().skip(keep) {
        ledger.remove(&fingerprint);
    }
}

/// Trims to `history_length - 1`, appends the new token and persists, so the
/// stored ledger never exceeds `history_length` entries.
pub fn append_to_ledger(
    path: &Path,
    fingerprint: String,
    token: RolloverToken,
    history_length: usize,
) -> Result<()> {
    let mut ledger = load_ledger(path)?;
    trim_ledger(&mut ledger, history_length.saturating_sub(1));
    ledger.insert(fingerprint, token);

    let serialized =
        serde_json::to_string_pretty(&ledger).context("failed to serialize ledger")?;
    fs::write(path, serialized)
        .with_context(|| format!("failed to write rollover ledger at {path:?}"))?;
    Ok(())
}
