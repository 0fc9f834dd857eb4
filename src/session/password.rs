// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Password hashing and constant-time credential comparison.
//!
//! PBKDF2-HMAC-SHA256 with a fixed iteration count: the parameters are part
//! of the on-disk contract, so a migrated user database keeps verifying.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::utils::random_bytes;

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const SALT_LENGTH: usize = 16;
pub const HASH_LENGTH: usize = 32;

pub fn generate_salt() -> Vec<u8> {
    random_bytes(SALT_LENGTH)
}

/// Derives the stored hash for `password` under `salt`.
pub fn hash_password(password: &str, salt: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; HASH_LENGTH];
    pbkdf2_hmac::<Sha256>(
        password.trim().as_bytes(),
        salt,
        PBKDF2_ITERATIONS,
        &mut out,
    );
    out
}

/// Constant-time equality for bearer credentials. Length mismatch is an
/// immediate (public) failure.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Verifies `password` against a stored hash+salt pair in constant time.
pub fn verify_password(password: &str, stored_hash: &[u8], salt: &[u8]) -> bool {
    constant_time_eq(&hash_password(password, salt), stored_hash)
}

/// PBKDF2 is CPU-bound; request handlers offload it to the blocking pool.
pub async fn hash_password_offloaded(
    password: String,
    salt: Vec<u8>,
) -> (Vec<u8>, Vec<u8>) {
    tokio::task::spawn_blocking(move || {
        let hash = hash_password(&password, &salt);
        (hash, salt)
    })
    .await
    .unwrap_or_else(|_| (Vec::new(), Vec::new()))
}

/// Offloaded variant of [`verify_password`].
pub async fn verify_password_offloaded(
    password: String,
    stored_hash: Vec<u8>,
    salt: Vec<u8>,
) -> bool {
    tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash, &salt))
        .await
        .unwrap_or(false)
}
