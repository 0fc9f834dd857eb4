// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use fileproto_rs::session::password::{
    HASH_LENGTH, SALT_LENGTH, constant_time_eq, generate_salt, hash_password,
    verify_password,
};

#[test]
fn test_hash_and_verify() {
    let salt = generate_salt();
    assert_eq!(salt.len(), SALT_LENGTH);

    let hash = hash_password("correcthorse1", &salt);
    assert_eq!(hash.len(), HASH_LENGTH);
    assert!(verify_password("correcthorse1", &hash, &salt));
    assert!(!verify_password("wronghorse22", &hash, &salt));
}

#[test]
fn test_hash_is_deterministic_per_salt() {
    let salt = generate_salt();
    assert_eq!(
        hash_password("correcthorse1", &salt),
        hash_password("correcthorse1", &salt)
    );

    let other_salt = generate_salt();
    assert_ne!(
        hash_password("correcthorse1", &salt),
        hash_password("correcthorse1", &other_salt)
    );
}

#[test]
fn test_whitespace_is_trimmed() {
    // Stored hashes are computed over the trimmed password.
    let salt = generate_salt();
    let hash = hash_password("correcthorse1", &salt);
    assert!(verify_password("  correcthorse1  ", &hash, &salt));
}

#[test]
fn test_constant_time_eq_length_mismatch() {
    assert!(constant_time_eq(b"abcd", b"abcd"));
    assert!(!constant_time_eq(b"abcd", b"abce"));
    assert!(!constant_time_eq(b"abcd", b"abc"));
    assert!(constant_time_eq(b"", b""));
}
