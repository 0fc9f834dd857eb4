// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngExt;

const ADLER_MOD: u32 = 65_521;

/// Adler-32 checksum as defined by RFC 1950.
///
/// Used to tag file-lock holders with a cheap fingerprint of their identity.
/// Not cryptographic; it only distinguishes concurrent holders.
pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= ADLER_MOD;
        b %= ADLER_MOD;
    }
    (b << 16) | a
}

/// Seconds since the UNIX epoch as a float, the timestamp format every wire
/// component uses.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Fills a fresh buffer of `n` random bytes (tokens, digests, salts, nonces).
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rng().fill(buf.as_mut_slice());
    buf
}

/// Random `n`-byte value rendered as lowercase hex (2n characters).
pub fn random_hex(n: usize) -> String {
    hex::encode(random_bytes(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adler32_known_vector() {
        // Reference value from RFC 1950 examples.
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
        assert_eq!(adler32(b""), 1);
    }

    #[test]
    fn test_random_hex_length() {
        let hex = random_hex(16);
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
