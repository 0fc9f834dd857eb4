// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire-protocol models: the three request components (header, auth, body),
//! the response pair, bit fields, response codes and the framing codec.

pub mod auth;
pub mod body;
pub mod codes;
pub mod flags;
pub mod header;
pub mod response;
pub mod wire;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::errors::{ProtocolError, ProtocolResult};

/// Byte used to right-pad fixed-width headers.
pub const HEADER_PAD_BYTE: u8 = b' ';

/// Size and shape constraints shared by both peers.
///
/// The server reads these from the `[protocol]` section of its config file;
/// the defaults below are the protocol's reference values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolLimits {
    /// Fixed width of every request and response header on the wire.
    pub header_width: usize,
    /// Upper bound accepted for the auth component, bytes.
    pub auth_max_size: usize,
    /// Upper bound accepted for any body component, bytes.
    pub body_max_size: usize,
    /// Username length bounds, inclusive.
    pub username_min: usize,
    pub username_max: usize,
    /// Password length bounds, inclusive.
    pub password_min: usize,
    pub password_max: usize,
    /// Exact raw-byte length of session tokens and refresh digests.
    pub token_length: usize,
    pub digest_length: usize,
    /// Longest filename accepted.
    pub filename_max: usize,
    /// Largest single read/write chunk, bytes.
    pub chunk_max_size: usize,
    /// Longest permission effect duration, seconds (~31 days).
    pub effect_duration_max: u64,
    /// Longest response description.
    pub description_max: usize,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            header_width: 256,
            auth_max_size: 1024,
            body_max_size: 4 * 1024 * 1024,
            username_min: 4,
            username_max: 64,
            password_min: 8,
            password_max: 256,
            token_length: 32,
            digest_length: 32,
            filename_max: 255,
            chunk_max_size: 1024 * 1024,
            effect_duration_max: 31 * 24 * 3600,
            description_max: 512,
        }
    }
}

impl ProtocolLimits {
    /// Username rule: 4-64 chars of `[A-Za-z0-9_.-]`, leading alphanumeric.
    pub fn valid_username(&self, username: &str) -> bool {
        let len = username.chars().count();
        if len < self.username_min || len > self.username_max {
            return false;
        }
        let mut chars = username.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphanumeric() => {},
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    }

    /// Filename rule: non-empty, bounded, no path separators or NUL, and not
    /// a directory reference.
    pub fn valid_filename(&self, filename: &str) -> bool {
        !filename.is_empty()
            && filename.len() <= self.filename_max
            && filename != "."
            && filename != ".."
            && !filename
                .chars()
                .any(|c| matches!(c, '/' | '\\' | '\0'))
    }

    /// Version rule: `major.minor.patch` decimal triple, 5-12 chars total.
    pub fn valid_version(&self, version: &str) -> bool {
        if version.len() < 5 || version.len() > 12 {
            return false;
        }
        let mut parts = 0;
        for part in version.split('.') {
            if part.is_empty() || part.parse::<u64>().is_err() {
                return false;
            }
            parts += 1;
        }
        parts == 3
    }
}

/// Serializes a component as JSON right-padded with ASCII spaces to `width`.
pub(crate) fn encode_padded<T: Serialize>(
    value: &T,
    width: usize,
) -> ProtocolResult<Vec<u8>> {
    let mut buf = serde_json::to_vec(value)
        .map_err(|e| ProtocolError::InvalidHeaderValues(e.to_string()))?;
    if buf.len() > width {
        return Err(ProtocolError::InvalidHeaderValues(format!(
            "header of {} bytes exceeds fixed width {width}",
            buf.len()
        )));
    }
    buf.resize(width, HEADER_PAD_BYTE);
    Ok(buf)
}

/// Parses a fixed-width component, ignoring the space padding.
pub(crate) fn decode_padded<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    let trimmed_len = bytes
        .iter()
        .rposition(|&b| b != HEADER_PAD_BYTE)
        .map(|p| p + 1)
        .unwrap_or(0);
    serde_json::from_slice(&bytes[..trimmed_len])
        .map_err(|e| ProtocolError::InvalidHeaderSemantic(e.to_string()))
}

/// Serde adapter rendering byte fields as lowercase hex strings, the JSON
/// transport form for all binary data.
pub mod serde_hex {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(de::Error::custom)
    }
}

/// `Option<Vec<u8>>` variant of [`serde_hex`].
pub mod serde_hex_opt {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| hex::decode(s).map_err(de::Error::custom))
            .transpose()
    }
}
