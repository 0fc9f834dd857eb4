// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The fixed-width request header, first of the up-to-three JSON components
//! of every message. Its width is constant so the receiver always knows how
//! many bytes to read before anything else.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, ProtocolResult},
    proto::{
        ProtocolLimits, decode_padded, encode_padded,
        flags::{AuthFlags, FileFlags, InfoFlags, PermissionFlags, RequestCategory},
    },
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestHeader {
    /// Protocol version as a semver string.
    pub version: String,

    /// Read-ahead sizes for the optional trailing components, bytes.
    #[serde(default)]
    pub auth_size: usize,
    #[serde(default)]
    pub body_size: usize,

    /// Sender metadata.
    pub sender_hostname: IpAddr,
    pub sender_port: u16,
    pub sender_timestamp: f64,

    /// Client intent to terminate the connection after this exchange.
    #[serde(default)]
    pub finish: bool,

    /// Operation category and category-dependent subcategory bits.
    pub category: RequestCategory,
    pub subcategory: u8,
}

impl RequestHeader {
    /// Encodes as JSON padded with ASCII spaces to the fixed header width.
    pub fn to_padded_bytes(&self, width: usize) -> ProtocolResult<Vec<u8>> {
        encode_padded(self, width)
    }

    /// Parses a buffer of exactly the fixed header width.
    pub fn from_padded_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_padded(bytes)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self, limits: &ProtocolLimits) -> ProtocolResult<()> {
        if !limits.valid_version(&self.version) {
            return Err(ProtocolError::InvalidHeaderValues(format!(
                "invalid protocol version {:?}",
                self.version
            )));
        }
        if self.category.bits().count_ones() != 1 {
            return Err(ProtocolError::InvalidHeaderValues(
                "exactly one category bit must be set".to_string(),
            ));
        }
        if self.category != RequestCategory::HEARTBEAT && self.subcategory == 0 {
            return Err(ProtocolError::InvalidHeaderValues(
                "subcategory bits missing".to_string(),
            ));
        }
        if self.auth_size > limits.auth_max_size {
            return Err(ProtocolError::InvalidHeaderValues(format!(
                "auth component of {} bytes exceeds limit {}",
                self.auth_size, limits.auth_max_size
            )));
        }
        if self.body_size > limits.body_max_size {
            return Err(ProtocolError::InvalidHeaderValues(format!(
                "body component of {} bytes exceeds limit {}",
                self.body_size, limits.body_max_size
            )));
        }
        Ok(())
    }

    pub fn auth_flags(&self) -> Option<AuthFlags> {
        AuthFlags::from_bits(self.subcategory)
    }

    pub fn file_flags(&self) -> Option<FileFlags> {
        FileFlags::from_bits(self.subcategory)
    }

    pub fn permission_flags(&self) -> Option<PermissionFlags> {
        PermissionFlags::from_bits(self.subcategory)
    }

    pub fn info_flags(&self) -> Option<InfoFlags> {
        InfoFlags::from_bits(self.subcategory)
    }
}
