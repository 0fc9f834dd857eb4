// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Response header and body. Responses mirror requests: a fixed-width header
//! always, a JSON body only when `body_size > 0`.

use std::{collections::HashMap, net::IpAddr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    errors::{ProtocolError, ProtocolResult},
    proto::{codes::ResponseCode, decode_padded, encode_padded},
    utils::unix_timestamp,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub version: String,

    pub code: ResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub responder_hostname: IpAddr,
    pub responder_port: u16,
    pub responder_timestamp: f64,

    #[serde(default)]
    pub body_size: usize,

    /// Whether the server will close the connection after this response.
    #[serde(default)]
    pub ended_connection: bool,

    /// Free-form string pairs for auxiliary metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<HashMap<String, String>>,
}

impl ResponseHeader {
    pub fn new(
        version: impl Into<String>,
        code: ResponseCode,
        hostname: IpAddr,
        port: u16,
    ) -> Self {
        Self {
            version: version.into(),
            code,
            description: None,
            responder_hostname: hostname,
            responder_port: port,
            responder_timestamp: unix_timestamp(),
            body_size: 0,
            ended_connection: false,
            kwargs: None,
        }
    }

    /// Builds the error response for a failed request.
    pub fn from_error(
        err: &ProtocolError,
        version: impl Into<String>,
        hostname: IpAddr,
        port: u16,
        ended_connection: bool,
    ) -> Self {
        let mut header = Self::new(version, err.code(), hostname, port);
        header.description = Some(err.to_string());
        header.ended_connection = ended_connection;
        header
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_ended_connection(mut self, ended: bool) -> Self {
        self.ended_connection = ended;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kwargs
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn to_padded_bytes(&self, width: usize) -> ProtocolResult<Vec<u8>> {
        encode_padded(self, width)
    }

    pub fn from_padded_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_padded(bytes)
    }
}

/// Response body: an open `contents` object plus cursor bookkeeping for
/// chunked file operations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResponseBody {
    #[serde(default)]
    pub contents: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_ended: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_accepted: Option<bool>,
}

impl ResponseBody {
    pub fn with_contents(contents: Map<String, Value>) -> Self {
        Self {
            contents,
            ..Self::default()
        }
    }

    pub fn insert(mut self, key: impl Into<String>, value: Value) -> Self {
        self.contents.insert(key.into(), value);
        self
    }

    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ProtocolError::Internal(anyhow::anyhow!(e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::InvalidBodySemantic(e.to_string()))
    }
}
