// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Category-specific body components. The header's `category` decides which
//! model the trailing `body_size` bytes parse into.

use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, ProtocolResult},
    proto::{
        ProtocolLimits,
        flags::{CursorFlags, RequestCategory},
        serde_hex_opt,
    },
};

/// Body of FILE_OP requests.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileBody {
    pub subject_file: String,
    pub subject_file_owner: String,

    /// Client view of the file offset; authoritative over any cached cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<u64>,
    /// Read size cap, 1..=chunk_max_size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(
        default,
        with = "serde_hex_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub write_data: Option<Vec<u8>>,

    #[serde(default)]
    pub cursor_keepalive: bool,
    #[serde(default)]
    pub end_operation: bool,
    /// Authoritative over the two booleans above when non-empty.
    #[serde(default)]
    pub cursor_bitfield: CursorFlags,
}

impl FileBody {
    pub fn validate(&self, limits: &ProtocolLimits) -> ProtocolResult<()> {
        if !limits.valid_filename(&self.subject_file) {
            return Err(ProtocolError::InvalidBodyValues(format!(
                "invalid filename {:?}",
                self.subject_file
            )));
        }
        if !limits.valid_username(&self.subject_file_owner) {
            return Err(ProtocolError::InvalidBodyValues(format!(
                "invalid file owner {:?}",
                self.subject_file_owner
            )));
        }
        if let Some(chunk) = self.chunk_size
            && (chunk == 0 || chunk > limits.chunk_max_size)
        {
            return Err(ProtocolError::InvalidBodyValues(format!(
                "chunk size {chunk} outside 1..={}",
                limits.chunk_max_size
            )));
        }
        if let Some(data) = &self.write_data
            && (data.is_empty() || data.len() > limits.chunk_max_size)
        {
            return Err(ProtocolError::InvalidBodyValues(format!(
                "write payload of {} bytes outside 1..={}",
                data.len(),
                limits.chunk_max_size
            )));
        }
        Ok(())
    }

    /// Relative path `owner/filename`, the key for locks and handle caches.
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.subject_file_owner, self.subject_file)
    }

    /// Keepalive request, preferring the bitfield over the boolean.
    pub fn wants_keepalive(&self) -> bool {
        if !self.cursor_bitfield.is_empty() {
            self.cursor_bitfield.contains(CursorFlags::CURSOR_KEEPALIVE)
        } else {
            self.cursor_keepalive
        }
    }

    /// Whether the handle survives the operation-closing request.
    pub fn post_operation_keepalive(&self) -> bool {
        self.cursor_bitfield
            .contains(CursorFlags::POST_OPERATION_CURSOR_KEEPALIVE)
    }

    /// Unconditional close-and-evict request.
    pub fn wants_purge(&self) -> bool {
        self.cursor_bitfield.contains(CursorFlags::PURGE_CURSOR)
    }

    /// Whether the cached handle should be dropped once this request is done.
    pub fn evict_after(&self) -> bool {
        if self.wants_purge() {
            return true;
        }
        if self.end_operation {
            return !self.post_operation_keepalive();
        }
        !self.wants_keepalive()
    }
}

/// Body of PERMISSION requests.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PermissionBody {
    pub subject_file: String,
    pub subject_file_owner: String,

    /// Grantee (absent for PUBLICISE/HIDE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_user: Option<String>,

    /// Seconds the grant stays valid; 0 or absent means perpetual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect_duration: Option<u64>,
}

impl PermissionBody {
    pub fn validate(&self, limits: &ProtocolLimits) -> ProtocolResult<()> {
        if !limits.valid_filename(&self.subject_file) {
            return Err(ProtocolError::InvalidBodyValues(format!(
                "invalid filename {:?}",
                self.subject_file
            )));
        }
        if !limits.valid_username(&self.subject_file_owner) {
            return Err(ProtocolError::InvalidBodyValues(format!(
                "invalid file owner {:?}",
                self.subject_file_owner
            )));
        }
        if let Some(user) = &self.subject_user
            && !limits.valid_username(user)
        {
            return Err(ProtocolError::InvalidBodyValues(format!(
                "invalid subject user {:?}",
                user
            )));
        }
        if let Some(duration) = self.effect_duration
            && duration > limits.effect_duration_max
        {
            return Err(ProtocolError::InvalidBodyValues(format!(
                "effect duration {duration}s exceeds {}s",
                limits.effect_duration_max
            )));
        }
        Ok(())
    }

    /// Fails unless a grantee was named.
    pub fn require_subject_user(&self) -> ProtocolResult<&str> {
        self.subject_user.as_deref().ok_or_else(|| {
            ProtocolError::InvalidBodySemantic(
                "operation requires a subject user".to_string(),
            )
        })
    }
}

/// Body of INFO requests: a resource identifier whose meaning depends on the
/// subcategory (a username, or an `owner` + `resource` file pair).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InfoBody {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_owner: Option<String>,
}

impl InfoBody {
    pub fn validate(&self, limits: &ProtocolLimits) -> ProtocolResult<()> {
        if self.resource.is_empty() || self.resource.len() > limits.filename_max {
            return Err(ProtocolError::InvalidBodyValues(
                "invalid resource identifier".to_string(),
            ));
        }
        if let Some(owner) = &self.resource_owner
            && !limits.valid_username(owner)
        {
            return Err(ProtocolError::InvalidBodyValues(format!(
                "invalid resource owner {:?}",
                owner
            )));
        }
        Ok(())
    }
}

/// A parsed body, discriminated by the header category.
#[derive(Debug, Clone)]
pub enum RequestBody {
    File(FileBody),
    Permission(PermissionBody),
    Info(InfoBody),
}

impl RequestBody {
    /// Parses and validates raw body bytes according to the category.
    pub fn parse(
        category: RequestCategory,
        bytes: &[u8],
        limits: &ProtocolLimits,
    ) -> ProtocolResult<Self> {
        let semantic =
            |e: serde_json::Error| ProtocolError::InvalidBodySemantic(e.to_string());
        if category == RequestCategory::FILE_OP {
            let body: FileBody = serde_json::from_slice(bytes).map_err(semantic)?;
            body.validate(limits)?;
            Ok(Self::File(body))
        } else if category == RequestCategory::PERMISSION {
            let body: PermissionBody =
                serde_json::from_slice(bytes).map_err(semantic)?;
            body.validate(limits)?;
            Ok(Self::Permission(body))
        } else if category == RequestCategory::INFO {
            let body: InfoBody = serde_json::from_slice(bytes).map_err(semantic)?;
            body.validate(limits)?;
            Ok(Self::Info(body))
        } else {
            Err(ProtocolError::UnsupportedOperation(format!(
                "category {category:?} carries no body"
            )))
        }
    }
}
