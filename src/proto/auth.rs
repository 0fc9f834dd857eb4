// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The optional auth component carried after the header.
//!
//! Two credential shapes are derived from it:
//! * **authorization** — password present, token and digest absent. Used by
//!   REGISTER and LOGIN, where no session exists yet.
//! * **authentication** — token and digest present, password absent. Used by
//!   everything running inside an established session.
//!
//! Account deletion is the one operation presenting both a live token and the
//! password, so presence validation only demands at least one of the two.

use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, ProtocolResult},
    proto::{ProtocolLimits, serde_hex_opt},
};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthComponent {
    /// Username the credentials belong to.
    pub identity: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(
        default,
        with = "serde_hex_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub token: Option<Vec<u8>>,

    #[serde(
        default,
        with = "serde_hex_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_digest: Option<Vec<u8>>,
}

impl AuthComponent {
    pub fn authorization(identity: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            password: Some(password.into()),
            token: None,
            refresh_digest: None,
        }
    }

    pub fn authentication(
        identity: impl Into<String>,
        token: Vec<u8>,
        refresh_digest: Vec<u8>,
    ) -> Self {
        Self {
            identity: identity.into(),
            password: None,
            token: Some(token),
            refresh_digest: Some(refresh_digest),
        }
    }

    /// Parses and validates raw auth-component bytes.
    pub fn from_bytes(bytes: &[u8], limits: &ProtocolLimits) -> ProtocolResult<Self> {
        let auth: AuthComponent = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::InvalidAuthSemantic(e.to_string()))?;
        auth.validate(limits)?;
        Ok(auth)
    }

    /// Field-level validation against the protocol limits.
    pub fn validate(&self, limits: &ProtocolLimits) -> ProtocolResult<()> {
        if !limits.valid_username(&self.identity) {
            return Err(ProtocolError::InvalidAuthSemantic(format!(
                "invalid username {:?}",
                self.identity
            )));
        }
        if self.password.is_none() && self.token.is_none() {
            return Err(ProtocolError::InvalidAuthSemantic(
                "password or token required".to_string(),
            ));
        }
        if self.refresh_digest.is_some() && self.token.is_none() {
            return Err(ProtocolError::InvalidAuthSemantic(
                "refresh digest provided without an active token".to_string(),
            ));
        }
        if let Some(password) = &self.password {
            let len = password.chars().count();
            if len < limits.password_min || len > limits.password_max {
                return Err(ProtocolError::InvalidAuthSemantic(format!(
                    "password length {len} outside {}..={}",
                    limits.password_min, limits.password_max
                )));
            }
        }
        if let Some(token) = &self.token
            && token.len() != limits.token_length
        {
            return Err(ProtocolError::InvalidAuthSemantic(format!(
                "token must be exactly {} bytes",
                limits.token_length
            )));
        }
        if let Some(digest) = &self.refresh_digest
            && digest.len() != limits.digest_length
        {
            return Err(ProtocolError::InvalidAuthSemantic(format!(
                "refresh digest must be exactly {} bytes",
                limits.digest_length
            )));
        }
        Ok(())
    }

    /// Password present, token and digest absent.
    pub fn is_authorization(&self) -> bool {
        self.password.is_some() && self.token.is_none() && self.refresh_digest.is_none()
    }

    /// Token and digest present, password absent.
    pub fn is_authentication(&self) -> bool {
        self.password.is_none() && self.token.is_some() && self.refresh_digest.is_some()
    }

    /// Fails unless the component carries a session token.
    pub fn require_token(&self) -> ProtocolResult<&[u8]> {
        self.token.as_deref().ok_or_else(|| {
            ProtocolError::InvalidAuthSemantic(
                "operation requires a session token".to_string(),
            )
        })
    }
}
