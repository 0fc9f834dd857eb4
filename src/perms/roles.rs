// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Role and capability vocabulary.
//!
//! Roles are what grants name; capabilities are what the `roles` relation
//! maps them to. Containment: OWNER ⊃ MANAGE_SUPER ⊃ MANAGE_RW ⊃
//! {READ, WRITE, DELETE}; EDITOR ⊃ {READ, WRITE}; READER ⊃ {READ}.

use core::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::proto::flags::PermissionFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Manager,
    Editor,
    Reader,
}

#[derive(Debug, Error)]
#[error("unknown role: {0:?}")]
pub struct UnknownRole(pub String);

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Manager => "manager",
            Self::Editor => "editor",
            Self::Reader => "reader",
        }
    }

    /// Extracts the role a GRANT/REVOKE subcategory carries in its top bits.
    pub fn from_flags(flags: PermissionFlags) -> Option<Self> {
        let bits = flags.role_bits();
        if bits == PermissionFlags::READER {
            Some(Self::Reader)
        } else if bits == PermissionFlags::EDITOR {
            Some(Self::Editor)
        } else if bits == PermissionFlags::MANAGER {
            Some(Self::Manager)
        } else {
            None
        }
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Self::Owner),
            "manager" => Ok(Self::Manager),
            "editor" => Ok(Self::Editor),
            "reader" => Ok(Self::Reader),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability kinds stored in `roles.permission`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write,
    Delete,
    ManageRw,
    ManageSuper,
}

impl Capability {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::ManageRw => "manage_rw",
            Self::ManageSuper => "manage_super",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
