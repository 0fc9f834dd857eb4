// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Category, subcategory and cursor bit fields carried by request headers.
//!
//! All of them travel as decimal JSON numbers; the serde impls below reject
//! bit patterns outside the declared universe so that a malformed header
//! fails during parsing rather than deep inside a handler.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

macro_rules! impl_bitflag_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_u8(self.bits())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let bits = u8::deserialize(deserializer)?;
                Self::from_bits(bits).ok_or_else(|| {
                    de::Error::custom(format!(
                        "invalid {} bits: {bits:#010b}",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

bitflags! {
    /// Top-level operation categories.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestCategory: u8 {
        const HEARTBEAT  = 0b0000_0001;
        const AUTH       = 0b0000_0010;
        const FILE_OP    = 0b0000_0100;
        const PERMISSION = 0b0000_1000;
        const INFO       = 0b0001_0000;
    }
}

bitflags! {
    /// Subcategories for AUTH requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AuthFlags: u8 {
        const REGISTER        = 0b0000_0001;
        const LOGIN           = 0b0000_0010;
        const REFRESH         = 0b0000_0100;
        const CHANGE_PASSWORD = 0b0000_1000;
        const DELETE          = 0b0001_0000;
        const LOGOUT          = 0b0010_0000;
    }
}

bitflags! {
    /// Subcategories for FILE_OP requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileFlags: u8 {
        const CREATE    = 0b0000_0001;
        const READ      = 0b0000_0010;
        const WRITE     = 0b0000_0100;
        const OVERWRITE = 0b0000_1000;
        const APPEND    = 0b0001_0000;
        const DELETE    = 0b0010_0000;
    }
}

bitflags! {
    /// Subcategories for PERMISSION requests. The lower nibble selects the
    /// action; the top three bits optionally carry the role for GRANT/REVOKE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PermissionFlags: u8 {
        const GRANT     = 0b0000_0001;
        const REVOKE    = 0b0000_0010;
        const HIDE      = 0b0000_0100;
        const PUBLICISE = 0b0000_1000;
        const TRANSFER  = 0b0001_0000;

        const READER  = 0b0010_0000;
        const EDITOR  = 0b0100_0000;
        const MANAGER = 0b1000_0000;
    }
}

impl PermissionFlags {
    /// Bits reserved for the role accompanying a GRANT/REVOKE.
    pub const ROLE_MASK: PermissionFlags = PermissionFlags::READER
        .union(PermissionFlags::EDITOR)
        .union(PermissionFlags::MANAGER);

    /// The action bits with any role modifier stripped.
    pub fn action(self) -> PermissionFlags {
        self.difference(Self::ROLE_MASK)
    }

    /// The role bits with the action stripped.
    pub fn role_bits(self) -> PermissionFlags {
        self.intersection(Self::ROLE_MASK)
    }
}

bitflags! {
    /// Subcategories for INFO requests; `VERBOSE` is a modifier combinable
    /// with any query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InfoFlags: u8 {
        const HEARTBEAT           = 0b0000_0001;
        const PERMISSION_METADATA = 0b0000_0010;
        const FILE_METADATA       = 0b0000_0100;
        const USER_METADATA       = 0b0000_1000;
        const STORAGE_USAGE       = 0b0001_0000;
        const SSL_CREDENTIALS     = 0b0010_0000;

        const VERBOSE = 0b0100_0000;
    }
}

impl InfoFlags {
    pub const OPERATION_MASK: InfoFlags = InfoFlags::HEARTBEAT
        .union(InfoFlags::PERMISSION_METADATA)
        .union(InfoFlags::FILE_METADATA)
        .union(InfoFlags::USER_METADATA)
        .union(InfoFlags::STORAGE_USAGE)
        .union(InfoFlags::SSL_CREDENTIALS);

    /// The query with the VERBOSE modifier masked away.
    pub fn operation(self) -> InfoFlags {
        self.intersection(Self::OPERATION_MASK)
    }

    pub fn verbose(self) -> bool {
        self.contains(Self::VERBOSE)
    }
}

bitflags! {
    /// Per-request cursor lifecycle control for file operations.
    ///
    /// Authoritative over the boolean conveniences (`cursor_keepalive`,
    /// `end_operation`) when both appear in a message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CursorFlags: u8 {
        const CURSOR_KEEPALIVE                = 0b0000_0001;
        const POST_OPERATION_CURSOR_KEEPALIVE = 0b0000_0010;
        const PURGE_CURSOR                    = 0b0000_0100;
    }
}

impl Default for CursorFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl_bitflag_serde!(RequestCategory);
impl_bitflag_serde!(AuthFlags);
impl_bitflag_serde!(FileFlags);
impl_bitflag_serde!(PermissionFlags);
impl_bitflag_serde!(InfoFlags);
impl_bitflag_serde!(CursorFlags);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_role_extraction() {
        let bits = PermissionFlags::GRANT | PermissionFlags::MANAGER;
        assert_eq!(bits.action(), PermissionFlags::GRANT);
        assert_eq!(bits.role_bits(), PermissionFlags::MANAGER);
    }

    #[test]
    fn test_info_verbose_masking() {
        let bits = InfoFlags::STORAGE_USAGE | InfoFlags::VERBOSE;
        assert!(bits.verbose());
        assert_eq!(bits.operation(), InfoFlags::STORAGE_USAGE);
    }
}
