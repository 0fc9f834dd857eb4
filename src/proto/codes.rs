// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Response codes carried in every response header.
//!
//! A code is a short tagged string of the form `<class>:<mnemonic>` where the
//! class digit gives the broad outcome:
//!
//! ```text
//! 0:*   intermediary (operation in progress, more exchanges expected)
//! 1:*   success
//! 2:*   client-side error
//! 3:*   server-side error
//! ```

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

/// Broad outcome class encoded in the first character of a response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Intermediary,
    Success,
    ClientError,
    ServerError,
}

/// Returned when a wire string does not name any known response code.
#[derive(Debug, Error)]
#[error("unknown response code: {0:?}")]
pub struct UnknownResponseCode(pub String);

macro_rules! response_codes {
    ($($variant:ident => $code:literal),+ $(,)?) => {
        /// All response codes the protocol can emit.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ResponseCode {
            $($variant,)+
        }

        impl ResponseCode {
            /// The wire form, e.g. `1:auth`.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $code,)+
                }
            }

            pub const ALL: &'static [ResponseCode] = &[$(Self::$variant,)+];
        }

        impl FromStr for ResponseCode {
            type Err = UnknownResponseCode;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($code => Ok(Self::$variant),)+
                    other => Err(UnknownResponseCode(other.to_string())),
                }
            }
        }
    };
}

response_codes! {
    // Intermediary
    PartialAmend => "0:a",
    PartialRead => "0:r",
    Wait => "0:wait",
    RetryNeeded => "0:retry",

    // Success: auth
    UserCreated => "1:unew",
    Authenticated => "1:auth",
    SessionRefreshed => "1:ref",
    SessionTerminated => "1:bye",
    UserDeleted => "1:udel",
    PasswordChanged => "1:pw",

    // Success: file I/O
    FileCreated => "1:fnew",
    Amended => "1:amnd",
    Read => "1:read",
    FileDeleted => "1:fdel",
    FilePublicised => "1:pub",
    FileHidden => "1:hide",
    OwnershipTransferred => "1:sft",

    // Success: permissions + heartbeat
    Granted => "1:gnt",
    Revoked => "1:rvk",
    Heartbeat => "1:hb",

    // Client errors: general
    MalformedRequest => "2:malf",
    NonJsonSchema => "2:njs",
    RateLimitExceeded => "2:rlex",
    UnacceptableSpeed => "2:unsp",
    UnsupportedOperation => "2:unop",
    OperationalConflict => "2:opcf",
    OperationContested => "2:opct",

    // Client errors: header
    InvalidHeaderSemantic => "2:ihs",
    InvalidHeaderValues => "2:ihv",

    // Client errors: auth
    UserAuthenticationError => "2:auth",
    InvalidAuthSemantic => "2:ias",
    IncorrectAuthData => "2:iad",
    ExpiredAuthToken => "2:exp",
    DuplicateLogin => "2:dup",
    SessionTerminatedPrematurely => "2:stp",
    Banned => "2:ban",

    // Client errors: body
    InvalidBodySemantic => "2:ibs",
    InvalidBodyValues => "2:ibv",

    // Client errors: file
    InvalidFileData => "2:ifd",
    FileNotFound => "2:nf",
    FileContested => "2:fcnt",
    FileConflict => "2:cnf",
    FileJustDeleted => "2:df",

    // Client errors: permissions
    InsufficientPermissions => "2:perm",
    UnknownClientError => "2:?",

    // Server errors
    InternalServerError => "3:*",
    UnknownServerError => "3:?",
    ServerTimeout => "3:t",
    ServerShutdown => "3:s",
    DatabaseFailure => "3:db",
    OutOfMemory => "3:mem",
    OutOfDiskSpace => "3:disk",
}

impl ResponseCode {
    pub fn class(self) -> ResponseClass {
        match self.as_str().as_bytes()[0] {
            b'0' => ResponseClass::Intermediary,
            b'1' => ResponseClass::Success,
            b'2' => ResponseClass::ClientError,
            _ => ResponseClass::ServerError,
        }
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self.class() == ResponseClass::Success
    }

    #[inline]
    pub fn is_intermediary(self) -> bool {
        self.class() == ResponseClass::Intermediary
    }

    #[inline]
    pub fn is_error(self) -> bool {
        matches!(
            self.class(),
            ResponseClass::ClientError | ResponseClass::ServerError
        )
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResponseCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResponseCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
