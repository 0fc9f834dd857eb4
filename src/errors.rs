// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Protocol-level error taxonomy.
//!
//! Every error a request pipeline can surface maps to exactly one response
//! code; the `Display` rendering doubles as the response description. Errors
//! are non-fatal to the connection unless the request header carried `finish`
//! or the class demands closure (slow streams, shutdown).

use thiserror::Error;

use crate::proto::codes::ResponseCode;

#[derive(Debug, Error)]
pub enum ProtocolError {
    // Framing / transport
    #[error("stream rate too slow, ensure a stable network connection")]
    SlowStreamRate,
    #[error("header semantics incorrect: {0}")]
    InvalidHeaderSemantic(String),
    #[error("header values incorrect: {0}")]
    InvalidHeaderValues(String),
    #[error("auth semantics incorrect: {0}")]
    InvalidAuthSemantic(String),
    #[error("body semantics incorrect: {0}")]
    InvalidBodySemantic(String),
    #[error("body values incorrect: {0}")]
    InvalidBodyValues(String),

    // Authentication / authorization
    #[error("user authentication failed: {0}")]
    UserAuthentication(String),
    #[error("auth values incorrect: {0}")]
    InvalidAuthData(String),
    #[error("session token expired, please authorize again")]
    ExpiredAuthToken,
    #[error("duplicate login for user {0}")]
    DuplicateLogin(String),
    #[error("user {0} is banned")]
    Banned(String),
    #[error("insufficient permissions: {0}")]
    InsufficientPermissions(String),

    // Operational
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("operational conflict: {0}")]
    OperationalConflict(String),
    #[error("operation contested by a concurrent request")]
    OperationContested,

    // File
    #[error("no file named {file} under {owner} found")]
    FileNotFound { owner: String, file: String },
    #[error("conflicting operation on file {file} under {owner}")]
    FileConflict { owner: String, file: String },
    #[error("file {file} under {owner} is locked by a concurrent operation")]
    FileContested { owner: String, file: String },
    #[error("file was deleted while the operation was in flight")]
    FileJustDeleted,

    // Infra
    #[error("database failure: {message}")]
    DatabaseFailure { message: String, recoverable: bool },
    #[error("internal server error")]
    Internal(anyhow::Error),
    #[error("server-side timeout")]
    ServerTimeout,
    #[error("server is shutting down")]
    ServerShutdown,
    #[error("server out of memory")]
    OutOfMemory,
    #[error("server out of disk space")]
    OutOfDisk,
}

impl ProtocolError {
    /// The response code reported for this error.
    pub fn code(&self) -> ResponseCode {
        match self {
            Self::SlowStreamRate => ResponseCode::UnacceptableSpeed,
            Self::InvalidHeaderSemantic(_) => ResponseCode::InvalidHeaderSemantic,
            Self::InvalidHeaderValues(_) => ResponseCode::InvalidHeaderValues,
            Self::InvalidAuthSemantic(_) => ResponseCode::InvalidAuthSemantic,
            Self::InvalidBodySemantic(_) => ResponseCode::InvalidBodySemantic,
            Self::InvalidBodyValues(_) => ResponseCode::InvalidBodyValues,
            Self::UserAuthentication(_) => ResponseCode::UserAuthenticationError,
            Self::InvalidAuthData(_) => ResponseCode::IncorrectAuthData,
            Self::ExpiredAuthToken => ResponseCode::ExpiredAuthToken,
            Self::DuplicateLogin(_) => ResponseCode::DuplicateLogin,
            Self::Banned(_) => ResponseCode::Banned,
            Self::InsufficientPermissions(_) => ResponseCode::InsufficientPermissions,
            Self::UnsupportedOperation(_) => ResponseCode::UnsupportedOperation,
            Self::OperationalConflict(_) => ResponseCode::OperationalConflict,
            Self::OperationContested => ResponseCode::OperationContested,
            Self::FileNotFound { .. } => ResponseCode::FileNotFound,
            Self::FileConflict { .. } => ResponseCode::FileConflict,
            Self::FileContested { .. } => ResponseCode::FileContested,
            Self::FileJustDeleted => ResponseCode::FileJustDeleted,
            Self::DatabaseFailure { .. } => ResponseCode::DatabaseFailure,
            Self::Internal(_) => ResponseCode::InternalServerError,
            Self::ServerTimeout => ResponseCode::ServerTimeout,
            Self::ServerShutdown => ResponseCode::ServerShutdown,
            Self::OutOfMemory => ResponseCode::OutOfMemory,
            Self::OutOfDisk => ResponseCode::OutOfDiskSpace,
        }
    }

    /// Whether the error must terminate the connection regardless of the
    /// request's `finish` flag.
    pub fn requires_closure(&self) -> bool {
        matches!(self, Self::SlowStreamRate | Self::ServerShutdown)
    }

    /// Translates a backend error, distinguishing row-lock contention from
    /// genuine database failures and tagging connection-level trouble as
    /// recoverable (worth a retry) for batch writers.
    pub fn from_db(err: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        if err.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) {
            return Self::OperationContested;
        }
        let recoverable = err.is_closed()
            || std::error::Error::source(&err)
                .map(|source| source.downcast_ref::<std::io::Error>().is_some())
                .unwrap_or(false);
        Self::DatabaseFailure {
            message: err.to_string(),
            recoverable,
        }
    }

    /// Whether a retry may succeed (connection-level failure or a timed-out
    /// lease, as opposed to a rejected statement).
    pub fn is_recoverable_db(&self) -> bool {
        matches!(
            self,
            Self::DatabaseFailure {
                recoverable: true,
                ..
            } | Self::ServerTimeout
        )
    }
}

impl From<tokio_postgres::Error> for ProtocolError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::from_db(err)
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
