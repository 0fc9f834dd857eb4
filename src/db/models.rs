// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Row models for the relational backend.

use std::net::IpAddr;

use chrono::{DateTime, Utc};

/// Longest detail string persisted per activity log row.
pub const LOG_DETAILS_MAX: usize = 512;

/// Severity column of `activity_logs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info = 1,
    NonCritical = 2,
    Error = 3,
    Critical = 4,
}

impl Severity {
    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

/// Subsystem that authored a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAuthor {
    SessionManager,
    ConnectionPool,
    FileHandler,
    SocketHandler,
    PermissionHandler,
    StreamParser,
    Bootup,
    Admin,
    Cron,
    ExceptionFallback,
}

impl LogAuthor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionManager => "session_manager",
            Self::ConnectionPool => "connection_pool",
            Self::FileHandler => "file_handler",
            Self::SocketHandler => "socket_handler",
            Self::PermissionHandler => "permission_handler",
            Self::StreamParser => "stream_parser",
            Self::Bootup => "bootup",
            Self::Admin => "admin",
            Self::Cron => "cron",
            Self::ExceptionFallback => "exception_fallback",
        }
    }
}

/// Log classification column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    User,
    Database,
    Session,
    Request,
    Network,
    Internal,
    Permission,
    Audit,
    Unknown,
}

impl LogCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Database => "database",
            Self::Session => "session",
            Self::Request => "request",
            Self::Network => "network",
            Self::Internal => "internal",
            Self::Permission => "permission",
            Self::Audit => "audit",
            Self::Unknown => "unknown",
        }
    }
}

/// One row of `activity_logs`.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    pub occurrence_time: DateTime<Utc>,
    pub severity: Severity,
    pub logged_by: LogAuthor,
    pub log_category: LogCategory,
    pub log_details: Option<String>,
    pub user_concerned: Option<String>,
    pub host_concerned: Option<IpAddr>,
}

impl ActivityLog {
    pub fn new(
        severity: Severity,
        logged_by: LogAuthor,
        log_category: LogCategory,
        details: impl Into<String>,
    ) -> Self {
        let mut details: String = details.into();
        details.truncate(LOG_DETAILS_MAX);
        Self {
            occurrence_time: Utc::now(),
            severity,
            logged_by,
            log_category,
            log_details: Some(details),
            user_concerned: None,
            host_concerned: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user_concerned = Some(user.into());
        self
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host_concerned = Some(host);
        self
    }
}
