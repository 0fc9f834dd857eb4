// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-lifetime singletons, constructed once at startup and passed
//! explicitly into every handler. No hidden global lookup.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    cfg::config::ServerConfig,
    db::pool::ConnectionPoolManager,
    files::{caches::FileCaches, storage::StorageCache},
    logsink::ActivityLogger,
    proto::{ProtocolLimits, codes::ResponseCode, response::ResponseHeader},
    session::manager::SessionManager,
};

pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub pool: Arc<ConnectionPoolManager>,
    pub sessions: Arc<SessionManager>,
    pub caches: Arc<FileCaches>,
    pub storage: Arc<StorageCache>,
    pub logger: ActivityLogger,
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn limits(&self) -> &ProtocolLimits {
        &self.config.protocol
    }

    /// Response header stamped with this server's identity.
    pub fn response_header(&self, code: ResponseCode, ended: bool) -> ResponseHeader {
        ResponseHeader::new(
            self.config.version.clone(),
            code,
            self.config.network.host,
            self.config.network.port,
        )
        .with_ended_connection(ended)
    }
}
