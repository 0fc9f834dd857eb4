// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! INFO subhandlers: heartbeat echo and metadata queries, each with an
//! optional VERBOSE modifier. Heartbeat and SSL-credential queries are
//! unauthenticated; everything else requires a live session.

use serde_json::json;

use crate::{
    db::pool::ConnectionPriority,
    errors::{ProtocolError, ProtocolResult},
    proto::{
        auth::AuthComponent,
        body::{InfoBody, RequestBody},
        codes::ResponseCode,
        flags::InfoFlags,
        header::RequestHeader,
        response::ResponseBody,
    },
    server::{context::AppContext, dispatch::HandlerOutput},
    tlscreds::rollover::load_ledger,
};

fn is_unauthenticated(op: InfoFlags) -> bool {
    op == InfoFlags::HEARTBEAT || op == InfoFlags::SSL_CREDENTIALS
}

pub async fn handle(
    ctx: &AppContext,
    header: &RequestHeader,
    auth_bytes: Option<&[u8]>,
    body_bytes: Option<&[u8]>,
) -> ProtocolResult<HandlerOutput> {
    let flags = header.info_flags().ok_or_else(|| {
        ProtocolError::UnsupportedOperation(format!(
            "unknown INFO subcategory bits {:#010b}",
            header.subcategory
        ))
    })?;
    let operation = flags.operation();
    if operation.bits().count_ones() != 1 {
        return Err(ProtocolError::UnsupportedOperation(
            "INFO requests name exactly one query".to_string(),
        ));
    }
    let verbose = flags.verbose();

    let mut identity: Option<String> = None;
    if !is_unauthenticated(operation) {
        let Some(auth_bytes) = auth_bytes else {
            return Err(ProtocolError::InvalidHeaderSemantic(format!(
                "INFO operation {operation:?} requires authentication"
            )));
        };
        let auth = AuthComponent::from_bytes(auth_bytes, ctx.limits())?;
        if !auth.is_authentication() {
            return Err(ProtocolError::InvalidAuthSemantic(
                "INFO operations require identity, token and refresh digest"
                    .to_string(),
            ));
        }
        ctx.sessions
            .authenticate_session(&auth.identity, auth.require_token()?)?;
        identity = Some(auth.identity);
    }

    let body = match body_bytes {
        Some(bytes) => {
            let RequestBody::Info(body) =
                RequestBody::parse(header.category, bytes, ctx.limits())?
            else {
                return Err(ProtocolError::InvalidBodySemantic(
                    "expected an info body".to_string(),
                ));
            };
            Some(body)
        },
        None => None,
    };

    if operation == InfoFlags::HEARTBEAT {
        return Ok((
            ctx.response_header(ResponseCode::Heartbeat, header.finish),
            None,
        ));
    }
    if operation == InfoFlags::SSL_CREDENTIALS {
        return handle_ssl_query(ctx, header, verbose).await;
    }

    let identity = identity.unwrap_or_default();
    let body = body.ok_or_else(|| {
        ProtocolError::InvalidHeaderSemantic(
            "this INFO operation requires a body naming the resource".to_string(),
        )
    })?;

    if operation == InfoFlags::PERMISSION_METADATA {
        handle_permission_query(ctx, header, &identity, &body, verbose).await
    } else if operation == InfoFlags::FILE_METADATA {
        handle_filedata_query(ctx, header, &identity, &body, verbose).await
    } else if operation == InfoFlags::USER_METADATA {
        handle_user_query(ctx, header, &identity, &body, verbose).await
    } else if operation == InfoFlags::STORAGE_USAGE {
        handle_storage_query(ctx, header, &identity, &body).await
    } else {
        Err(ProtocolError::UnsupportedOperation(format!(
            "unsupported INFO subcategory {flags:?}"
        )))
    }
}

fn require_owner_pair(body: &InfoBody) -> ProtocolResult<(&str, &str)> {
    let owner = body.resource_owner.as_deref().ok_or_else(|| {
        ProtocolError::InvalidBodyValues(
            "query requires resource_owner alongside the filename".to_string(),
        )
    })?;
    Ok((owner, body.resource.as_str()))
}

async fn handle_permission_query(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &InfoBody,
    verbose: bool,
) -> ProtocolResult<HandlerOutput> {
    let (owner, filename) = require_owner_pair(body)?;

    let proxy = ctx
        .pool
        .request_connection(ConnectionPriority::Mid, None)
        .await?;
    let result = async {
        let allowed =
            crate::perms::engine::check_read_allowed(&proxy, owner, filename, identity)
                .await?;
        if !allowed {
            return Err(ProtocolError::InsufficientPermissions(format!(
                "user {identity} cannot inspect permissions of {filename}"
            )));
        }
        proxy
            .query(
                "SELECT grantee, role, granted_by, granted_at, granted_until \
                 FROM file_permissions \
                 WHERE file_owner = $1 AND filename = $2;",
                &[&owner, &filename],
            )
            .await
    }
    .await;
    ctx.pool.reclaim_connection(proxy);
    let rows = result?;

    let grants: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|row| {
            let mut grant = json!({
                "grantee": row.get::<_, String>(0),
                "role": row.get::<_, String>(1),
            });
            if verbose {
                grant["granted_by"] = json!(row.get::<_, String>(2));
                grant["granted_at"] =
                    json!(row.get::<_, chrono::DateTime<chrono::Utc>>(3).to_rfc3339());
                grant["granted_until"] = json!(
                    row.get::<_, Option<chrono::DateTime<chrono::Utc>>>(4)
                        .map(|t| t.to_rfc3339())
                );
            }
            grant
        })
        .collect();

    let response_body = ResponseBody::default().insert("permissions", json!(grants));
    Ok((
        ctx.response_header(ResponseCode::Heartbeat, header.finish),
        Some(response_body),
    ))
}

async fn handle_filedata_query(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &InfoBody,
    verbose: bool,
) -> ProtocolResult<HandlerOutput> {
    let (owner, filename) = require_owner_pair(body)?;

    let proxy = ctx
        .pool
        .request_connection(ConnectionPriority::Mid, None)
        .await?;
    let result = async {
        let allowed =
            crate::perms::engine::check_read_allowed(&proxy, owner, filename, identity)
                .await?;
        if !allowed {
            return Err(ProtocolError::InsufficientPermissions(format!(
                "user {identity} cannot inspect metadata of {filename}"
            )));
        }
        proxy
            .query_opt(
                "SELECT owner, filename, file_size, public FROM files \
                 WHERE owner = $1 AND filename = $2;",
                &[&owner, &filename],
            )
            .await
    }
    .await;
    ctx.pool.reclaim_connection(proxy);

    let Some(row) = result? else {
        return Err(ProtocolError::FileNotFound {
            owner: owner.to_string(),
            file: filename.to_string(),
        });
    };

    let mut contents = serde_json::Map::new();
    contents.insert("owner".to_string(), json!(row.get::<_, String>(0)));
    contents.insert("filename".to_string(), json!(row.get::<_, String>(1)));
    contents.insert("file_size".to_string(), json!(row.get::<_, i64>(2)));
    if verbose {
        contents.insert("public".to_string(), json!(row.get::<_, bool>(3)));
    }

    let response_body = ResponseBody::with_contents(contents);
    Ok((
        ctx.response_header(ResponseCode::Heartbeat, header.finish),
        Some(response_body),
    ))
}

async fn handle_user_query(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &InfoBody,
    verbose: bool,
) -> ProtocolResult<HandlerOutput> {
    // Account metadata is visible only to the account itself.
    if body.resource != identity {
        return Err(ProtocolError::InsufficientPermissions(
            "user metadata is restricted to the account owner".to_string(),
        ));
    }

    let proxy = ctx
        .pool
        .request_connection(ConnectionPriority::Mid, None)
        .await?;
    let row = proxy
        .query_opt(
            "SELECT file_count, storage_used FROM users WHERE username = $1;",
            &[&identity],
        )
        .await;
    ctx.pool.reclaim_connection(proxy);

    let Some(row) = row? else {
        return Err(ProtocolError::UserAuthentication(format!(
            "user {identity} not found"
        )));
    };

    let mut contents = serde_json::Map::new();
    contents.insert("username".to_string(), json!(identity));
    contents.insert("file_count".to_string(), json!(row.get::<_, i64>(0)));
    contents.insert("storage_used".to_string(), json!(row.get::<_, i64>(1)));
    if verbose {
        contents.insert(
            "active_sessions".to_string(),
            json!(ctx.sessions.session_count()),
        );
    }

    Ok((
        ctx.response_header(ResponseCode::Heartbeat, header.finish),
        Some(ResponseBody::with_contents(contents)),
    ))
}

async fn handle_storage_query(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &InfoBody,
) -> ProtocolResult<HandlerOutput> {
    if body.resource != identity {
        return Err(ProtocolError::InsufficientPermissions(
            "storage usage is restricted to the account owner".to_string(),
        ));
    }

    // The cache view includes deltas not yet flushed to the backend.
    let data = ctx.storage.get_storage_data(identity).await?;
    let response_body = ResponseBody::default()
        .insert("filecount", json!(data.filecount))
        .insert("storage_used", json!(data.storage_used));
    Ok((
        ctx.response_header(ResponseCode::Heartbeat, header.finish),
        Some(response_body),
    ))
}

async fn handle_ssl_query(
    ctx: &AppContext,
    header: &RequestHeader,
    verbose: bool,
) -> ProtocolResult<HandlerOutput> {
    let cert_path = ctx.config.tls.certificate_path();
    let pem = tokio::fs::read_to_string(&cert_path)
        .await
        .map_err(|e| ProtocolError::Internal(anyhow::anyhow!(e)))?;

    let mut response_body = ResponseBody::default().insert("certificate_pem", json!(pem));
    if verbose {
        let ledger = load_ledger(&ctx.config.tls.rollover_path())
            .map_err(ProtocolError::Internal)?;
        response_body = response_body.insert("rollover_tokens", json!(ledger));
    }
    Ok((
        ctx.response_header(ResponseCode::Heartbeat, header.finish),
        Some(response_body),
    ))
}
