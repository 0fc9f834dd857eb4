// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! FILE_OP subhandlers: CREATE, READ, WRITE, OVERWRITE, APPEND, DELETE.

use chrono::Utc;
use serde_json::json;

use crate::{
    db::pool::ConnectionPriority,
    errors::{ProtocolError, ProtocolResult},
    files::ops::{self, AmendMode},
    perms::{engine, roles::Capability},
    proto::{
        auth::AuthComponent,
        body::{FileBody, RequestBody},
        codes::ResponseCode,
        flags::FileFlags,
        header::RequestHeader,
        response::ResponseBody,
    },
    server::{context::AppContext, dispatch::HandlerOutput},
};

pub async fn handle(
    ctx: &AppContext,
    header: &RequestHeader,
    auth_bytes: Option<&[u8]>,
    body_bytes: Option<&[u8]>,
) -> ProtocolResult<HandlerOutput> {
    let (Some(auth_bytes), Some(body_bytes)) = (auth_bytes, body_bytes) else {
        return Err(ProtocolError::InvalidHeaderSemantic(
            "file operations require both an auth and a body component".to_string(),
        ));
    };
    let auth = AuthComponent::from_bytes(auth_bytes, ctx.limits())?;
    if !auth.is_authentication() {
        return Err(ProtocolError::InvalidAuthSemantic(
            "file operations require identity, token and refresh digest".to_string(),
        ));
    }
    ctx.sessions
        .authenticate_session(&auth.identity, auth.require_token()?)?;

    let flags = header.file_flags().ok_or_else(|| {
        ProtocolError::UnsupportedOperation(format!(
            "unknown FILE_OP subcategory bits {:#010b}",
            header.subcategory
        ))
    })?;
    let RequestBody::File(body) =
        RequestBody::parse(header.category, body_bytes, ctx.limits())?
    else {
        return Err(ProtocolError::InvalidBodySemantic(
            "expected a file body".to_string(),
        ));
    };

    let identity = auth.identity.as_str();
    if flags == FileFlags::CREATE {
        handle_creation(ctx, header, identity, &body).await
    } else if flags == FileFlags::READ {
        handle_read(ctx, header, identity, &body).await
    } else if flags == FileFlags::WRITE {
        handle_amendment(ctx, header, identity, &body, AmendMode::Write).await
    } else if flags == FileFlags::OVERWRITE {
        handle_amendment(ctx, header, identity, &body, AmendMode::Overwrite).await
    } else if flags == FileFlags::APPEND {
        handle_amendment(ctx, header, identity, &body, AmendMode::Append).await
    } else if flags == FileFlags::DELETE {
        handle_deletion(ctx, header, identity, &body).await
    } else {
        Err(ProtocolError::UnsupportedOperation(format!(
            "unsupported FILE_OP subcategory {flags:?}"
        )))
    }
}

async fn handle_creation(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &FileBody,
) -> ProtocolResult<HandlerOutput> {
    // Files are only ever created inside one's own directory.
    if body.subject_file_owner != identity {
        return Err(ProtocolError::InsufficientPermissions(format!(
            "user {identity} cannot create files under {}",
            body.subject_file_owner
        )));
    }

    let storage = ctx.storage.get_storage_data(identity).await?;
    if storage.filecount >= ctx.config.file.user_max_files as i64 {
        return Err(ProtocolError::OperationalConflict(format!(
            "file limit of {} reached",
            ctx.config.file.user_max_files
        )));
    }

    let (rel_path, created_at) = ops::create_file(
        &ctx.config.file.root_directory,
        identity,
        &body.subject_file,
    )
    .await?;

    // Register the file row and the owner's permission row together.
    let proxy = ctx
        .pool
        .request_connection(ConnectionPriority::Mid, None)
        .await?;
    let result = async {
        proxy.begin().await?;
        proxy
            .execute(
                "INSERT INTO files (owner, filename, file_size, public) \
                 VALUES ($1, $2, 0, FALSE);",
                &[&identity, &body.subject_file],
            )
            .await?;
        proxy
            .execute(
                "INSERT INTO file_permissions \
                 (file_owner, filename, grantee, role, granted_by, granted_at) \
                 VALUES ($1, $2, $3, 'owner', $4, $5);",
                &[&identity, &body.subject_file, &identity, &identity, &Utc::now()],
            )
            .await?;
        proxy.commit().await
    }
    .await;
    if result.is_err() {
        let _ = proxy.rollback().await;
        // Keep filesystem and database consistent on registration failure.
        let _ = ops::delete_file(
            &ctx.config.file.root_directory,
            identity,
            &body.subject_file,
            &ctx.caches,
        )
        .await;
    }
    ctx.pool.reclaim_connection(proxy);
    result?;

    ctx.storage
        .update_file_count(identity, &body.subject_file, 1)
        .await?;

    let response_body = ResponseBody::default()
        .insert("filepath", json!(rel_path))
        .insert("created_at", json!(created_at));
    Ok((
        ctx.response_header(ResponseCode::FileCreated, header.finish),
        Some(response_body),
    ))
}

async fn handle_read(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &FileBody,
) -> ProtocolResult<HandlerOutput> {
    let owner = body.subject_file_owner.as_str();
    let file = body.subject_file.as_str();

    let proxy = ctx
        .pool
        .request_connection(ConnectionPriority::Mid, None)
        .await?;
    let allowed = engine::check_read_allowed(&proxy, owner, file, identity).await;
    ctx.pool.reclaim_connection(proxy);
    if !allowed? {
        return Err(ProtocolError::InsufficientPermissions(format!(
            "user {identity} has no read permission on {file} owned by {owner}"
        )));
    }

    let outcome = ops::read_file(
        &ctx.config.file.root_directory,
        owner,
        file,
        &ctx.caches,
        identity,
        body.cursor_position,
        body.chunk_size,
        body.wants_keepalive(),
        body.wants_purge() || header.finish,
    )
    .await?;

    let code = if outcome.handle_cached && !outcome.eof_reached {
        ResponseCode::PartialRead
    } else {
        ResponseCode::Read
    };
    let response_body = ResponseBody {
        contents: {
            let mut map = serde_json::Map::new();
            map.insert("read".to_string(), json!(hex::encode(&outcome.data)));
            map
        },
        chunk_number: None,
        operation_ended: Some(outcome.eof_reached),
        cursor_position: Some(outcome.cursor),
        keepalive_accepted: Some(outcome.handle_cached),
    };
    Ok((
        ctx.response_header(code, header.finish),
        Some(response_body),
    ))
}

async fn handle_amendment(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &FileBody,
    mode: AmendMode,
) -> ProtocolResult<HandlerOutput> {
    let owner = body.subject_file_owner.as_str();
    let file = body.subject_file.as_str();
    let Some(data) = body.write_data.as_deref() else {
        return Err(ProtocolError::InvalidBodySemantic(
            "amendment requires write_data".to_string(),
        ));
    };

    let proxy = ctx
        .pool
        .request_connection(ConnectionPriority::Mid, None)
        .await?;
    let allowed =
        engine::check_file_permission(&proxy, owner, file, identity, Capability::Write, None)
            .await;
    ctx.pool.reclaim_connection(proxy);
    if !allowed? {
        return Err(ProtocolError::InsufficientPermissions(format!(
            "user {identity} has no write permission on {file} owned by {owner}"
        )));
    }

    let rel_path = body.relative_path();
    let checksum = ctx
        .caches
        .locks
        .acquire(
            &rel_path,
            identity,
            owner,
            file,
            ctx.config.file.contention_timeout,
        )
        .await?;

    let evict = body.evict_after() || header.finish;
    let outcome = ops::amend_file(
        &ctx.config.file.root_directory,
        owner,
        file,
        &ctx.caches,
        identity,
        mode,
        data,
        body.cursor_position,
        !evict,
        body.wants_purge(),
    )
    .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            ctx.caches.locks.release(&rel_path, checksum);
            return Err(err);
        },
    };

    if outcome.size_delta != 0 {
        ctx.storage
            .update_file_size(owner, file, outcome.size_delta)
            .await?;
    }

    // The single-writer lock lives exactly as long as the cached handle.
    if !outcome.handle_cached {
        ctx.caches.locks.release(&rel_path, checksum);
    }

    let code = if outcome.handle_cached && !body.end_operation {
        ResponseCode::PartialAmend
    } else {
        ResponseCode::Amended
    };
    let response_body = ResponseBody {
        contents: serde_json::Map::new(),
        chunk_number: None,
        operation_ended: Some(body.end_operation),
        cursor_position: Some(outcome.cursor),
        keepalive_accepted: Some(outcome.handle_cached),
    };
    Ok((
        ctx.response_header(code, header.finish),
        Some(response_body),
    ))
}

async fn handle_deletion(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &FileBody,
) -> ProtocolResult<HandlerOutput> {
    // Owner-only; the deletion request outranks any amendment lock.
    if body.subject_file_owner != identity {
        return Err(ProtocolError::InsufficientPermissions(format!(
            "only the owner may delete {} owned by {}",
            body.subject_file, body.subject_file_owner
        )));
    }

    let rel_path = body.relative_path();
    ctx.caches.locks.set_deleted_barrier(&rel_path);

    let size = ops::delete_file(
        &ctx.config.file.root_directory,
        identity,
        &body.subject_file,
        &ctx.caches,
    )
    .await?;

    // Cascade: drop the file row and every grant, reporting the revoked set.
    let proxy = ctx
        .pool
        .request_connection(ConnectionPriority::Mid, None)
        .await?;
    let result: ProtocolResult<Vec<tokio_postgres::Row>> = async {
        proxy.begin().await?;
        let revoked = proxy
            .query(
                "DELETE FROM file_permissions \
                 WHERE file_owner = $1 AND filename = $2 AND role <> 'owner' \
                 RETURNING grantee, role;",
                &[&identity, &body.subject_file],
            )
            .await?;
        proxy
            .execute(
                "DELETE FROM file_permissions \
                 WHERE file_owner = $1 AND filename = $2;",
                &[&identity, &body.subject_file],
            )
            .await?;
        proxy
            .execute(
                "DELETE FROM files WHERE owner = $1 AND filename = $2;",
                &[&identity, &body.subject_file],
            )
            .await?;
        proxy.commit().await?;
        Ok(revoked)
    }
    .await;
    if result.is_err() {
        let _ = proxy.rollback().await;
    }
    ctx.pool.reclaim_connection(proxy);
    let revoked = result?;

    ctx.storage
        .reflect_removed_file(identity, &body.subject_file, size)
        .await?;

    let revoked_grantees: Vec<serde_json::Value> = revoked
        .into_iter()
        .map(|row| {
            json!({
                "grantee": row.get::<_, String>(0),
                "role": row.get::<_, String>(1),
            })
        })
        .collect();
    let response_body =
        ResponseBody::default().insert("revoked_grantees", json!(revoked_grantees));
    Ok((
        ctx.response_header(ResponseCode::FileDeleted, header.finish),
        Some(response_body),
    ))
}
