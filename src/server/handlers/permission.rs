// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! PERMISSION subhandlers: GRANT, REVOKE, HIDE, PUBLICISE, TRANSFER.

use chrono::Utc;
use serde_json::json;

use crate::{
    errors::{ProtocolError, ProtocolResult},
    perms::engine,
    proto::{
        auth::AuthComponent,
        body::{PermissionBody, RequestBody},
        codes::ResponseCode,
        flags::PermissionFlags,
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
            "permission operations require both an auth and a body component"
                .to_string(),
        ));
    };
    let auth = AuthComponent::from_bytes(auth_bytes, ctx.limits())?;
    if !auth.is_authentication() {
        return Err(ProtocolError::InvalidAuthSemantic(
            "permission operations require identity, token and refresh digest"
                .to_string(),
        ));
    }
    ctx.sessions
        .authenticate_session(&auth.identity, auth.require_token()?)?;

    let flags = header.permission_flags().ok_or_else(|| {
        ProtocolError::UnsupportedOperation(format!(
            "unknown PERMISSION subcategory bits {:#010b}",
            header.subcategory
        ))
    })?;
    let RequestBody::Permission(body) =
        RequestBody::parse(header.category, body_bytes, ctx.limits())?
    else {
        return Err(ProtocolError::InvalidBodySemantic(
            "expected a permission body".to_string(),
        ));
    };

    let identity = auth.identity.as_str();
    let action = flags.action();
    if action == PermissionFlags::GRANT {
        handle_grant(ctx, header, identity, &body, flags).await
    } else if action == PermissionFlags::REVOKE {
        handle_revoke(ctx, header, identity, &body, flags).await
    } else if action == PermissionFlags::PUBLICISE {
        handle_publicise(ctx, header, identity, &body).await
    } else if action == PermissionFlags::HIDE {
        handle_hide(ctx, header, identity, &body).await
    } else if action == PermissionFlags::TRANSFER {
        handle_transfer(ctx, header, identity, &body).await
    } else {
        Err(ProtocolError::UnsupportedOperation(format!(
            "unsupported PERMISSION subcategory {flags:?}"
        )))
    }
}

async fn handle_grant(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &PermissionBody,
    flags: PermissionFlags,
) -> ProtocolResult<HandlerOutput> {
    let role = engine::grant_permission(&ctx.pool, identity, body, flags).await?;
    let response_body = ResponseBody::default()
        .insert("granted_role", json!(role.as_str()))
        .insert("grantee", json!(body.subject_user));
    Ok((
        ctx.response_header(ResponseCode::Granted, header.finish),
        Some(response_body),
    ))
}

async fn handle_revoke(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &PermissionBody,
    flags: PermissionFlags,
) -> ProtocolResult<HandlerOutput> {
    let revoked = engine::revoke_permission(&ctx.pool, identity, body, flags).await?;
    let response_body =
        ResponseBody::default().insert("revoked_role_data", json!(revoked));
    Ok((
        ctx.response_header(ResponseCode::Revoked, header.finish),
        Some(response_body),
    ))
}

async fn handle_publicise(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &PermissionBody,
) -> ProtocolResult<HandlerOutput> {
    engine::publicise_file(&ctx.pool, identity, body).await?;
    Ok((
        ctx.response_header(ResponseCode::FilePublicised, header.finish),
        None,
    ))
}

async fn handle_hide(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &PermissionBody,
) -> ProtocolResult<HandlerOutput> {
    let revoked = engine::hide_file(&ctx.pool, identity, body).await?;
    let response_body =
        ResponseBody::default().insert("revoked_grantee_info", json!(revoked));
    Ok((
        ctx.response_header(ResponseCode::FileHidden, header.finish),
        Some(response_body),
    ))
}

async fn handle_transfer(
    ctx: &AppContext,
    header: &RequestHeader,
    identity: &str,
    body: &PermissionBody,
) -> ProtocolResult<HandlerOutput> {
    let outcome = engine::transfer_ownership(
        &ctx.pool,
        &ctx.config,
        &ctx.caches,
        identity,
        body,
    )
    .await?;

    // Re-book the bytes under the new owner.
    let new_owner = body.subject_user.as_deref().unwrap_or_default();
    ctx.storage
        .reflect_removed_file(identity, &body.subject_file, outcome.file_size)
        .await?;
    ctx.storage
        .update_file_count(new_owner, &outcome.new_filename, 1)
        .await?;
    ctx.storage
        .update_file_size(new_owner, &outcome.new_filename, outcome.file_size)
        .await?;

    let response_body = ResponseBody::default()
        .insert("old_filepath", json!(outcome.old_path))
        .insert("new_filepath", json!(outcome.new_path))
        .insert("transfer_datetime", json!(Utc::now().to_rfc3339()));
    Ok((
        ctx.response_header(ResponseCode::OwnershipTransferred, header.finish),
        Some(response_body),
    ))
}
