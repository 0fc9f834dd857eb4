// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! AUTH subhandlers: REGISTER, LOGIN, REFRESH, CHANGE_PASSWORD, DELETE,
//! LOGOUT.

use std::sync::Arc;

use serde_json::json;

use crate::{
    errors::{ProtocolError, ProtocolResult},
    files::ops::delete_directory,
    proto::{
        auth::AuthComponent,
        codes::ResponseCode,
        flags::AuthFlags,
        header::RequestHeader,
        response::ResponseBody,
    },
    server::{context::AppContext, dispatch::HandlerOutput},
    session::manager::RefreshOutcome,
    utils::unix_timestamp,
};

pub async fn handle(
    ctx: &AppContext,
    header: &RequestHeader,
    auth_bytes: Option<&[u8]>,
) -> ProtocolResult<HandlerOutput> {
    let Some(auth_bytes) = auth_bytes else {
        return Err(ProtocolError::InvalidHeaderSemantic(
            "auth operations require an auth component".to_string(),
        ));
    };
    let auth = AuthComponent::from_bytes(auth_bytes, ctx.limits())?;

    let flags = header.auth_flags().ok_or_else(|| {
        ProtocolError::UnsupportedOperation(format!(
            "unknown AUTH subcategory bits {:#010b}",
            header.subcategory
        ))
    })?;

    if flags == AuthFlags::REGISTER {
        handle_registration(ctx, header, &auth).await
    } else if flags == AuthFlags::LOGIN {
        handle_login(ctx, header, &auth).await
    } else if flags == AuthFlags::REFRESH {
        handle_refresh(ctx, header, &auth).await
    } else if flags == AuthFlags::CHANGE_PASSWORD {
        handle_password_change(ctx, header, &auth).await
    } else if flags == AuthFlags::DELETE {
        handle_deletion(ctx, header, &auth).await
    } else if flags == AuthFlags::LOGOUT {
        handle_termination(ctx, header, &auth).await
    } else {
        Err(ProtocolError::UnsupportedOperation(format!(
            "unsupported AUTH subcategory {flags:?}"
        )))
    }
}

async fn handle_registration(
    ctx: &AppContext,
    header: &RequestHeader,
    auth: &AuthComponent,
) -> ProtocolResult<HandlerOutput> {
    if !auth.is_authorization() {
        return Err(ProtocolError::InvalidAuthSemantic(
            "account creation requires only identity and password".to_string(),
        ));
    }
    let password = auth.password.as_deref().unwrap_or_default();
    ctx.sessions
        .create_user(&auth.identity, password, true)
        .await?;
    Ok((
        ctx.response_header(ResponseCode::UserCreated, header.finish),
        None,
    ))
}

async fn handle_login(
    ctx: &AppContext,
    header: &RequestHeader,
    auth: &AuthComponent,
) -> ProtocolResult<HandlerOutput> {
    if !auth.is_authorization() {
        return Err(ProtocolError::InvalidAuthSemantic(
            "login requires only identity and password".to_string(),
        ));
    }
    let password = auth.password.as_deref().unwrap_or_default();
    let metadata = ctx
        .sessions
        .authorize_session(&auth.identity, password)
        .await?;

    let body =
        ResponseBody::default().insert("session", json!(metadata.to_json_map()));
    Ok((
        ctx.response_header(ResponseCode::Authenticated, header.finish),
        Some(body),
    ))
}

async fn handle_refresh(
    ctx: &AppContext,
    header: &RequestHeader,
    auth: &AuthComponent,
) -> ProtocolResult<HandlerOutput> {
    if !auth.is_authentication() {
        return Err(ProtocolError::InvalidAuthSemantic(
            "session refresh requires only identity, token and refresh digest"
                .to_string(),
        ));
    }
    let token = auth.require_token()?;
    let digest = auth.refresh_digest.as_deref().unwrap_or_default();

    match ctx.sessions.refresh_session(&auth.identity, token, digest)? {
        RefreshOutcome::Refreshed { digest, iteration } => {
            let body = ResponseBody::default()
                .insert("digest", json!(hex::encode(digest)))
                .insert("iteration", json!(iteration));
            Ok((
                ctx.response_header(ResponseCode::SessionRefreshed, header.finish),
                Some(body),
            ))
        },
        RefreshOutcome::Replay => {
            // The session is already purged; pre-empt the cache TTL on every
            // handle this identity may hold, then refuse.
            ctx.sessions.spawn_cache_termination(
                auth.identity.clone(),
                Arc::clone(&ctx.caches),
            );
            Err(ProtocolError::UserAuthentication(
                "expired digest provided, please authenticate again".to_string(),
            ))
        },
    }
}

async fn handle_password_change(
    ctx: &AppContext,
    header: &RequestHeader,
    auth: &AuthComponent,
) -> ProtocolResult<HandlerOutput> {
    let token = auth.require_token()?;
    ctx.sessions.authenticate_session(&auth.identity, token)?;

    let Some(new_password) = auth.password.as_deref() else {
        return Err(ProtocolError::InvalidAuthSemantic(
            "password change requires the new password".to_string(),
        ));
    };
    ctx.sessions
        .change_password(&auth.identity, new_password)
        .await?;

    let body = ResponseBody::default()
        .insert("notice", json!("reauthentication required"));
    Ok((
        ctx.response_header(ResponseCode::PasswordChanged, header.finish),
        Some(body),
    ))
}

async fn handle_deletion(
    ctx: &AppContext,
    header: &RequestHeader,
    auth: &AuthComponent,
) -> ProtocolResult<HandlerOutput> {
    let token = auth.require_token()?;
    ctx.sessions.authenticate_session(&auth.identity, token)?;

    let Some(password) = auth.password.as_deref() else {
        return Err(ProtocolError::InvalidAuthSemantic(
            "account deletion requires the password alongside the token".to_string(),
        ));
    };
    ctx.sessions
        .delete_user(&auth.identity, password, Arc::clone(&ctx.caches))
        .await?;
    ctx.storage.forget_user(&auth.identity).await;

    let deleted = tokio::time::timeout(
        ctx.config.file.transfer_timeout,
        delete_directory(&ctx.config.file.root_directory, &auth.identity),
    )
    .await
    .map_err(|_| ProtocolError::ServerTimeout)??;

    let body = ResponseBody::default()
        .insert("deleted_count", json!(deleted.len()))
        .insert("deleted_files", json!(deleted));
    Ok((
        ctx.response_header(ResponseCode::UserDeleted, header.finish),
        Some(body),
    ))
}

async fn handle_termination(
    ctx: &AppContext,
    header: &RequestHeader,
    auth: &AuthComponent,
) -> ProtocolResult<HandlerOutput> {
    if !auth.is_authentication() {
        return Err(ProtocolError::InvalidAuthSemantic(
            "logout requires only identity, token and refresh digest".to_string(),
        ));
    }
    let token = auth.require_token()?;
    let terminated = ctx.sessions.terminate_session(&auth.identity, token)?;

    let now = unix_timestamp();
    let body = ResponseBody::default()
        .insert("time_of_logout", json!(now))
        .insert("user", json!(auth.identity))
        .insert("session_iterations", json!(terminated.iteration()))
        .insert(
            "session_lifespan",
            json!(terminated.lifespan().as_secs_f64()),
        )
        .insert(
            "forgone_validity",
            json!(terminated.valid_until() - now),
        );
    Ok((
        ctx.response_header(ResponseCode::SessionTerminated, header.finish),
        Some(body),
    ))
}
