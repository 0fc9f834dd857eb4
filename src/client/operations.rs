// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! High-level client operations: session lifecycle, chunked file transfer,
//! permission management and metadata queries.

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::{
    client::connection::{ClientConnection, expect_codes},
    perms::roles::Role,
    proto::{
        auth::AuthComponent,
        body::{FileBody, InfoBody, PermissionBody},
        codes::ResponseCode,
        flags::{
            AuthFlags, CursorFlags, FileFlags, InfoFlags, PermissionFlags,
            RequestCategory,
        },
        response::ResponseBody,
    },
};

/// Client-side view of an authorized session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub identity: String,
    pub token: Vec<u8>,
    pub refresh_digest: Vec<u8>,
    pub iteration: u32,
    pub lifespan: f64,
    pub valid_until: f64,
}

impl SessionHandle {
    pub fn auth_component(&self) -> AuthComponent {
        AuthComponent::authentication(
            self.identity.clone(),
            self.token.clone(),
            self.refresh_digest.clone(),
        )
    }
}

fn body_field<'a>(body: &'a ResponseBody, key: &str) -> Result<&'a Value> {
    body.contents
        .get(key)
        .with_context(|| format!("response body missing claim {key:?}"))
}

fn hex_field(value: &Value) -> Result<Vec<u8>> {
    let raw = value.as_str().context("expected a hex string")?;
    hex::decode(raw).context("claim is not valid hex")
}

/// REGISTER: create a new account.
pub async fn register(
    conn: &ClientConnection,
    username: &str,
    password: &str,
) -> Result<()> {
    let mut header = conn.make_header(
        RequestCategory::AUTH,
        AuthFlags::REGISTER.bits(),
        false,
    );
    let auth = AuthComponent::authorization(username, password);
    let (response, _) = conn
        .request::<FileBody>(&mut header, Some(&auth), None)
        .await?;
    expect_codes(&response, &[ResponseCode::UserCreated])
}

/// LOGIN: authorize and build a session handle from the response.
pub async fn login(
    conn: &ClientConnection,
    username: &str,
    password: &str,
) -> Result<SessionHandle> {
    let mut header =
        conn.make_header(RequestCategory::AUTH, AuthFlags::LOGIN.bits(), false);
    let auth = AuthComponent::authorization(username, password);
    let (response, body) = conn
        .request::<FileBody>(&mut header, Some(&auth), None)
        .await?;
    expect_codes(&response, &[ResponseCode::Authenticated])?;

    let body = body.context("login response carried no body")?;
    let session = body_field(&body, "session")?;
    Ok(SessionHandle {
        identity: username.to_string(),
        token: hex_field(session.get("token").context("missing token")?)?,
        refresh_digest: hex_field(
            session.get("refresh_digest").context("missing digest")?,
        )?,
        iteration: session
            .get("iteration")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32,
        lifespan: session
            .get("lifespan")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        valid_until: session
            .get("valid_until")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
    })
}

/// REFRESH: rotate the digest in place; the token never changes here.
pub async fn refresh(conn: &ClientConnection, session: &mut SessionHandle) -> Result<()> {
    let mut header =
        conn.make_header(RequestCategory::AUTH, AuthFlags::REFRESH.bits(), false);
    let auth = session.auth_component();
    let (response, body) = conn
        .request::<FileBody>(&mut header, Some(&auth), None)
        .await?;
    expect_codes(&response, &[ResponseCode::SessionRefreshed])?;

    let body = body.context("refresh response carried no body")?;
    session.refresh_digest = hex_field(body_field(&body, "digest")?)?;
    session.iteration = body_field(&body, "iteration")?
        .as_u64()
        .context("iteration is not an integer")? as u32;
    Ok(())
}

/// LOGOUT: terminate the session.
pub async fn logout(
    conn: &ClientConnection,
    session: &SessionHandle,
    end_connection: bool,
) -> Result<()> {
    let mut header = conn.make_header(
        RequestCategory::AUTH,
        AuthFlags::LOGOUT.bits(),
        end_connection,
    );
    let auth = session.auth_component();
    let (response, _) = conn
        .request::<FileBody>(&mut header, Some(&auth), None)
        .await?;
    expect_codes(&response, &[ResponseCode::SessionTerminated])
}

/// CHANGE_PASSWORD: token-authenticated, carries the new password.
pub async fn change_password(
    conn: &ClientConnection,
    session: &SessionHandle,
    new_password: &str,
) -> Result<()> {
    let mut header = conn.make_header(
        RequestCategory::AUTH,
        AuthFlags::CHANGE_PASSWORD.bits(),
        false,
    );
    let mut auth = session.auth_component();
    auth.refresh_digest = None;
    auth.password = Some(new_password.to_string());
    let (response, _) = conn
        .request::<FileBody>(&mut header, Some(&auth), None)
        .await?;
    expect_codes(&response, &[ResponseCode::PasswordChanged])
}

/// DELETE: remove the account; needs both the live token and the password.
pub async fn delete_account(
    conn: &ClientConnection,
    session: &SessionHandle,
    password: &str,
) -> Result<()> {
    let mut header =
        conn.make_header(RequestCategory::AUTH, AuthFlags::DELETE.bits(), false);
    let mut auth = session.auth_component();
    auth.refresh_digest = None;
    auth.password = Some(password.to_string());
    let (response, _) = conn
        .request::<FileBody>(&mut header, Some(&auth), None)
        .await?;
    expect_codes(&response, &[ResponseCode::UserDeleted])
}

fn file_body(owner: &str, file: &str) -> FileBody {
    FileBody {
        subject_file: file.to_string(),
        subject_file_owner: owner.to_string(),
        ..FileBody::default()
    }
}

/// CREATE an empty remote file in the caller's own directory.
pub async fn create_file(
    conn: &ClientConnection,
    session: &SessionHandle,
    filename: &str,
) -> Result<()> {
    let mut header = conn.make_header(
        RequestCategory::FILE_OP,
        FileFlags::CREATE.bits(),
        false,
    );
    let auth = session.auth_component();
    let body = file_body(&session.identity, filename);
    let (response, _) = conn.request(&mut header, Some(&auth), Some(&body)).await?;
    expect_codes(&response, &[ResponseCode::FileCreated])
}

/// DELETE a remote file (owner only).
pub async fn delete_file(
    conn: &ClientConnection,
    session: &SessionHandle,
    filename: &str,
) -> Result<()> {
    let mut header = conn.make_header(
        RequestCategory::FILE_OP,
        FileFlags::DELETE.bits(),
        false,
    );
    let auth = session.auth_component();
    let body = file_body(&session.identity, filename);
    let (response, _) = conn.request(&mut header, Some(&auth), Some(&body)).await?;
    expect_codes(&response, &[ResponseCode::FileDeleted])
}

/// READ a remote file from `position`, optionally bounded by `limit` bytes.
/// Chunks transparently, holding a server-side cursor between chunks.
pub async fn read_file(
    conn: &ClientConnection,
    session: &SessionHandle,
    owner: &str,
    filename: &str,
    position: u64,
    limit: Option<u64>,
) -> Result<Vec<u8>> {
    let chunk_size = conn.cfg.chunk_size.min(conn.cfg.limits.chunk_max_size);
    let auth = session.auth_component();
    let mut collected: Vec<u8> = Vec::new();
    let mut cursor = position;

    loop {
        let remaining = limit.map(|l| l.saturating_sub(collected.len() as u64));
        if remaining == Some(0) {
            break;
        }
        let request_chunk = remaining
            .map(|r| (r as usize).min(chunk_size))
            .unwrap_or(chunk_size)
            .max(1);

        let mut body = file_body(owner, filename);
        body.cursor_position = Some(cursor);
        body.chunk_size = Some(request_chunk);
        body.cursor_bitfield = CursorFlags::CURSOR_KEEPALIVE;

        let mut header = conn.make_header(
            RequestCategory::FILE_OP,
            FileFlags::READ.bits(),
            false,
        );
        let (response, response_body) =
            conn.request(&mut header, Some(&auth), Some(&body)).await?;
        expect_codes(&response, &[ResponseCode::Read, ResponseCode::PartialRead])?;

        let response_body = response_body.context("read response carried no body")?;
        let data = hex_field(body_field(&response_body, "read")?)?;
        collected.extend_from_slice(&data);
        cursor = response_body
            .cursor_position
            .unwrap_or(cursor + data.len() as u64);

        if response_body.operation_ended.unwrap_or(false) || data.is_empty() {
            break;
        }
    }
    Ok(collected)
}

#[allow(clippy::too_many_arguments)]
async fn send_amendment_chunk(
    conn: &ClientConnection,
    auth: &AuthComponent,
    owner: &str,
    filename: &str,
    flags: FileFlags,
    chunk: &[u8],
    cursor_position: Option<u64>,
    last_chunk: bool,
    post_op_keepalive: bool,
    end_connection: bool,
) -> Result<u64> {
    let mut body = file_body(owner, filename);
    body.write_data = Some(chunk.to_vec());
    body.cursor_position = cursor_position;
    if last_chunk {
        body.end_operation = true;
        if post_op_keepalive {
            body.cursor_bitfield |= CursorFlags::POST_OPERATION_CURSOR_KEEPALIVE;
        }
    } else {
        body.cursor_bitfield |= CursorFlags::CURSOR_KEEPALIVE;
    }

    let mut header = conn.make_header(
        RequestCategory::FILE_OP,
        flags.bits(),
        last_chunk && end_connection,
    );
    let (response, response_body) =
        conn.request(&mut header, Some(auth), Some(&body)).await?;
    expect_codes(
        &response,
        &[ResponseCode::Amended, ResponseCode::PartialAmend],
    )?;
    Ok(response_body
        .and_then(|b| b.cursor_position)
        .unwrap_or(cursor_position.unwrap_or(0) + chunk.len() as u64))
}

/// REPLACE: truncating overwrite of the whole file. The first chunk goes out
/// as OVERWRITE, the rest as APPENDs sharing the cached handle; the closing
/// chunk sets `end_operation`.
#[allow(clippy::too_many_arguments)]
pub async fn replace_file(
    conn: &ClientConnection,
    session: &SessionHandle,
    owner: &str,
    filename: &str,
    data: &[u8],
    post_op_keepalive: bool,
    end_connection: bool,
) -> Result<()> {
    let chunk_size = conn.cfg.chunk_size.min(conn.cfg.limits.chunk_max_size).max(1);
    let auth = session.auth_component();

    let first = &data[..chunk_size.min(data.len())];
    let single = first.len() == data.len();
    send_amendment_chunk(
        conn,
        &auth,
        owner,
        filename,
        FileFlags::OVERWRITE,
        first,
        Some(0),
        single,
        post_op_keepalive,
        end_connection,
    )
    .await?;

    if !single {
        for (index, chunk) in data[first.len()..].chunks(chunk_size).enumerate() {
            let offset = first.len() + (index + 1) * chunk_size;
            let last_chunk = offset >= data.len();
            send_amendment_chunk(
                conn,
                &auth,
                owner,
                filename,
                FileFlags::APPEND,
                chunk,
                None,
                last_chunk,
                post_op_keepalive,
                end_connection,
            )
            .await?;
        }
    }
    Ok(())
}

/// APPEND `data` to the end of the remote file, chunked.
pub async fn append_file(
    conn: &ClientConnection,
    session: &SessionHandle,
    owner: &str,
    filename: &str,
    data: &[u8],
) -> Result<()> {
    let chunk_size = conn.cfg.chunk_size.min(conn.cfg.limits.chunk_max_size).max(1);
    let auth = session.auth_component();

    let chunk_count = data.len().div_ceil(chunk_size).max(1);
    for (index, chunk) in data.chunks(chunk_size).enumerate() {
        send_amendment_chunk(
            conn,
            &auth,
            owner,
            filename,
            FileFlags::APPEND,
            chunk,
            None,
            index + 1 == chunk_count,
            false,
            false,
        )
        .await?;
    }
    Ok(())
}

/// WRITE `data` at `position`, chunked; the server-side cursor carries the
/// offset between chunks.
pub async fn write_file(
    conn: &ClientConnection,
    session: &SessionHandle,
    owner: &str,
    filename: &str,
    position: u64,
    data: &[u8],
) -> Result<()> {
    let chunk_size = conn.cfg.chunk_size.min(conn.cfg.limits.chunk_max_size).max(1);
    let auth = session.auth_component();

    let chunk_count = data.len().div_ceil(chunk_size).max(1);
    let mut cursor = Some(position);
    for (index, chunk) in data.chunks(chunk_size).enumerate() {
        let next = send_amendment_chunk(
            conn,
            &auth,
            owner,
            filename,
            FileFlags::WRITE,
            chunk,
            cursor,
            index + 1 == chunk_count,
            false,
            false,
        )
        .await?;
        cursor = Some(next);
    }
    Ok(())
}

/// UPLOAD: create the remote file and fill it with a local file's contents.
pub async fn upload_file(
    conn: &ClientConnection,
    session: &SessionHandle,
    local_path: &std::path::Path,
    remote_name: &str,
) -> Result<()> {
    let data = tokio::fs::read(local_path)
        .await
        .with_context(|| format!("failed to read {local_path:?}"))?;
    create_file(conn, session, remote_name).await?;
    if data.is_empty() {
        return Ok(());
    }
    replace_file(
        conn,
        session,
        &session.identity,
        remote_name,
        &data,
        false,
        false,
    )
    .await
}

fn permission_body(owner: &str, file: &str, user: Option<&str>) -> PermissionBody {
    PermissionBody {
        subject_file: file.to_string(),
        subject_file_owner: owner.to_string(),
        subject_user: user.map(str::to_string),
        effect_duration: None,
    }
}

/// GRANT a role on a file to another user.
pub async fn grant(
    conn: &ClientConnection,
    session: &SessionHandle,
    owner: &str,
    filename: &str,
    grantee: &str,
    role: Role,
    effect_duration: Option<u64>,
) -> Result<()> {
    let role_bits = match role {
        Role::Reader => PermissionFlags::READER,
        Role::Editor => PermissionFlags::EDITOR,
        Role::Manager => PermissionFlags::MANAGER,
        Role::Owner => bail!("ownership is transferred, not granted"),
    };
    let mut header = conn.make_header(
        RequestCategory::PERMISSION,
        (PermissionFlags::GRANT | role_bits).bits(),
        false,
    );
    let auth = session.auth_component();
    let mut body = permission_body(owner, filename, Some(grantee));
    body.effect_duration = effect_duration;
    let (response, _) = conn.request(&mut header, Some(&auth), Some(&body)).await?;
    expect_codes(&response, &[ResponseCode::Granted])
}

/// REVOKE a user's role on a file.
pub async fn revoke(
    conn: &ClientConnection,
    session: &SessionHandle,
    owner: &str,
    filename: &str,
    grantee: &str,
) -> Result<()> {
    let mut header = conn.make_header(
        RequestCategory::PERMISSION,
        PermissionFlags::REVOKE.bits(),
        false,
    );
    let auth = session.auth_component();
    let body = permission_body(owner, filename, Some(grantee));
    let (response, _) = conn.request(&mut header, Some(&auth), Some(&body)).await?;
    expect_codes(&response, &[ResponseCode::Revoked])
}

/// PUBLICISE / HIDE the caller's own file.
pub async fn set_publicity(
    conn: &ClientConnection,
    session: &SessionHandle,
    filename: &str,
    public: bool,
) -> Result<()> {
    let (flags, expected) = if public {
        (PermissionFlags::PUBLICISE, ResponseCode::FilePublicised)
    } else {
        (PermissionFlags::HIDE, ResponseCode::FileHidden)
    };
    let mut header =
        conn.make_header(RequestCategory::PERMISSION, flags.bits(), false);
    let auth = session.auth_component();
    let body = permission_body(&session.identity, filename, None);
    let (response, _) = conn.request(&mut header, Some(&auth), Some(&body)).await?;
    expect_codes(&response, &[expected])
}

/// TRANSFER ownership of the caller's file to another user.
pub async fn transfer(
    conn: &ClientConnection,
    session: &SessionHandle,
    filename: &str,
    new_owner: &str,
) -> Result<String> {
    let mut header = conn.make_header(
        RequestCategory::PERMISSION,
        PermissionFlags::TRANSFER.bits(),
        false,
    );
    let auth = session.auth_component();
    let body = permission_body(&session.identity, filename, Some(new_owner));
    let (response, response_body) =
        conn.request(&mut header, Some(&auth), Some(&body)).await?;
    expect_codes(&response, &[ResponseCode::OwnershipTransferred])?;

    let response_body = response_body.context("transfer response carried no body")?;
    Ok(body_field(&response_body, "new_filepath")?
        .as_str()
        .unwrap_or_default()
        .to_string())
}

/// Category-level heartbeat: no auth, no body.
pub async fn heartbeat(conn: &ClientConnection, end_connection: bool) -> Result<()> {
    let mut header = conn.make_header(RequestCategory::HEARTBEAT, 0, end_connection);
    let (response, _) = conn
        .request::<FileBody>(&mut header, None, None)
        .await?;
    expect_codes(&response, &[ResponseCode::Heartbeat])
}

/// INFO query; `session` may be omitted for the unauthenticated subset
/// (heartbeat echo, SSL credentials).
pub async fn info_query(
    conn: &ClientConnection,
    session: Option<&SessionHandle>,
    operation: InfoFlags,
    verbose: bool,
    body: Option<InfoBody>,
) -> Result<Option<ResponseBody>> {
    let mut flags = operation;
    if verbose {
        flags |= InfoFlags::VERBOSE;
    }
    let mut header = conn.make_header(RequestCategory::INFO, flags.bits(), false);
    let auth = session.map(SessionHandle::auth_component);
    let (response, response_body) = conn
        .request(&mut header, auth.as_ref(), body.as_ref())
        .await?;
    expect_codes(&response, &[ResponseCode::Heartbeat])?;
    Ok(response_body)
}
