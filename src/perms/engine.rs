// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Grant / revoke / publicise / hide / transfer, with granter precedence.
//!
//! Precedence rule: a permission row originally installed by the file owner
//! can only be overridden or revoked by the owner. Row contention maps to
//! `OperationContested` via `FOR UPDATE NOWAIT`.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    cfg::config::ServerConfig,
    db::pool::{ConnectionPoolManager, ConnectionPriority, ConnectionProxy},
    errors::{ProtocolError, ProtocolResult},
    files::{caches::FileCaches, ops::transfer_file},
    perms::roles::{Capability, Role},
    proto::{body::PermissionBody, flags::PermissionFlags},
};

const CAPABILITY_CHECK_SQL: &str = "SELECT roles.permission \
     FROM file_permissions fp \
     INNER JOIN roles ON roles.role = fp.role \
     WHERE fp.file_owner = $1 AND fp.filename = $2 AND fp.grantee = $3 \
       AND (fp.granted_until IS NULL OR fp.granted_until > $4) \
       AND roles.permission = $5 \
     LIMIT 1;";

/// The shared capability check: joins `file_permissions` to `roles` and
/// filters out expired grants.
pub async fn check_file_permission(
    proxy: &ConnectionProxy,
    owner: &str,
    filename: &str,
    grantee: &str,
    capability: Capability,
    check_until: Option<DateTime<Utc>>,
) -> ProtocolResult<bool> {
    let until = check_until.unwrap_or_else(Utc::now);
    let row = proxy
        .query_opt(
            CAPABILITY_CHECK_SQL,
            &[&owner, &filename, &grantee, &until, &capability.as_str()],
        )
        .await?;
    Ok(row.is_some())
}

/// READ is additionally satisfied by the file's public flag.
pub async fn check_read_allowed(
    proxy: &ConnectionProxy,
    owner: &str,
    filename: &str,
    grantee: &str,
) -> ProtocolResult<bool> {
    if check_file_permission(proxy, owner, filename, grantee, Capability::Read, None)
        .await?
    {
        return Ok(true);
    }
    let row = proxy
        .query_opt(
            "SELECT public FROM files WHERE owner = $1 AND filename = $2;",
            &[&owner, &filename],
        )
        .await?;
    Ok(row.map(|r| r.get::<_, bool>(0)).unwrap_or(false))
}

fn effect_until(effect_duration: Option<u64>) -> Option<DateTime<Utc>> {
    match effect_duration {
        // Zero or absent means perpetual.
        None | Some(0) => None,
        Some(secs) => Some(Utc::now() + Duration::from_secs(secs)),
    }
}

/// A revoked or deleted grant, echoed in response bodies.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RevokedGrant {
    pub grantee: String,
    pub role: String,
    pub granted_by: String,
}

/// GRANT: installs or overrides a role on (owner, file, grantee).
pub async fn grant_permission(
    pool: &Arc<ConnectionPoolManager>,
    requester: &str,
    body: &PermissionBody,
    flags: PermissionFlags,
) -> ProtocolResult<Role> {
    let grantee = body.require_subject_user()?;
    let role = Role::from_flags(flags).ok_or_else(|| {
        ProtocolError::InvalidBodyValues(
            "grant requires role bits (reader/editor/manager)".to_string(),
        )
    })?;
    // Granting MANAGER is reserved to holders of MANAGE_SUPER, i.e. the owner.
    let required = if role == Role::Manager {
        Capability::ManageSuper
    } else {
        Capability::ManageRw
    };

    let proxy = pool.request_connection(ConnectionPriority::Mid, None).await?;
    let result =
        grant_locked(&proxy, requester, body, grantee, role, required).await;
    if result.is_err() {
        let _ = proxy.rollback().await;
    }
    pool.reclaim_connection(proxy);
    result.map(|_| role)
}

async fn grant_locked(
    proxy: &ConnectionProxy,
    requester: &str,
    body: &PermissionBody,
    grantee: &str,
    role: Role,
    required: Capability,
) -> ProtocolResult<()> {
    let owner = body.subject_file_owner.as_str();
    let file = body.subject_file.as_str();

    if !check_file_permission(proxy, owner, file, requester, required, None).await? {
        return Err(ProtocolError::InsufficientPermissions(format!(
            "user {requester} cannot grant {role} on file {file} owned by {owner}"
        )));
    }

    proxy.begin().await?;
    let existing = proxy
        .query_opt(
            "SELECT role, granted_by, granted_until FROM file_permissions \
             WHERE file_owner = $1 AND filename = $2 AND grantee = $3 \
             FOR UPDATE NOWAIT;",
            &[&owner, &file, &grantee],
        )
        .await?;

    let granted_until = effect_until(body.effect_duration);
    match existing {
        Some(row) => {
            let current_role: String = row.get(0);
            let granted_by: String = row.get(1);
            let until: Option<DateTime<Utc>> = row.get(2);
            let still_active = until.map(|t| t > Utc::now()).unwrap_or(true);

            if still_active && current_role == role.as_str() {
                return Err(ProtocolError::OperationalConflict(format!(
                    "user {grantee} already has role {role} on file {file} \
                     owned by {owner}"
                )));
            }
            // Owner-granted roles can only be overridden by the owner.
            if granted_by == owner && requester != owner {
                return Err(ProtocolError::InsufficientPermissions(format!(
                    "role of {grantee} on {file} was granted by the owner and \
                     can only be overridden by the owner"
                )));
            }
            proxy
                .execute(
                    "UPDATE file_permissions \
                     SET role = $1, granted_by = $2, granted_at = $3, \
                         granted_until = $4 \
                     WHERE file_owner = $5 AND filename = $6 AND grantee = $7;",
                    &[
                        &role.as_str(),
                        &requester,
                        &Utc::now(),
                        &granted_until,
                        &owner,
                        &file,
                        &grantee,
                    ],
                )
                .await?;
        },
        None => {
            proxy
                .execute(
                    "INSERT INTO file_permissions \
                     (file_owner, filename, grantee, role, granted_by, \
                      granted_at, granted_until) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7);",
                    &[
                        &owner,
                        &file,
                        &grantee,
                        &role.as_str(),
                        &requester,
                        &Utc::now(),
                        &granted_until,
                    ],
                )
                .await?;
        },
    }
    proxy.commit().await
}

/// REVOKE: deletes the grant row, honoring the same precedence rules.
pub async fn revoke_permission(
    pool: &Arc<ConnectionPoolManager>,
    requester: &str,
    body: &PermissionBody,
    flags: PermissionFlags,
) -> ProtocolResult<RevokedGrant> {
    let grantee = body.require_subject_user()?;
    let required = if flags.contains(PermissionFlags::MANAGER) {
        Capability::ManageSuper
    } else {
        Capability::ManageRw
    };

    let proxy = pool.request_connection(ConnectionPriority::Mid, None).await?;
    let result = revoke_locked(&proxy, requester, body, grantee, required).await;
    if result.is_err() {
        let _ = proxy.rollback().await;
    }
    pool.reclaim_connection(proxy);
    result
}

async fn revoke_locked(
    proxy: &ConnectionProxy,
    requester: &str,
    body: &PermissionBody,
    grantee: &str,
    required: Capability,
) -> ProtocolResult<RevokedGrant> {
    let owner = body.subject_file_owner.as_str();
    let file = body.subject_file.as_str();

    if !check_file_permission(proxy, owner, file, requester, required, None).await? {
        return Err(ProtocolError::InsufficientPermissions(format!(
            "user {requester} cannot revoke permissions on file {file} \
             owned by {owner}"
        )));
    }

    proxy.begin().await?;
    let existing = proxy
        .query_opt(
            "SELECT role, granted_by FROM file_permissions \
             WHERE file_owner = $1 AND filename = $2 AND grantee = $3 \
               AND (granted_until IS NULL OR granted_until > $4) \
             FOR UPDATE NOWAIT;",
            &[&owner, &file, &grantee, &Utc::now()],
        )
        .await?;
    let Some(row) = existing else {
        return Err(ProtocolError::OperationalConflict(format!(
            "user {grantee} has no permission on file {file} owned by {owner}"
        )));
    };
    let role: String = row.get(0);
    let granted_by: String = row.get(1);
    if granted_by == owner && requester != owner {
        return Err(ProtocolError::InsufficientPermissions(format!(
            "role of {grantee} on {file} was granted by the owner and can \
             only be revoked by the owner"
        )));
    }

    proxy
        .execute(
            "DELETE FROM file_permissions \
             WHERE file_owner = $1 AND filename = $2 AND grantee = $3;",
            &[&owner, &file, &grantee],
        )
        .await?;
    proxy.commit().await?;

    Ok(RevokedGrant {
        grantee: grantee.to_string(),
        role,
        granted_by,
    })
}

/// PUBLICISE: owner-only flip of `files.public` to TRUE.
pub async fn publicise_file(
    pool: &Arc<ConnectionPoolManager>,
    requester: &str,
    body: &PermissionBody,
) -> ProtocolResult<()> {
    require_owner(requester, body)?;

    let proxy = pool
        .request_connection(ConnectionPriority::High, None)
        .await?;
    let result = async {
        proxy.begin().await?;
        let row = proxy
            .query_opt(
                "SELECT public FROM files WHERE owner = $1 AND filename = $2 \
                 FOR UPDATE NOWAIT;",
                &[&requester, &body.subject_file],
            )
            .await?;
        let Some(row) = row else {
            return Err(ProtocolError::FileNotFound {
                owner: requester.to_string(),
                file: body.subject_file.clone(),
            });
        };
        if row.get::<_, bool>(0) {
            return Err(ProtocolError::FileConflict {
                owner: requester.to_string(),
                file: body.subject_file.clone(),
            });
        }
        proxy
            .execute(
                "UPDATE files SET public = TRUE \
                 WHERE owner = $1 AND filename = $2;",
                &[&requester, &body.subject_file],
            )
            .await?;
        proxy.commit().await
    }
    .await;
    if result.is_err() {
        let _ = proxy.rollback().await;
    }
    pool.reclaim_connection(proxy);
    result
}

/// HIDE: owner-only flip back to private. Every non-owner grant row is
/// deleted and returned; the owner's own row survives.
pub async fn hide_file(
    pool: &Arc<ConnectionPoolManager>,
    requester: &str,
    body: &PermissionBody,
) -> ProtocolResult<Vec<RevokedGrant>> {
    require_owner(requester, body)?;

    let proxy = pool
        .request_connection(ConnectionPriority::High, None)
        .await?;
    let result = async {
        proxy.begin().await?;
        let row = proxy
            .query_opt(
                "SELECT public FROM files WHERE owner = $1 AND filename = $2 \
                 FOR UPDATE NOWAIT;",
                &[&requester, &body.subject_file],
            )
            .await?;
        if row.is_none() {
            return Err(ProtocolError::FileNotFound {
                owner: requester.to_string(),
                file: body.subject_file.clone(),
            });
        }
        proxy
            .execute(
                "UPDATE files SET public = FALSE \
                 WHERE owner = $1 AND filename = $2;",
                &[&requester, &body.subject_file],
            )
            .await?;
        let revoked = proxy
            .query(
                "DELETE FROM file_permissions \
                 WHERE file_owner = $1 AND filename = $2 AND role <> 'owner' \
                 RETURNING grantee, role, granted_by;",
                &[&requester, &body.subject_file],
            )
            .await?;
        proxy.commit().await?;

        Ok(revoked
            .into_iter()
            .map(|row| RevokedGrant {
                grantee: row.get(0),
                role: row.get(1),
                granted_by: row.get(2),
            })
            .collect())
    }
    .await;
    if result.is_err() {
        let _ = proxy.rollback().await;
    }
    pool.reclaim_connection(proxy);
    result
}

pub struct TransferOutcome {
    pub old_path: String,
    pub new_path: String,
    pub new_filename: String,
    pub file_size: i64,
}

/// TRANSFER: re-roots ownership. The file moves on disk first so a failure
/// there aborts without touching the database; a database failure after the
/// move rolls the file back to its original place.
pub async fn transfer_ownership(
    pool: &Arc<ConnectionPoolManager>,
    config: &ServerConfig,
    caches: &FileCaches,
    requester: &str,
    body: &PermissionBody,
) -> ProtocolResult<TransferOutcome> {
    require_owner(requester, body)?;
    let new_owner = body.require_subject_user()?;
    if new_owner == body.subject_file_owner {
        return Err(ProtocolError::OperationalConflict(
            "cannot transfer file ownership to the current owner".to_string(),
        ));
    }

    let owner = body.subject_file_owner.as_str();
    let file = body.subject_file.as_str();
    let root = config.file.root_directory.as_path();

    let proxy = pool.request_connection(ConnectionPriority::Low, None).await?;

    // The identity claim is re-verified against the database; the auth
    // component alone is not trusted for ownership.
    let is_owner = proxy
        .query_opt(
            "SELECT 1 FROM file_permissions \
             WHERE file_owner = $1 AND filename = $2 AND grantee = $3 \
               AND role = 'owner';",
            &[&owner, &file, &requester],
        )
        .await?
        .is_some();
    if !is_owner {
        pool.reclaim_connection(proxy);
        return Err(ProtocolError::InsufficientPermissions(format!(
            "only the owner of {file} may transfer it"
        )));
    }

    let mut moved_name: Option<String> = None;
    let result = async {
        proxy.begin().await?;
        proxy
            .query(
                "SELECT grantee FROM file_permissions \
                 WHERE file_owner = $1 AND filename = $2 \
                 FOR UPDATE NOWAIT;",
                &[&owner, &file],
            )
            .await?;
        let file_size: i64 = proxy
            .query_opt(
                "SELECT file_size FROM files WHERE owner = $1 AND filename = $2;",
                &[&owner, &file],
            )
            .await?
            .map(|row| row.get(0))
            .unwrap_or(0);

        // Disk first: an OS failure here leaves consistent state.
        let new_filename = tokio::time::timeout(
            config.file.transfer_timeout,
            transfer_file(root, owner, file, new_owner, None, caches),
        )
        .await
        .map_err(|_| ProtocolError::ServerTimeout)??;
        moved_name = Some(new_filename.clone());

        proxy
            .execute(
                "UPDATE file_permissions \
                 SET file_owner = $1, filename = $2 \
                 WHERE file_owner = $3 AND filename = $4;",
                &[&new_owner, &new_filename, &owner, &file],
            )
            .await?;
        proxy
            .execute(
                "UPDATE files SET owner = $1, filename = $2 \
                 WHERE owner = $3 AND filename = $4;",
                &[&new_owner, &new_filename, &owner, &file],
            )
            .await?;
        proxy.commit().await?;

        Ok(TransferOutcome {
            old_path: format!("{owner}/{file}"),
            new_path: format!("{new_owner}/{new_filename}"),
            new_filename,
            file_size,
        })
    }
    .await;

    if result.is_err() {
        let _ = proxy.rollback().await;
        // Compensate: put the file back under its original name.
        if let Some(name) = moved_name {
            let rollback = tokio::time::timeout(
                config.file.transfer_timeout,
                transfer_file(root, new_owner, &name, owner, Some(file), caches),
            )
            .await;
            if !matches!(rollback, Ok(Ok(_))) {
                tracing::error!(
                    file = file,
                    owner = owner,
                    "transfer rollback failed; filesystem and database disagree"
                );
            }
        }
    }
    pool.reclaim_connection(proxy);
    result
}

fn require_owner(requester: &str, body: &PermissionBody) -> ProtocolResult<()> {
    if requester != body.subject_file_owner {
        return Err(ProtocolError::InsufficientPermissions(format!(
            "only the file owner {} may perform this operation",
            body.subject_file_owner
        )));
    }
    Ok(())
}
