// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Filesystem-level file operations. Handlers acquire the per-path lock and
//! consult tombstones before calling in here; these functions manage the
//! buffered-handle caches and the actual I/O.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use uuid::Uuid;

use crate::{
    errors::{ProtocolError, ProtocolResult},
    files::caches::{CachedHandle, FileCaches},
};

/// Which amendment flavor a request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmendMode {
    Write,
    Overwrite,
    Append,
}

pub struct ReadOutcome {
    pub data: Vec<u8>,
    pub cursor: u64,
    pub eof_reached: bool,
    /// Whether the handle stayed cached for the next chunk.
    pub handle_cached: bool,
}

pub struct AmendOutcome {
    pub cursor: u64,
    pub handle_cached: bool,
    /// Net change of the file size, fed into the storage cache.
    pub size_delta: i64,
}

fn map_io(err: std::io::Error, owner: &str, file: &str) -> ProtocolError {
    match err.kind() {
        std::io::ErrorKind::NotFound => ProtocolError::FileNotFound {
            owner: owner.to_string(),
            file: file.to_string(),
        },
        std::io::ErrorKind::AlreadyExists => ProtocolError::FileConflict {
            owner: owner.to_string(),
            file: file.to_string(),
        },
        _ if err.raw_os_error() == Some(28) => ProtocolError::OutOfDisk,
        _ => ProtocolError::Internal(anyhow::anyhow!(
            "io failure on {owner}/{file}: {err}"
        )),
    }
}

fn not_found(owner: &str, file: &str) -> ProtocolError {
    ProtocolError::FileNotFound {
        owner: owner.to_string(),
        file: file.to_string(),
    }
}

/// Exclusive-create of `owner/filename`, making the owner directory when
/// missing. Returns the relative path and the creation timestamp.
pub async fn create_file(
    root: &Path,
    owner: &str,
    filename: &str,
) -> ProtocolResult<(String, f64)> {
    let owner_dir = root.join(owner);
    tokio::fs::create_dir_all(&owner_dir)
        .await
        .map_err(|e| map_io(e, owner, filename))?;

    let abs_path = owner_dir.join(filename);
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs_path)
        .await
        .map_err(|e| map_io(e, owner, filename))?;

    let created_at = file
        .metadata()
        .await
        .ok()
        .and_then(|m| m.created().ok())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or_else(crate::utils::unix_timestamp);

    Ok((format!("{owner}/{filename}"), created_at))
}

async fn eof_probe(file: &mut File) -> ProtocolResult<bool> {
    let mut probe = [0u8; 1];
    let n = file
        .read(&mut probe)
        .await
        .map_err(|e| ProtocolError::Internal(anyhow::anyhow!(e)))?;
    if n > 0 {
        file.seek(SeekFrom::Current(-1))
            .await
            .map_err(|e| ProtocolError::Internal(anyhow::anyhow!(e)))?;
        return Ok(false);
    }
    Ok(true)
}

async fn read_up_to(file: &mut File, limit: usize) -> ProtocolResult<Vec<u8>> {
    let mut data = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = file
            .read(&mut data[filled..])
            .await
            .map_err(|e| ProtocolError::Internal(anyhow::anyhow!(e)))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);
    Ok(data)
}

/// Reads up to `chunk_size` bytes at `cursor_position`.
///
/// The cached handle for `(path, identity)` is reused when present; a
/// client-supplied position always wins over the cached cursor. The handle
/// stays cached only while the client keeps asking for it and EOF has not
/// been reached.
#[allow(clippy::too_many_arguments)]
pub async fn read_file(
    root: &Path,
    owner: &str,
    filename: &str,
    caches: &FileCaches,
    identity: &str,
    cursor_position: Option<u64>,
    chunk_size: Option<usize>,
    keepalive: bool,
    purge: bool,
) -> ProtocolResult<ReadOutcome> {
    let rel_path = format!("{owner}/{filename}");
    if caches.deleted.contains(&rel_path) {
        return Err(not_found(owner, filename));
    }
    let abs_path = root.join(owner).join(filename);

    let mut handle = match caches.readers.take(&rel_path, identity) {
        Some(mut cached) => {
            if let Some(position) = cursor_position
                && cached.cursor != position
            {
                cached
                    .file
                    .seek(SeekFrom::Start(position))
                    .await
                    .map_err(|e| map_io(e, owner, filename))?;
                cached.cursor = position;
            }
            cached
        },
        None => {
            let mut file = File::open(&abs_path)
                .await
                .map_err(|e| map_io(e, owner, filename))?;
            let position = cursor_position.unwrap_or(0);
            if position > 0 {
                file.seek(SeekFrom::Start(position))
                    .await
                    .map_err(|e| map_io(e, owner, filename))?;
            }
            CachedHandle {
                file,
                cursor: position,
            }
        },
    };

    let data = match chunk_size {
        Some(limit) => read_up_to(&mut handle.file, limit).await?,
        None => {
            let mut buf = Vec::new();
            handle
                .file
                .read_to_end(&mut buf)
                .await
                .map_err(|e| map_io(e, owner, filename))?;
            buf
        },
    };
    handle.cursor += data.len() as u64;

    let eof_reached = eof_probe(&mut handle.file).await?;

    let cursor = handle.cursor;
    let handle_cached = keepalive && !purge && !eof_reached;
    if handle_cached {
        caches.readers.put(&rel_path, identity, handle);
    }

    Ok(ReadOutcome {
        data,
        cursor,
        eof_reached,
        handle_cached,
    })
}

/// Writes `data` in the requested mode, tracking the size delta for the
/// storage cache. Cursor semantics: Overwrite truncates at open, Write seeks
/// to the client position, Append never seeks.
#[allow(clippy::too_many_arguments)]
pub async fn amend_file(
    root: &Path,
    owner: &str,
    filename: &str,
    caches: &FileCaches,
    identity: &str,
    mode: AmendMode,
    data: &[u8],
    cursor_position: Option<u64>,
    keepalive: bool,
    purge: bool,
) -> ProtocolResult<AmendOutcome> {
    let rel_path = format!("{owner}/{filename}");
    if caches.deleted.contains(&rel_path) {
        return Err(not_found(owner, filename));
    }
    let abs_path = root.join(owner).join(filename);
    if !tokio::fs::try_exists(&abs_path)
        .await
        .map_err(|e| map_io(e, owner, filename))?
    {
        return Err(not_found(owner, filename));
    }

    let mut handle = match caches.amendments.take(&rel_path, identity) {
        Some(cached) => cached,
        None => {
            let mut options = OpenOptions::new();
            match mode {
                AmendMode::Write => options.write(true),
                AmendMode::Overwrite => options.write(true).truncate(true),
                AmendMode::Append => options.append(true),
            };
            let file = options
                .open(&abs_path)
                .await
                .map_err(|e| map_io(e, owner, filename))?;
            CachedHandle { file, cursor: 0 }
        },
    };

    let size_before = handle
        .file
        .metadata()
        .await
        .map_err(|e| map_io(e, owner, filename))?
        .len() as i64;

    if mode != AmendMode::Append {
        let position = cursor_position.unwrap_or(handle.cursor);
        if handle.cursor != position {
            handle
                .file
                .seek(SeekFrom::Start(position))
                .await
                .map_err(|e| map_io(e, owner, filename))?;
            handle.cursor = position;
        }
    }

    handle
        .file
        .write_all(data)
        .await
        .map_err(|e| map_io(e, owner, filename))?;
    handle
        .file
        .flush()
        .await
        .map_err(|e| map_io(e, owner, filename))?;

    handle.cursor = match mode {
        AmendMode::Append => handle
            .file
            .stream_position()
            .await
            .map_err(|e| map_io(e, owner, filename))?,
        _ => handle.cursor + data.len() as u64,
    };

    let size_after = handle
        .file
        .metadata()
        .await
        .map_err(|e| map_io(e, owner, filename))?
        .len() as i64;

    let cursor = handle.cursor;
    let handle_cached = keepalive && !purge;
    if handle_cached {
        caches.amendments.put(&rel_path, identity, handle);
    }

    Ok(AmendOutcome {
        cursor,
        handle_cached,
        size_delta: size_after - size_before,
    })
}

/// Removes the file, plants a tombstone and closes every cached handle for
/// the path. The caller has already NULLed the file lock as a barrier.
pub async fn delete_file(
    root: &Path,
    owner: &str,
    filename: &str,
    caches: &FileCaches,
) -> ProtocolResult<i64> {
    let rel_path = format!("{owner}/{filename}");
    if caches.deleted.contains(&rel_path) {
        return Err(not_found(owner, filename));
    }
    let abs_path = root.join(owner).join(filename);

    let size = tokio::fs::metadata(&abs_path)
        .await
        .map_err(|e| map_io(e, owner, filename))?
        .len() as i64;
    tokio::fs::remove_file(&abs_path)
        .await
        .map_err(|e| map_io(e, owner, filename))?;
    caches.purge_file(&rel_path);
    Ok(size)
}

/// Moves `prev_owner/filename` under `new_owner`, creating the target
/// directory when missing. A name collision gets a UUID-fragment prefix.
/// Returns the filename valid under the new owner.
pub async fn transfer_file(
    root: &Path,
    prev_owner: &str,
    filename: &str,
    new_owner: &str,
    new_name: Option<&str>,
    caches: &FileCaches,
) -> ProtocolResult<String> {
    let old_rel = format!("{prev_owner}/{filename}");
    if caches.deleted.contains(&old_rel) {
        return Err(not_found(prev_owner, filename));
    }
    let old_abs = root.join(prev_owner).join(filename);
    if !tokio::fs::try_exists(&old_abs)
        .await
        .map_err(|e| map_io(e, prev_owner, filename))?
    {
        return Err(not_found(prev_owner, filename));
    }

    let target_dir = root.join(new_owner);
    tokio::fs::create_dir_all(&target_dir)
        .await
        .map_err(|e| map_io(e, new_owner, filename))?;

    let mut target_name = new_name.unwrap_or(filename).to_string();
    let mut target_abs: PathBuf = target_dir.join(&target_name);
    if tokio::fs::try_exists(&target_abs)
        .await
        .map_err(|e| map_io(e, new_owner, &target_name))?
    {
        target_name = format!("{}_{target_name}", Uuid::new_v4().simple());
        target_abs = target_dir.join(&target_name);
    }

    tokio::fs::rename(&old_abs, &target_abs)
        .await
        .map_err(|e| map_io(e, prev_owner, filename))?;

    caches.rename_file(&old_rel, &format!("{new_owner}/{target_name}"));
    Ok(target_name)
}

/// Recursively removes a user directory, returning the filenames that
/// existed just prior. Directory walks are offloaded to the blocking pool.
pub async fn delete_directory(root: &Path, dirname: &str) -> ProtocolResult<Vec<String>> {
    let dir = root.join(dirname);
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                        files.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            },
            Err(e) => return Err(ProtocolError::Internal(anyhow::anyhow!(e))),
        }
        std::fs::remove_dir_all(&dir)
            .map_err(|e| ProtocolError::Internal(anyhow::anyhow!(e)))?;
        Ok(files)
    })
    .await
    .map_err(|e| ProtocolError::Internal(anyhow::anyhow!(e)))?
}
