// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Environment override for the config location, taking precedence over the
/// path given on the command line.
pub const CONFIG_ENV_VAR: &str = "FILEPROTO_CONFIG";

/// Resolves a config path to a canonical absolute path, relative paths
/// anchoring at the working directory.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// The effective config path: `FILEPROTO_CONFIG` when set, otherwise the
/// provided argument or fallback.
pub fn effective_config_path(arg: Option<String>, fallback: &str) -> Result<PathBuf> {
    let requested = std::env::var(CONFIG_ENV_VAR)
        .ok()
        .or(arg)
        .unwrap_or_else(|| fallback.to_string());
    resolve_config_path(&requested)
}
