// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::IpAddr, path::{Path, PathBuf}, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::proto::ProtocolLimits;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    /// Protocol version advertised in every response header.
    pub version: String,
    /// Listener address and stream timeouts.
    pub network: NetworkConfig,
    /// Backend pool sizing and lease policy.
    pub database: DatabaseConfig,
    /// File storage root, handle caches, lock behavior.
    pub file: FileConfig,
    /// Session and login policy.
    pub auth: AuthConfig,
    /// Console/file tracing plus the activity-log sink.
    pub logging: LoggingConfig,
    /// TLS credentials and rotation policy.
    pub tls: TlsConfig,
    /// Wire-level size and shape constraints.
    #[serde(default)]
    pub protocol: ProtocolLimits,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NetworkConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Per-component stream read deadline.
    #[serde(with = "serde_secs")]
    pub read_timeout: Duration,
    /// TCP connect/handshake deadline.
    #[serde(with = "serde_secs")]
    pub connection_timeout: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DatabaseConfig {
    /// Pre-established connections per lane (HIGH, MID, LOW).
    pub high_priority_conns: usize,
    pub mid_priority_conns: usize,
    pub low_priority_conns: usize,
    /// Default lease granted to a borrowed connection.
    #[serde(with = "serde_secs")]
    pub lease_duration: Duration,
    #[serde(with = "serde_secs")]
    pub connection_timeout: Duration,
    #[serde(with = "serde_secs")]
    pub refresh_interval: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FileConfig {
    /// Directory holding one subdirectory per user.
    pub root_directory: PathBuf,
    /// TTL of cached reader/writer handles.
    #[serde(with = "serde_secs")]
    pub cache_ttl: Duration,
    /// TTL of a file lock before it is considered abandoned.
    #[serde(with = "serde_secs")]
    pub lock_ttl: Duration,
    /// TTL of deletion tombstones.
    #[serde(with = "serde_secs")]
    pub tombstone_ttl: Duration,
    /// How long a contender waits for a file lock before `FileContested`.
    #[serde(with = "serde_secs")]
    pub contention_timeout: Duration,
    /// Deadline for a physical ownership transfer on disk.
    #[serde(with = "serde_secs")]
    pub transfer_timeout: Duration,
    pub user_max_files: u64,
    /// Storage-cache flush cadence and batch size.
    #[serde(with = "serde_secs")]
    pub disk_flush_interval: Duration,
    pub flush_batch_size: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AuthConfig {
    pub max_attempts: u32,
    /// Escalating lockout durations after repeated failures, seconds.
    pub lock_timeouts: Vec<f64>,
    #[serde(with = "serde_secs")]
    pub session_lifespan: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    File,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    Daily,
    Never,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogFileConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub rotation_frequency: Option<LogRotation>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingConfig {
    /// Tracing filter directive, e.g. `info` or `fileproto_rs=debug`.
    pub level: String,
    pub output: LogOutput,
    #[serde(default)]
    pub file: Option<LogFileConfig>,

    /// Activity-log sink knobs (§ database relation `activity_logs`).
    pub batch_size: usize,
    #[serde(with = "serde_secs")]
    pub flush_interval: Duration,
    #[serde(with = "serde_secs")]
    pub waiting_period: Duration,
    pub max_retries: u32,
    pub queue_size: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TlsConfig {
    pub credentials_directory: PathBuf,
    #[serde(default = "TlsConfig::default_cert_filename")]
    pub certificate_filename: String,
    #[serde(default = "TlsConfig::default_key_filename")]
    pub key_filename: String,
    #[serde(default = "TlsConfig::default_rollover_filename")]
    pub rollover_filename: String,
    /// DNS SAN baked into self-signed certificates.
    pub dns_name: String,
    /// Cipher-suite allow-list; empty means provider defaults.
    #[serde(default)]
    pub ciphers: Vec<String>,
    /// Window during which a rollover token vouches for the new certificate.
    #[serde(with = "serde_secs")]
    pub rollover_grace_window: Duration,
    pub rollover_nonce_length: usize,
    pub rollover_history_length: usize,
    /// Cadence of the accept loop's certificate-mtime poll.
    #[serde(with = "serde_secs")]
    pub rollover_check_poll_interval: Duration,
    /// When set, rotate credentials on this schedule.
    #[serde(default, with = "serde_secs_opt")]
    pub rotation_interval: Option<Duration>,
}

impl TlsConfig {
    fn default_cert_filename() -> String {
        "certfile.crt".to_string()
    }

    fn default_key_filename() -> String {
        "keyfile.pem".to_string()
    }

    fn default_rollover_filename() -> String {
        "rollover.json".to_string()
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.credentials_directory.join(&self.certificate_filename)
    }

    pub fn key_path(&self) -> PathBuf {
        self.credentials_directory.join(&self.key_filename)
    }

    pub fn rollover_path(&self) -> PathBuf {
        self.credentials_directory.join(&self.rollover_filename)
    }
}

impl ServerConfig {
    /// Loads the configuration from TOML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config file {:?}", path.as_ref())
        })?;
        let mut cfg: ServerConfig =
            toml::from_str(&s).context("failed to parse config TOML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.protocol.valid_version(&self.version),
            "version must be a semver triple"
        );

        ensure!(
            self.database.high_priority_conns >= 1
                && self.database.mid_priority_conns >= 1
                && self.database.low_priority_conns >= 1,
            "every connection lane needs at least one connection"
        );
        ensure!(
            !self.database.lease_duration.is_zero(),
            "lease duration must be positive"
        );
        ensure!(
            !self.network.read_timeout.is_zero(),
            "read timeout must be positive"
        );

        ensure!(self.file.user_max_files >= 1, "user_max_files must be >= 1");
        ensure!(
            self.file.flush_batch_size >= 1,
            "flush_batch_size must be >= 1"
        );

        ensure!(
            !self.auth.session_lifespan.is_zero()
                && self.auth.session_lifespan <= Duration::from_secs(86_400),
            "session lifespan must be within (0, 1 day]"
        );

        ensure!(self.logging.batch_size >= 1, "log batch size must be >= 1");
        ensure!(self.logging.queue_size >= 1, "log queue size must be >= 1");

        ensure!(
            self.tls.rollover_history_length >= 1,
            "rollover history must keep at least one token"
        );
        ensure!(
            self.tls.rollover_nonce_length >= 8,
            "rollover nonce must be at least 8 bytes"
        );
        ensure!(!self.tls.dns_name.is_empty(), "tls.dns_name must not be empty");

        // Relative storage paths anchor at the working directory.
        if self.file.root_directory.is_relative() {
            self.file.root_directory = std::env::current_dir()
                .context("cannot get current working dir")?
                .join(&self.file.root_directory);
        }
        if self.tls.credentials_directory.is_relative() {
            self.tls.credentials_directory = std::env::current_dir()
                .context("cannot get current working dir")?
                .join(&self.tls.credentials_directory);
        }

        Ok(())
    }

    /// The refresh not-before bound: half the session lifespan.
    pub fn session_refresh_nbf(&self) -> Duration {
        self.auth.session_lifespan / 2
    }
}

/// Serde helpers representing `Duration` as (fractional) seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

mod serde_secs_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}
