// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Self-signed credential bootstrap, rustls server config construction and
//! on-disk certificate rotation.

use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result, ensure};
use p256::{
    ecdsa::SigningKey,
    pkcs8::DecodePrivateKey,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::{
    cfg::config::TlsConfig,
    tlscreds::rollover::{append_to_ledger, generate_rollover_token, sha256_hex},
};

/// Validity of a freshly generated self-signed certificate.
const SELF_SIGNED_VALIDITY_DAYS: i64 = 365;

/// Loaded credential pair, in both rustls and p256 forms.
pub struct TlsCredentials {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// DER of the leaf certificate.
    pub cert_der: Vec<u8>,
    /// The same private key for rollover-token signatures.
    pub signing_key: SigningKey,
}

impl TlsCredentials {
    pub fn fingerprint(&self) -> String {
        sha256_hex(&self.cert_der)
    }
}

/// Generates an ECDSA-P256 self-signed certificate with the given DNS SAN
/// and writes both PEM files. Partially written files are removed on error.
pub fn generate_self_signed_credentials(
    cert_path: &Path,
    key_path: &Path,
    dns_name: &str,
) -> Result<()> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .context("failed to generate ECDSA-P256 keypair")?;

    let mut params = rcgen::CertificateParams::new(vec![dns_name.to_string()])
        .context("invalid certificate SAN")?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, dns_name);
    params.not_before = OffsetDateTime::now_utc();
    params.not_after =
        params.not_before + TimeDuration::days(SELF_SIGNED_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    if let Some(parent) = cert_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {parent:?}"))?;
    }

    let cert_existed = cert_path.exists();
    let key_existed = key_path.exists();
    let written = fs::write(cert_path, cert.pem())
        .and_then(|_| fs::write(key_path, key_pair.serialize_pem()));
    if let Err(e) = written {
        if !cert_existed {
            let _ = fs::remove_file(cert_path);
        }
        if !key_existed {
            let _ = fs::remove_file(key_path);
        }
        return Err(e).context("failed to write credential files");
    }
    Ok(())
}

/// Loads the PEM pair from disk.
pub fn load_credentials(cert_path: &Path, key_path: &Path) -> Result<TlsCredentials> {
    let cert_pem = fs::read(cert_path)
        .with_context(|| format!("certificate file {cert_path:?} not found"))?;
    let key_pem = fs::read_to_string(key_path)
        .with_context(|| format!("key file {key_path:?} not found"))?;

    let cert_chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<_, _>>()
            .context("failed to parse certificate PEM")?;
    ensure!(!cert_chain.is_empty(), "no certificate in {cert_path:?}");
    let cert_der = cert_chain[0].as_ref().to_vec();

    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .context("failed to parse private key PEM")?
        .context("no private key in key file")?;

    let signing_key = SigningKey::from_pkcs8_pem(&key_pem)
        .context("private key is not an ECDSA-P256 PKCS#8 key")?;

    Ok(TlsCredentials {
        cert_chain,
        key,
        cert_der,
        signing_key,
    })
}

/// Loads existing credentials, generating self-signed ones on first boot.
pub fn ensure_credentials(cfg: &TlsConfig) -> Result<TlsCredentials> {
    let cert_path = cfg.certificate_path();
    let key_path = cfg.key_path();
    if !(cert_path.is_file() && key_path.is_file()) {
        generate_self_signed_credentials(&cert_path, &key_path, &cfg.dns_name)?;
    }
    load_credentials(&cert_path, &key_path)
}

/// Builds the server-auth-only rustls config: TLS 1.2+, optional cipher
/// allow-list, no client certificate verification.
pub fn build_server_config(
    creds: &TlsCredentials,
    ciphers: &[String],
) -> Result<rustls::ServerConfig> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !ciphers.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            ciphers.iter().any(|allowed| *allowed == name)
        });
        ensure!(
            !provider.cipher_suites.is_empty(),
            "cipher allow-list matches no supported suite"
        );
    }

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .context("failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(creds.cert_chain.clone(), creds.key.clone_key())
        .context("certificate/key mismatch")?;
    Ok(config)
}

/// Rotates the on-disk credentials: generates a new pair, replaces the PEM
/// files, then appends a signed rollover token keyed by the old certificate
/// fingerprint. The accept loop picks the change up via the mtime poll.
pub fn rotate_server_credentials(
    cfg: &TlsConfig,
    hostname: &str,
    port: u16,
    reason: &str,
) -> Result<()> {
    let cert_path = cfg.certificate_path();
    let key_path = cfg.key_path();

    let old = load_credentials(&cert_path, &key_path)
        .context("cannot rotate before credentials exist")?;

    generate_self_signed_credentials(&cert_path, &key_path, &cfg.dns_name)?;
    let new = load_credentials(&cert_path, &key_path)?;

    let (fingerprint, token) = generate_rollover_token(
        &old.signing_key,
        &old.cert_der,
        new.signing_key.verifying_key(),
        hostname,
        port,
        cfg.rollover_grace_window.as_secs_f64(),
        cfg.rollover_nonce_length,
        reason,
    )?;
    append_to_ledger(
        &cfg.rollover_path(),
        fingerprint,
        token,
        cfg.rollover_history_length,
    )?;
    Ok(())
}
