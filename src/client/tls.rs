// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-side certificate verification policies. Servers present
//! self-signed certificates, so trust is either pinned to a stored
//! fingerprint or (explicitly) waived.

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::{
    DigitallySignedStruct, SignatureScheme,
    client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    },
    crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use sha2::{Digest, Sha256};

use crate::client::TrustPolicy;

#[derive(Debug)]
struct FingerprintVerifier {
    /// `None` means blind trust.
    pinned: Option<[u8; 32]>,
    supported: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(pinned) = &self.pinned {
            let fingerprint: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
            if &fingerprint != pinned {
                return Err(rustls::Error::General(
                    "server certificate does not match the pinned fingerprint"
                        .to_string(),
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Builds the rustls client config for the given trust policy.
pub fn build_client_config(trust: &TrustPolicy) -> Result<rustls::ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let supported = provider.signature_verification_algorithms;

    let pinned = match trust {
        TrustPolicy::BlindTrust => None,
        TrustPolicy::PinnedFingerprint(fp) => Some(*fp),
    };
    let verifier = FingerprintVerifier { pinned, supported };

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .context("failed to select TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}
