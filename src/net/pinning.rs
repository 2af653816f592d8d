//! Leaf certificate pinning on top of WebPKI chain validation.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{SecurityError, SecurityResult};

/// SHA-256 fingerprint allow-list for server leaf certificates.
#[derive(Debug, Clone, Default)]
pub struct CertificatePinner {
    pins: HashSet<[u8; 32]>,
}

impl CertificatePinner {
    /// Parse hex fingerprints, colons optional.
    pub fn new(pins: &[String]) -> SecurityResult<Self> {
        let mut parsed = HashSet::with_capacity(pins.len());
        for pin in pins {
            let cleaned: String = pin.chars().filter(|c| *c != ':').collect();
            let bytes = hex::decode(&cleaned)
                .map_err(|e| SecurityError::InvalidConfig(format!("certificate pin '{}': {}", pin, e)))?;
            let digest: [u8; 32] = bytes.try_into().map_err(|_| {
                SecurityError::InvalidConfig(format!("certificate pin '{}' is not 32 bytes", pin))
            })?;
            parsed.insert(digest);
        }
        Ok(Self { pins: parsed })
    }

    /// No pins configured means chain validation alone decides.
    pub fn is_enabled(&self) -> bool {
        !self.pins.is_empty()
    }

    pub fn fingerprint(der: &[u8]) -> String {
        hex::encode(Sha256::digest(der))
    }

    pub fn check(&self, der: &[u8]) -> SecurityResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let digest: [u8; 32] = Sha256::digest(der).into();
        if self.pins.contains(&digest) {
            Ok(())
        } else {
            Err(SecurityError::CertificatePinMismatch {
                fingerprint: hex::encode(digest),
            })
        }
    }
}

/// Fingerprint of the last leaf rejected by a [`PinnedVerifier`].
pub type PinMismatchSlot = Arc<Mutex<Option<String>>>;

/// Delegates chain and signature checks to WebPKI, then enforces the pin set.
#[derive(Debug)]
pub struct PinnedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pinner: CertificatePinner,
    mismatch: PinMismatchSlot,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        if let Err(SecurityError::CertificatePinMismatch { fingerprint }) =
            self.pinner.check(end_entity.as_ref())
        {
            tracing::error!(fingerprint = %fingerprint, "Certificate pin mismatch");
            *self.mismatch.lock().unwrap_or_else(|e| e.into_inner()) = Some(fingerprint.clone());
            return Err(rustls::Error::General(format!(
                "certificate pin mismatch: {}",
                fingerprint
            )));
        }
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Client TLS config trusting the webpki roots and enforcing `pinner`.
pub fn pinned_client_config(
    pinner: CertificatePinner,
) -> SecurityResult<(Arc<ClientConfig>, PinMismatchSlot)> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| SecurityError::InvalidConfig(format!("TLS verifier: {}", e)))?;
    let mismatch = PinMismatchSlot::default();
    let verifier = PinnedVerifier {
        inner,
        pinner,
        mismatch: Arc::clone(&mismatch),
    };

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SecurityError::InvalidConfig(format!("TLS protocol versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok((Arc::new(config), mismatch))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &[u8] = b"not really DER but hashed all the same";

    #[test]
    fn test_matching_pin_accepted() {
        let fp = CertificatePinner::fingerprint(CERT);
        let pinner = CertificatePinner::new(&[fp]).unwrap();
        assert!(pinner.check(CERT).is_ok());
    }

    #[test]
    fn test_colon_form_accepted() {
        let fp = CertificatePinner::fingerprint(CERT);
        let colon = fp
            .as_bytes()
            .chunks(2)
            .map(|c| std::str::from_utf8(c).unwrap().to_uppercase())
            .collect::<Vec<_>>()
            .join(":");
        let pinner = CertificatePinner::new(&[colon]).unwrap();
        assert!(pinner.check(CERT).is_ok());
    }

    #[test]
    fn test_mismatch_is_fatal() {
        let pinner = CertificatePinner::new(&["00".repeat(32)]).unwrap();
        let err = pinner.check(CERT).unwrap_err();
        match &err {
            SecurityError::CertificatePinMismatch { fingerprint } => {
                assert_eq!(fingerprint, &CertificatePinner::fingerprint(CERT));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_no_pins_allows_any() {
        let pinner = CertificatePinner::default();
        assert!(!pinner.is_enabled());
        assert!(pinner.check(CERT).is_ok());
    }

    #[test]
    fn test_bad_pin_rejected() {
        assert!(CertificatePinner::new(&["abcd".into()]).is_err());
        assert!(CertificatePinner::new(&["zz".repeat(32)]).is_err());
    }

    #[test]
    fn test_client_config_builds() {
        let pinner = CertificatePinner::new(&["ab".repeat(32)]).unwrap();
        let (_config, slot) = pinned_client_config(pinner).unwrap();
        assert!(slot.lock().unwrap().is_none());
    }
}
