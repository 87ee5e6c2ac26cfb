//! rustls client configuration for each verification policy.
//!
//! - `required`: webpki verification against the bundled Mozilla roots.
//! - `optional`: the same verification, but failures are recorded as
//!   warnings and the certificate is accepted.
//! - `disabled`: every certificate is accepted.

use std::sync::{Arc, Mutex, PoisonError};

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::IoError;
use crate::flags::Verify;

/// Verification failures collected by an `optional` handshake.
pub(crate) type VerifyWarnings = Arc<Mutex<Vec<String>>>;

/// Crypto provider and trust roots shared by every connect attempt.
#[derive(Debug, Clone)]
pub(crate) struct TlsSettings {
    provider: Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self::with_roots(RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        ))
    }
}

impl TlsSettings {
    pub(crate) fn with_roots(roots: RootCertStore) -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            roots: Arc::new(roots),
        }
    }

    /// Build a client session for `host` under `verify`.
    ///
    /// The returned warnings list is filled during the handshake when the
    /// policy is `optional`; it stays empty otherwise.
    pub(crate) fn client_session(
        &self,
        host: &str,
        verify: Verify,
    ) -> Result<(ClientConnection, VerifyWarnings), IoError> {
        let warnings = VerifyWarnings::default();

        let builder = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| IoError::TlsHandshake(e.to_string()))?;

        let config = match verify {
            Verify::Required => builder
                .with_root_certificates(Arc::clone(&self.roots))
                .with_no_client_auth(),
            Verify::Optional => {
                let inner = WebPkiServerVerifier::builder_with_provider(
                    Arc::clone(&self.roots),
                    Arc::clone(&self.provider),
                )
                .build()
                .map_err(|e| IoError::TlsHandshake(e.to_string()))?;
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(LenientVerifier {
                        inner,
                        warnings: Arc::clone(&warnings),
                    }))
                    .with_no_client_auth()
            }
            Verify::Disabled => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier {
                    provider: Arc::clone(&self.provider),
                }))
                .with_no_client_auth(),
        };

        let name = ServerName::try_from(host.to_string())
            .map_err(|e| IoError::TlsHandshake(format!("invalid server name '{host}': {e}")))?;
        let session = ClientConnection::new(Arc::new(config), name)
            .map_err(|e| IoError::TlsHandshake(e.to_string()))?;

        Ok((session, warnings))
    }
}

/// Map a rustls failure onto the handshake / verification split.
pub(crate) fn handshake_error(err: rustls::Error) -> IoError {
    match err {
        e @ (rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented) => {
            IoError::TlsVerification(e.to_string())
        }
        e => IoError::TlsHandshake(e.to_string()),
    }
}

// ── Verifiers ────────────────────────────────────────────────────

/// Runs webpki verification but never rejects the certificate.
#[derive(Debug)]
struct LenientVerifier {
    inner: Arc<WebPkiServerVerifier>,
    warnings: VerifyWarnings,
}

impl ServerCertVerifier for LenientVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Err(e) =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            self.warnings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(e.to_string());
        }
        Ok(ServerCertVerified::assertion())
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

/// Accepts any certificate.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
