//! mTLS certificate management for the database tunnel.
//!
//! Cluster nodes authenticate each other with self-signed certificates
//! rather than a CA chain. A dialing node presents its own server
//! certificate as the client identity and pins the shared cluster
//! certificate on the other end; the accepting endpoint presents the
//! cluster certificate and admits only client certificates found in its
//! trusted set.

use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use thiserror::Error;
use tracing::info;

/// Errors raised while parsing certificates or building TLS configs.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("invalid PEM data: {0}")]
    Pem(String),

    #[error("no certificate found in PEM data")]
    NoCertificate,

    #[error("no private key found in PEM data")]
    NoPrivateKey,

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// A PEM-encoded certificate and private key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertKeyPair {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl CertKeyPair {
    /// Parse the certificate into its DER form.
    pub fn certificate(&self) -> Result<CertificateDer<'static>, TlsError> {
        parse_certificate(&self.cert_pem)
    }

    /// Parse the private key into its DER form.
    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>, TlsError> {
        let mut reader = self.key_pem.as_bytes();
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| TlsError::Pem(e.to_string()))?
            .ok_or(TlsError::NoPrivateKey)
    }
}

/// Parse the first certificate out of a PEM string.
pub fn parse_certificate(pem: &str) -> Result<CertificateDer<'static>, TlsError> {
    let mut reader = pem.as_bytes();
    rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or(TlsError::NoCertificate)?
        .map_err(|e| TlsError::Pem(e.to_string()))
}

/// Generate a self-signed certificate for a cluster node or for the
/// cluster itself.
///
/// `addresses` become subject alternative names: IP literals as IP SANs,
/// anything else as DNS names.
pub fn generate_cert(common_name: &str, addresses: &[String]) -> anyhow::Result<CertKeyPair> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "WarpGrid");
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    for addr in addresses {
        if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(rcgen::SanType::DnsName(addr.clone().try_into()?));
        }
    }

    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    info!(%common_name, sans = addresses.len(), "generated self-signed certificate");

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client config for dialing a peer: presents `identity` and accepts only
/// a server presenting exactly `peer`.
pub fn client_config(
    identity: &CertKeyPair,
    peer: CertificateDer<'static>,
) -> Result<Arc<ClientConfig>, TlsError> {
    let provider = provider();
    let verifier = Arc::new(PinnedServerVerifier {
        expected: peer,
        algorithms: provider.signature_verification_algorithms,
    });

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(vec![identity.certificate()?], identity.private_key()?)?;

    Ok(Arc::new(config))
}

/// Server config for the inbound endpoint: presents `identity` and
/// requires a client certificate from `trusted`.
pub fn server_config(
    identity: &CertKeyPair,
    trusted: Vec<CertificateDer<'static>>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = provider();
    let verifier = Arc::new(TrustedClientVerifier {
        trusted,
        algorithms: provider.signature_verification_algorithms,
    });

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![identity.certificate()?], identity.private_key()?)?;

    Ok(Arc::new(config))
}

// ── Verifiers ────────────────────────────────────────────────────────

/// Accepts exactly one server certificate, ignoring names and chains.
#[derive(Debug)]
struct PinnedServerVerifier {
    expected: CertificateDer<'static>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.expected.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Accepts client certificates that appear verbatim in the trusted set.
#[derive(Debug)]
struct TrustedClientVerifier {
    trusted: Vec<CertificateDer<'static>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for TrustedClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if self
            .trusted
            .iter()
            .any(|cert| cert.as_ref() == end_entity.as_ref())
        {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
