//! TLS configuration for the QUIC transport.
//!
//! ALPN protocol: "switchboard/1".
//! Clients verify dispatchers against a configured CA certificate when one
//! is given, and skip verification otherwise.

use std::sync::Arc;
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// ALPN protocol identifier.
pub const ALPN_SWITCHBOARD: &[u8] = b"switchboard/1";

/// Server name used when the authority host is an IP literal.
pub const DEFAULT_SERVER_NAME: &str = "dispatcher.switchboard.local";

/// QUIC timing knobs shared by client and server configs.
#[derive(Debug, Clone, Copy)]
pub struct QuicTimings {
    pub idle_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for QuicTimings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            keep_alive: Duration::from_secs(10),
        }
    }
}

fn transport_config(timings: QuicTimings) -> Result<quinn::TransportConfig, BoxError> {
    let mut transport = quinn::TransportConfig::default();
    let idle = quinn::IdleTimeout::try_from(timings.idle_timeout)
        .map_err(|e| format!("idle timeout out of range: {e}"))?;
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(Some(timings.keep_alive));
    Ok(transport)
}

/// Generate a self-signed X.509 certificate from an Ed25519 PKCS#8 DER keypair.
///
/// Returns (certificate DER bytes, private key DER bytes). Used by local
/// dispatcher stubs.
pub fn generate_self_signed_cert(
    pkcs8_der: &[u8],
    server_name: &str,
) -> Result<(Vec<u8>, Vec<u8>), BoxError> {
    let pkcs8_key = rustls::pki_types::PrivatePkcs8KeyDer::from(pkcs8_der.to_vec());
    let key_pair = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_key, &rcgen::PKCS_ED25519)?;

    let mut params = rcgen::CertificateParams::new(vec![server_name.to_string()])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "switchboard-dispatcher");

    let cert = params.self_signed(&key_pair)?;

    Ok((cert.der().to_vec(), pkcs8_der.to_vec()))
}

/// Build a QUIC server config with the given certificate and private key.
pub fn build_server_config(
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    timings: QuicTimings,
) -> Result<quinn::ServerConfig, BoxError> {
    let cert = rustls::pki_types::CertificateDer::from(cert_der);
    let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
        .map_err(|e| format!("invalid private key DER: {e}"))?;

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;

    server_crypto.alpn_protocols = vec![ALPN_SWITCHBOARD.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));
    server_config.transport_config(Arc::new(transport_config(timings)?));

    Ok(server_config)
}

/// Build a QUIC client config.
///
/// With `ca_der` the dispatcher certificate must chain to it; without, any
/// certificate is accepted.
pub fn build_client_config(
    ca_der: Option<Vec<u8>>,
    timings: QuicTimings,
) -> Result<quinn::ClientConfig, BoxError> {
    let mut client_crypto = match ca_der {
        Some(der) => {
            let mut roots = rustls::RootCertStore::empty();
            roots.add(rustls::pki_types::CertificateDer::from(der))?;
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        None => {
            tracing::debug!("client config built without certificate verification");
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        }
    };

    client_crypto.alpn_protocols = vec![ALPN_SWITCHBOARD.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
    ));
    client_config.transport_config(Arc::new(transport_config(timings)?));

    Ok(client_config)
}

/// Certificate verifier that accepts any server certificate.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}
