//! # Transport Security
//!
//! TLS material for the directory's QUIC transport.
//!
//! ## Identity Model
//!
//! - **Server identity = public key**: the directory server holds a persistent
//!   Ed25519 keypair; its 32-byte public key is the identity clients pin.
//! - **Self-signed certs**: both sides present a certificate generated from
//!   their own keypair. No PKI or CA is involved.
//! - **Pinning via SNI**: the client encodes the expected server identity in
//!   the TLS server name; [`Ed25519CertVerifier`] rejects any certificate
//!   whose public key differs.
//!
//! Client certificates are checked for a well-formed Ed25519 key only. The
//! caller identity used for authorization travels in the request body, so a
//! fresh client keypair per invocation is fine.
//!
//! The `dangerous()` rustls APIs are used on purpose: verification binds the
//! certificate to a known public key rather than to a CA chain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Identity, Keypair};

/// Lazily-initialized crypto provider for rustls (ring backend).
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for directory connections.
pub const ALPN: &[u8] = b"fleetdir";

/// Connections with no traffic for this long are closed by either side.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Concurrent request streams per client connection.
const MAX_CONCURRENT_STREAMS: u32 = 64;

pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();
    let public_key = keypair.public_key_bytes();

    // PKCS#8 v1 wrapper for a raw Ed25519 seed (RFC 8410).
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec!["fleetdir".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        IDLE_TIMEOUT
            .try_into()
            .context("idle timeout out of range")?,
    ));
    transport.max_concurrent_bidi_streams(MAX_CONCURRENT_STREAMS.into());
    transport.max_concurrent_uni_streams(0u32.into());
    Ok(transport)
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let client_cert_verifier = Arc::new(Ed25519ClientCertVerifier);
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_cert_verifier)
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519CertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));

    Ok(client_config)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// Identity of the peer certificate on an established connection.
pub fn extract_verified_identity(connection: &quinn::Connection) -> Option<Identity> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<rustls::pki_types::CertificateDer> = peer_identity.downcast_ref()?;
    let cert_der = certs.first()?.as_ref();
    let public_key = extract_public_key_from_cert(cert_der)?;
    Some(Identity::from_bytes(public_key))
}

/// TLS server name carrying `identity`. A hex public key is 64 characters,
/// past the 63-byte DNS label limit, so it is split into two labels.
pub fn identity_to_sni(identity: &Identity) -> String {
    let hex = identity.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

pub(crate) fn parse_identity_from_sni(sni: &str) -> Option<Identity> {
    let hex_str: String = sni.split('.').collect();
    Identity::from_hex(&hex_str).ok()
}

fn invalid_cert(error: rustls::CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(error)
}

#[derive(Debug)]
struct Ed25519ClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for Ed25519ClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(invalid_cert(rustls::CertificateError::BadEncoding))?;
        if !Identity::from_bytes(public_key).is_valid() {
            return Err(invalid_cert(rustls::CertificateError::ApplicationVerificationFailure));
        }
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Accepts the server certificate only if its key matches the identity
/// encoded in the server name.
#[derive(Debug)]
struct Ed25519CertVerifier;

impl rustls::client::danger::ServerCertVerifier for Ed25519CertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let rustls::pki_types::ServerName::DnsName(name) = server_name else {
            return Err(invalid_cert(rustls::CertificateError::ApplicationVerificationFailure));
        };
        let expected = parse_identity_from_sni(name.as_ref())
            .ok_or(invalid_cert(rustls::CertificateError::BadEncoding))?;

        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(invalid_cert(rustls::CertificateError::BadEncoding))?;
        if Identity::from_bytes(public_key) != expected {
            return Err(invalid_cert(rustls::CertificateError::NotValidForName));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::client::danger::ServerCertVerifier;
    use rustls::pki_types::{ServerName, UnixTime};

    #[test]
    fn certificate_carries_server_public_key() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            let (certs, _key) = generate_ed25519_cert(&keypair).unwrap();
            let extracted = extract_public_key_from_cert(certs[0].as_ref()).unwrap();
            assert_eq!(extracted, *keypair.identity().as_bytes());
        }
    }

    #[test]
    fn sni_round_trip() {
        let identity = Keypair::generate().identity();
        let sni = identity_to_sni(&identity);
        assert!(sni.split('.').all(|label| label.len() <= 63));
        assert_eq!(parse_identity_from_sni(&sni), Some(identity));
    }

    #[test]
    fn malformed_sni_rejected() {
        assert!(parse_identity_from_sni("localhost").is_none());
        assert!(parse_identity_from_sni("abcd.ef").is_none());
    }

    #[test]
    fn server_verifier_pins_identity() {
        let server = Keypair::generate();
        let (certs, _) = generate_ed25519_cert(&server).unwrap();

        let expected = ServerName::try_from(identity_to_sni(&server.identity())).unwrap();
        assert!(
            Ed25519CertVerifier
                .verify_server_cert(&certs[0], &[], &expected, &[], UnixTime::now())
                .is_ok()
        );

        let other = ServerName::try_from(identity_to_sni(&Keypair::generate().identity())).unwrap();
        assert!(
            Ed25519CertVerifier
                .verify_server_cert(&certs[0], &[], &other, &[], UnixTime::now())
                .is_err()
        );
    }

    #[test]
    fn configs_build() {
        let keypair = Keypair::generate();
        let (certs, key) = generate_ed25519_cert(&keypair).unwrap();
        create_server_config(certs.clone(), key.clone_key()).unwrap();
        create_client_config(certs, key).unwrap();
    }
}
