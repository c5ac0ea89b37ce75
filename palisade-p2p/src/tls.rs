//! TLS presets, credential loading, and identity verifiers.
//!
//! Peers authenticate each other with the certificate chains enrolment
//! installed: both sides present their TLS leaf and validate the other's
//! chain against exactly the zone root from the truststore. Peer identity
//! is the X.500 subject of the presented leaf, not a DNS name, so the
//! client side uses a verifier that builds the chain with webpki but skips
//! hostname binding entirely.

use std::{
    path::Path,
    sync::{Arc, LazyLock},
};

use palisade_common::{
    config::NodeConfig,
    constants::{CLIENT_TLS_ALIAS, ROOT_CA_ALIAS, SSL_KEYSTORE_FILE, TRUSTSTORE_FILE},
    x500::LegalName,
};
use palisade_pki::{
    cert,
    keystore::{CredentialStore, StoreError},
    types::DerCert,
};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    },
    crypto::{CryptoProvider, WebPkiSupportedAlgorithms},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    server::WebPkiClientVerifier,
};
use webpki::{EndEntityCert, KeyUsage, anchor_from_trusted_cert};
use thiserror::Error;
use x509_parser::{certificate::X509Certificate, prelude::FromDer};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("credential store problem: {0}")]
    Store(#[from] StoreError),
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("client verifier rejected: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error("peer presented an unusable certificate: {0}")]
    BadPeerCert(String),
}

/// TLS 1.3 only.
pub static TLS_PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13];
static CIPHER_SUITES: &[rustls::SupportedCipherSuite] =
    &[rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256];
static KEY_EXCHANGE_GROUPS: &[&dyn rustls::crypto::SupportedKxGroup] =
    &[rustls::crypto::ring::kx_group::X25519];

/// The signature schemes zone certificates can carry.
pub static SIGNATURE_ALGORITHMS: WebPkiSupportedAlgorithms =
    WebPkiSupportedAlgorithms {
        all: &[
            webpki::ring::ECDSA_P256_SHA256,
            webpki::ring::ED25519,
        ],
        mapping: &[
            (
                rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                &[webpki::ring::ECDSA_P256_SHA256],
            ),
            (
                rustls::SignatureScheme::ED25519,
                &[webpki::ring::ED25519],
            ),
        ],
    };

/// Our [`CryptoProvider`]. Use this instead of
/// [`rustls::crypto::ring::default_provider`].
pub static CRYPTO_PROVIDER: LazyLock<Arc<CryptoProvider>> =
    LazyLock::new(|| {
        let mut provider = rustls::crypto::ring::default_provider();
        CIPHER_SUITES.clone_into(&mut provider.cipher_suites);
        KEY_EXCHANGE_GROUPS.clone_into(&mut provider.kx_groups);
        provider.signature_verification_algorithms = SIGNATURE_ALGORITHMS;
        Arc::new(provider)
    });

/// Everything the transport needs out of the credential stores.
pub struct TlsMaterial {
    pub local_legal_name: LegalName,
    /// Leaf first, then the issuing chain.
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// The zone root, alone.
    pub roots: Arc<RootCertStore>,
    /// The root's raw DER, for the no-hostname verifier.
    pub root_der: DerCert,
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        Self {
            local_legal_name: self.local_legal_name.clone(),
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
            roots: self.roots.clone(),
            root_der: self.root_der.clone(),
        }
    }
}

impl TlsMaterial {
    /// Load the SSL keystore and truststore written by enrolment.
    pub fn load(config: &NodeConfig) -> Result<Self, TlsError> {
        let dir: &Path = &config.certificates_directory;

        let ssl_store = CredentialStore::load(
            &dir.join(SSL_KEYSTORE_FILE),
            &config.key_store_password,
        )?;
        let (key_der, chain) = ssl_store
            .get_key_entry(CLIENT_TLS_ALIAS, config.private_key_password())?;

        let truststore = CredentialStore::load(
            &dir.join(TRUSTSTORE_FILE),
            &config.trust_store_password,
        )?;
        let root_der = truststore.get_cert(ROOT_CA_ALIAS)?;

        Self::from_parts(
            config.my_legal_name.clone(),
            chain,
            key_der.into(),
            root_der,
        )
    }

    /// Assemble material from in-memory parts.
    pub fn from_parts(
        local_legal_name: LegalName,
        chain: Vec<DerCert>,
        key: PrivateKeyDer<'static>,
        root_der: DerCert,
    ) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::from(root_der.clone()))
            .map_err(TlsError::Rustls)?;
        let cert_chain = chain.into_iter().map(CertificateDer::from).collect();
        Ok(Self {
            local_legal_name,
            cert_chain,
            key,
            roots: Arc::new(roots),
            root_der,
        })
    }
}

/// Server-side TLS config: require and verify a client certificate chain
/// rooted at the zone root.
pub fn server_config(material: &TlsMaterial) -> Result<ServerConfig, TlsError> {
    let client_verifier = WebPkiClientVerifier::builder_with_provider(
        material.roots.clone(),
        CRYPTO_PROVIDER.clone(),
    )
    .build()?;
    let config = ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(TLS_PROTOCOL_VERSIONS)?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(material.cert_chain.clone(), material.key.clone_key())?;
    Ok(config)
}

/// Client-side TLS config: present our chain, verify the server's against
/// the zone root without hostname binding.
pub fn client_config(material: &TlsMaterial) -> Result<ClientConfig, TlsError> {
    let verifier = Arc::new(PeerChainVerifier {
        root_der: CertificateDer::from(material.root_der.clone()),
    });
    let config = ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(TLS_PROTOCOL_VERSIONS)?
        .dangerous() // Custom verifier requires the "dangerous" opt-in
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(
            material.cert_chain.clone(),
            material.key.clone_key(),
        )?;
    Ok(config)
}

/// Parse the legal name out of a peer's leaf certificate.
pub fn peer_legal_name(cert: &CertificateDer<'_>) -> Result<LegalName, TlsError> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| TlsError::BadPeerCert(e.to_string()))?;
    cert::legal_name_from_x509(parsed.subject())
        .map_err(|e| TlsError::BadPeerCert(e.to_string()))
}

/// A [`ServerCertVerifier`] that builds and verifies the peer's chain
/// against exactly the zone root but performs no hostname check: peers are
/// addressed by IP and identified by the X.500 subject of their leaf.
#[derive(Debug)]
struct PeerChainVerifier {
    root_der: CertificateDer<'static>,
}

fn untrusted(detail: impl std::fmt::Display) -> rustls::Error {
    rustls::Error::General(format!("peer chain untrusted: {detail}"))
}

impl ServerCertVerifier for PeerChainVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let anchor =
            anchor_from_trusted_cert(&self.root_der).map_err(untrusted)?;
        let cert = EndEntityCert::try_from(end_entity).map_err(untrusted)?;
        cert.verify_for_usage(
            SIGNATURE_ALGORITHMS.all,
            &[anchor],
            intermediates,
            now,
            KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(untrusted)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::PeerIncompatible(
            rustls::PeerIncompatible::Tls12NotOffered,
        ))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &SIGNATURE_ALGORITHMS,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        SIGNATURE_ALGORITHMS
            .mapping
            .iter()
            .map(|(scheme, _verify_algs)| *scheme)
            .collect()
    }
}
