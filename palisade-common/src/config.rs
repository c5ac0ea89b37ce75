//! The node configuration value object.
//!
//! All tunables consumed by the core are collected here and passed into
//! constructors explicitly. There are no process-global settings.

use std::{collections::HashSet, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::x500::LegalName;

/// How long the registration client waits between doorman polls by default.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// The signature scheme used for generated key pairs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureScheme {
    /// ECDSA over secp256r1 with SHA-256. The default; universally accepted
    /// by TLS stacks.
    #[default]
    EcdsaP256Sha256,
    /// Ed25519.
    Ed25519,
}

/// Configuration consumed by enrolment and the peer channels.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// This node's asserted identity.
    pub my_legal_name: LegalName,
    /// Contact email submitted with the certificate signing request.
    pub email_address: Option<String>,
    /// Directory holding the credential stores and the outstanding
    /// request-id file.
    pub certificates_directory: PathBuf,
    /// Password protecting the node and SSL keystores.
    pub key_store_password: String,
    /// Password protecting private-key entries inside the keystores.
    /// `None` means "same as `key_store_password`".
    pub private_key_password: Option<String>,
    /// Password protecting the truststore.
    pub trust_store_password: String,
    /// Peer legal names this node will accept on handshake. `None` accepts
    /// any peer with a chain-valid certificate. An empty set accepts no one.
    pub allowed_remote_legal_names: Option<HashSet<LegalName>>,
    /// Wait between doorman polls while a certificate request is pending.
    pub poll_interval: Duration,
    /// Overall deadline for enrolment. `None` polls indefinitely.
    pub enrolment_timeout: Option<Duration>,
    /// Scheme for the generated TLS key pair.
    pub tls_signature_scheme: SignatureScheme,
}

impl NodeConfig {
    /// A config with defaults for everything but the identity and directory.
    pub fn new(
        my_legal_name: LegalName,
        certificates_directory: impl Into<PathBuf>,
        key_store_password: impl Into<String>,
        trust_store_password: impl Into<String>,
    ) -> Self {
        Self {
            my_legal_name,
            email_address: None,
            certificates_directory: certificates_directory.into(),
            key_store_password: key_store_password.into(),
            private_key_password: None,
            trust_store_password: trust_store_password.into(),
            allowed_remote_legal_names: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            enrolment_timeout: None,
            tls_signature_scheme: SignatureScheme::default(),
        }
    }

    /// The password for private-key entries, falling back to the keystore
    /// password when no separate one is configured.
    pub fn private_key_password(&self) -> &str {
        self.private_key_password
            .as_deref()
            .unwrap_or(&self.key_store_password)
    }
}
