//! Signature-scheme-tagged key pairs.

use palisade_common::config::SignatureScheme;
use rustls::pki_types::PrivatePkcs8KeyDer;
use secrecy::{ExposeSecret, Secret};
use thiserror::Error;

use crate::types::DerPkcs8Key;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to generate key pair: {0}")]
    Generate(rcgen::Error),
    #[error("failed deserializing PKCS#8-encoded key pair: {0}")]
    Deserialize(rcgen::Error),
}

/// A key pair of a configured [`SignatureScheme`].
///
/// The PKCS#8 DER encoding is the persistence form and is held behind
/// [`Secret`] so it never shows up in logs. Once a key pair has been [`put`]
/// into a credential store the private half never leaves it again except via
/// [`get_key_entry`].
///
/// [`put`]: crate::keystore::CredentialStore::put_key_entry
/// [`get_key_entry`]: crate::keystore::CredentialStore::get_key_entry
pub struct NodeKeyPair {
    scheme: SignatureScheme,
    key_pair: rcgen::KeyPair,
    pkcs8_der: Secret<Vec<u8>>,
}

fn rcgen_alg(
    scheme: SignatureScheme,
) -> &'static rcgen::SignatureAlgorithm {
    match scheme {
        SignatureScheme::EcdsaP256Sha256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        SignatureScheme::Ed25519 => &rcgen::PKCS_ED25519,
    }
}

impl NodeKeyPair {
    /// Generate a fresh key pair of the given scheme.
    pub fn generate(scheme: SignatureScheme) -> Result<Self, KeyError> {
        let key_pair = rcgen::KeyPair::generate_for(rcgen_alg(scheme))
            .map_err(KeyError::Generate)?;
        let pkcs8_der = Secret::new(key_pair.serialize_der());
        Ok(Self {
            scheme,
            key_pair,
            pkcs8_der,
        })
    }

    /// Deserialize a key pair from PKCS#8 DER, checking it matches `scheme`.
    pub fn from_pkcs8_der(
        scheme: SignatureScheme,
        der: &DerPkcs8Key,
    ) -> Result<Self, KeyError> {
        let pkcs8 = PrivatePkcs8KeyDer::from(der.as_bytes());
        let key_pair =
            rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, rcgen_alg(scheme))
                .map_err(KeyError::Deserialize)?;
        Ok(Self {
            scheme,
            key_pair,
            pkcs8_der: Secret::new(der.as_bytes().to_vec()),
        })
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    /// The inner [`rcgen::KeyPair`], for signing certificates and requests.
    pub fn rcgen(&self) -> &rcgen::KeyPair {
        &self.key_pair
    }

    /// The SubjectPublicKeyInfo DER of the public half.
    pub fn public_key_der(&self) -> Vec<u8> {
        rcgen::PublicKeyData::subject_public_key_info(&self.key_pair)
    }

    /// Serialize the private half to PKCS#8 DER for a credential store.
    pub fn serialize_pkcs8_der(&self) -> DerPkcs8Key {
        DerPkcs8Key(self.pkcs8_der.expose_secret().clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_keypair_pkcs8_der_roundtrip() {
        for scheme in
            [SignatureScheme::EcdsaP256Sha256, SignatureScheme::Ed25519]
        {
            let keypair_1 = NodeKeyPair::generate(scheme).unwrap();
            let der_1 = keypair_1.serialize_pkcs8_der();
            let keypair_2 =
                NodeKeyPair::from_pkcs8_der(scheme, &der_1).unwrap();
            assert_eq!(
                keypair_1.public_key_der(),
                keypair_2.public_key_der(),
            );
        }
    }

    #[test]
    fn test_scheme_mismatch_rejected() {
        let ed = NodeKeyPair::generate(SignatureScheme::Ed25519).unwrap();
        let der = ed.serialize_pkcs8_der();
        assert!(
            NodeKeyPair::from_pkcs8_der(
                SignatureScheme::EcdsaP256Sha256,
                &der,
            )
            .is_err()
        );
    }
}
