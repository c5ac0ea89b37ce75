//! PKCS#10 certificate signing requests.
//!
//! The node submits exactly one CSR in its lifetime, covering the key pair
//! behind its self-signed placeholder. The subject is the node's legal name
//! plus, when configured, a PKCS#9 `emailAddress` attribute so the doorman
//! has a contact for manual review.

use palisade_common::x500::LegalName;
use rcgen::{CertificateParams, DnType, DnValue};
use thiserror::Error;
use x509_parser::{
    certification_request::X509CertificationRequest, prelude::FromDer,
};

use crate::{
    cert::{self, EMAIL_ADDRESS_OID},
    keypair::NodeKeyPair,
};

#[derive(Debug, Error)]
pub enum CsrError {
    #[error("CSR generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("'{0}' is not usable as an emailAddress attribute")]
    InvalidEmail(String),
    #[error("failed to parse CSR: {0}")]
    Parse(String),
    #[error("CSR signature does not verify")]
    SignatureInvalid,
    #[error("CSR subject is not a well-formed legal name: {0}")]
    BadSubject(#[from] cert::CertError),
}

/// The fields recovered from a parsed CSR.
#[derive(Debug, Eq, PartialEq)]
pub struct ParsedCsr {
    pub subject: LegalName,
    pub email: Option<String>,
    /// The requested SubjectPublicKeyInfo, DER-encoded.
    pub public_key_der: Vec<u8>,
}

/// Build a DER-encoded PKCS#10 CSR over `key_pair` for `subject`.
pub fn create_csr(
    subject: &LegalName,
    email: Option<&str>,
    key_pair: &NodeKeyPair,
) -> Result<Vec<u8>, CsrError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = cert::to_distinguished_name(subject);
    if let Some(email) = email {
        let ia5 = rcgen::string::Ia5String::try_from(email)
            .map_err(|_| CsrError::InvalidEmail(email.to_owned()))?;
        params.distinguished_name.push(
            DnType::CustomDnType(EMAIL_ADDRESS_OID.to_vec()),
            DnValue::Ia5String(ia5),
        );
    }

    let csr = params.serialize_request(key_pair.rcgen())?;
    Ok(csr.der().as_ref().to_vec())
}

/// Parse a DER-encoded PKCS#10 CSR, checking its self-signature.
pub fn parse_csr(der: &[u8]) -> Result<ParsedCsr, CsrError> {
    let (_, csr) = X509CertificationRequest::from_der(der)
        .map_err(|e| CsrError::Parse(e.to_string()))?;
    csr.verify_signature()
        .map_err(|_| CsrError::SignatureInvalid)?;

    let info = &csr.certification_request_info;
    let subject = cert::legal_name_from_x509(&info.subject)?;
    let email = info
        .subject
        .iter_by_oid(&x509_parser::oid_registry::OID_PKCS9_EMAIL_ADDRESS)
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned);

    Ok(ParsedCsr {
        subject,
        email,
        public_key_der: info.subject_pki.raw.to_vec(),
    })
}

#[cfg(test)]
mod test {
    use palisade_common::config::SignatureScheme;

    use super::*;

    fn alice() -> LegalName {
        LegalName::new("Alice Corp", "Madrid", "ES").unwrap()
    }

    #[test]
    fn csr_roundtrip_recovers_subject_key_and_email() {
        let key = NodeKeyPair::generate(SignatureScheme::default()).unwrap();
        let der =
            create_csr(&alice(), Some("ops@alice.example"), &key).unwrap();

        let parsed = parse_csr(&der).unwrap();
        assert_eq!(parsed.subject, alice());
        assert_eq!(parsed.email.as_deref(), Some("ops@alice.example"));
        assert_eq!(parsed.public_key_der, key.public_key_der());
    }

    #[test]
    fn csr_without_email() {
        let key = NodeKeyPair::generate(SignatureScheme::default()).unwrap();
        let der = create_csr(&alice(), None, &key).unwrap();
        let parsed = parse_csr(&der).unwrap();
        assert_eq!(parsed.email, None);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_csr(b"not a csr").is_err());
    }

    #[test]
    fn tampered_csr_fails_signature_check() {
        let key = NodeKeyPair::generate(SignatureScheme::default()).unwrap();
        let mut der = create_csr(&alice(), None, &key).unwrap();
        // Flip a bit somewhere inside the subject, leaving the outer DER
        // structure intact.
        let mid = der.len() / 2;
        der[mid] ^= 0x01;
        assert!(parse_csr(&der).is_err());
    }
}
