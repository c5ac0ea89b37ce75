//! Certificate chain validation against a trusted root.

use thiserror::Error;
use x509_parser::{
    certificate::X509Certificate, prelude::FromDer, time::ASN1Time,
};

use crate::{
    cert::{self, CertRole},
    types::DerCert,
};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain does not terminate at the trusted root")]
    ChainDoesNotTerminateAtRoot,
    #[error("signature of certificate {index} does not verify against its issuer")]
    SignatureInvalid { index: usize },
    #[error("certificate {index} is not yet valid")]
    NotYetValid { index: usize },
    #[error("certificate {index} has expired")]
    Expired { index: usize },
    #[error("certificate {index} has a role inconsistent with its position: {detail}")]
    RoleMismatch { index: usize, detail: String },
    #[error("failed to parse certificate {index}: {detail}")]
    Parse { index: usize, detail: String },
}

/// Validate a leaf→root certificate chain against the zone's trusted root.
///
/// Checks, in order:
/// - the chain is non-empty and its final certificate is bit-identical
///   (DER equality) to `trusted_root`;
/// - every certificate is currently within its validity window;
/// - every certificate's issuer name matches its successor's subject and
///   its signature verifies against the successor's public key (the root
///   must be self-signed);
/// - any embedded role is consistent with the certificate's CA-ness, and
///   the final certificate's role (if present) is [`CertRole::RootCa`].
pub fn validate_chain(
    trusted_root: &DerCert,
    chain: &[DerCert],
) -> Result<(), ChainError> {
    // An empty chain can't reach the root either.
    let Some(last) = chain.last() else {
        return Err(ChainError::ChainDoesNotTerminateAtRoot);
    };
    if last != trusted_root {
        return Err(ChainError::ChainDoesNotTerminateAtRoot);
    }

    let parsed = chain
        .iter()
        .enumerate()
        .map(|(index, der)| {
            X509Certificate::from_der(der.as_slice())
                .map(|(_, cert)| cert)
                .map_err(|e| ChainError::Parse {
                    index,
                    detail: e.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let now = ASN1Time::now();
    for (index, cert) in parsed.iter().enumerate() {
        let validity = cert.validity();
        if now < validity.not_before {
            return Err(ChainError::NotYetValid { index });
        }
        if now > validity.not_after {
            return Err(ChainError::Expired { index });
        }

        // The root vouches for itself.
        let issuer = parsed.get(index + 1).unwrap_or(cert);
        if cert.issuer().as_raw() != issuer.subject().as_raw() {
            return Err(ChainError::SignatureInvalid { index });
        }
        cert.verify_signature(Some(issuer.public_key()))
            .map_err(|_| ChainError::SignatureInvalid { index })?;

        check_role(index, cert, index + 1 == parsed.len())?;
    }

    Ok(())
}

fn check_role(
    index: usize,
    cert: &X509Certificate,
    is_root_position: bool,
) -> Result<(), ChainError> {
    let role = cert::role_of(cert).map_err(|e| ChainError::Parse {
        index,
        detail: e.to_string(),
    })?;
    let Some(role) = role else { return Ok(()) };

    let mismatch = |detail: String| ChainError::RoleMismatch { index, detail };

    let is_ca = cert
        .basic_constraints()
        .map_err(|e| ChainError::Parse {
            index,
            detail: e.to_string(),
        })?
        .map(|bc| bc.value.ca)
        .unwrap_or(false);
    if role.is_ca() != is_ca {
        return Err(mismatch(format!(
            "role {role} but basic constraints say ca={is_ca}",
        )));
    }
    if is_root_position && role != CertRole::RootCa {
        return Err(mismatch(format!("chain terminates at role {role}")));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use palisade_common::{config::SignatureScheme, x500::LegalName};
    use time::OffsetDateTime;

    use super::*;
    use crate::{
        cert::{CA_LIFETIME, TLS_LIFETIME, create_certificate,
               create_self_signed, to_distinguished_name},
        keypair::NodeKeyPair,
    };

    fn name(org: &str) -> LegalName {
        LegalName::new(org, "London", "GB").unwrap()
    }

    fn keygen() -> NodeKeyPair {
        NodeKeyPair::generate(SignatureScheme::default()).unwrap()
    }

    struct Zone {
        root_key: NodeKeyPair,
        root: DerCert,
    }

    fn zone() -> Zone {
        let root_key = keygen();
        let root = create_self_signed(
            CertRole::RootCa,
            &name("Zone Root"),
            &root_key,
            CA_LIFETIME,
        )
        .unwrap();
        Zone { root_key, root }
    }

    #[test]
    fn valid_three_link_chain() {
        let zone = zone();
        let node_key = keygen();
        let node_ca = create_certificate(
            CertRole::NodeCa,
            &zone.root,
            &zone.root_key,
            &name("Alice Corp"),
            node_key.rcgen(),
            CA_LIFETIME,
        )
        .unwrap();
        let tls_key = keygen();
        let tls = create_certificate(
            CertRole::Tls,
            &node_ca,
            &node_key,
            &name("Alice Corp"),
            tls_key.rcgen(),
            TLS_LIFETIME,
        )
        .unwrap();

        validate_chain(&zone.root, &[node_ca.clone(), zone.root.clone()])
            .unwrap();
        validate_chain(&zone.root, &[tls, node_ca, zone.root.clone()])
            .unwrap();
        // The root alone is also a valid chain.
        validate_chain(&zone.root, &[zone.root.clone()]).unwrap();
    }

    #[test]
    fn empty_chain_does_not_terminate_at_root() {
        let zone = zone();
        let err = validate_chain(&zone.root, &[]).unwrap_err();
        assert!(matches!(err, ChainError::ChainDoesNotTerminateAtRoot));
    }

    #[test]
    fn wrong_root_does_not_terminate_at_root() {
        let this_zone = zone();
        let other = zone();
        let node_key = keygen();
        let node_ca = create_certificate(
            CertRole::NodeCa,
            &this_zone.root,
            &this_zone.root_key,
            &name("Alice Corp"),
            node_key.rcgen(),
            CA_LIFETIME,
        )
        .unwrap();
        let err = validate_chain(&other.root, &[node_ca, this_zone.root.clone()])
            .unwrap_err();
        assert!(matches!(err, ChainError::ChainDoesNotTerminateAtRoot));
    }

    #[test]
    fn unrelated_issuer_is_a_signature_failure() {
        let this_zone = zone();
        let rogue = zone();
        // Issued by the rogue zone but claiming our root as its chain tail.
        let node_key = keygen();
        let node_ca = create_certificate(
            CertRole::NodeCa,
            &rogue.root,
            &rogue.root_key,
            &name("Alice Corp"),
            node_key.rcgen(),
            CA_LIFETIME,
        )
        .unwrap();
        let err = validate_chain(&this_zone.root, &[node_ca, this_zone.root.clone()])
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::SignatureInvalid { index: 0 }
        ));
    }

    /// Build a self-signed root with an arbitrary validity window, bypassing
    /// the normal now-anchored helpers.
    fn root_with_window(
        key: &NodeKeyPair,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> DerCert {
        let mut params = rcgen::CertificateParams::default();
        params.not_before = not_before;
        params.not_after = not_after;
        params.distinguished_name = to_distinguished_name(&name("Zone Root"));
        params.is_ca =
            rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let cert = params.self_signed(key.rcgen()).unwrap();
        DerCert(cert.der().to_vec())
    }

    #[test]
    fn expired_certificate() {
        let key = keygen();
        let now = OffsetDateTime::now_utc();
        let root = root_with_window(
            &key,
            now - Duration::from_secs(2 * 24 * 60 * 60),
            now - Duration::from_secs(24 * 60 * 60),
        );
        let err = validate_chain(&root, &[root.clone()]).unwrap_err();
        assert!(matches!(err, ChainError::Expired { index: 0 }));
    }

    #[test]
    fn not_yet_valid_certificate() {
        let key = keygen();
        let now = OffsetDateTime::now_utc();
        let root = root_with_window(
            &key,
            now + Duration::from_secs(24 * 60 * 60),
            now + Duration::from_secs(2 * 24 * 60 * 60),
        );
        let err = validate_chain(&root, &[root.clone()]).unwrap_err();
        assert!(matches!(err, ChainError::NotYetValid { index: 0 }));
    }

    #[test]
    fn ca_role_on_non_ca_cert_is_a_role_mismatch() {
        let key = keygen();
        let now = OffsetDateTime::now_utc();
        // Claims the NodeCa role in its extension but carries no CA basic
        // constraints.
        let mut params = rcgen::CertificateParams::default();
        params.not_before = now - Duration::from_secs(60 * 60);
        params.not_after = now + Duration::from_secs(24 * 60 * 60);
        params.distinguished_name = to_distinguished_name(&name("Zone Root"));
        params.custom_extensions =
            vec![rcgen::CustomExtension::from_oid_content(
                crate::cert::ROLE_EXTENSION_OID,
                vec![0x02, 0x01, 1],
            )];
        let cert = params.self_signed(key.rcgen()).unwrap();
        let root = DerCert(cert.der().to_vec());

        let err = validate_chain(&root, &[root.clone()]).unwrap_err();
        assert!(matches!(err, ChainError::RoleMismatch { index: 0, .. }));
    }
}
