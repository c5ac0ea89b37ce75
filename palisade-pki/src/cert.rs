//! Certificate roles and issuance.
//!
//! Every certificate issued inside the zone carries a role in a custom
//! extension. The role governs the certificate's basic constraints and key
//! usages, and chain validation checks that a certificate's role is
//! consistent with its position in the chain.

use std::time::Duration;

use palisade_common::x500::LegalName;
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType,
};
use strum::Display;
use thiserror::Error;
use time::OffsetDateTime;
use x509_parser::{
    certificate::X509Certificate, prelude::FromDer, x509::X509Name,
};

use crate::{keypair::NodeKeyPair, types::DerCert};

/// Private-arc OID of the extension carrying a certificate's [`CertRole`].
pub const ROLE_EXTENSION_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 58012, 1, 1];
const ROLE_EXTENSION_OID_STR: &str = "1.3.6.1.4.1.58012.1.1";

/// The PKCS#9 `emailAddress` attribute OID, used in CSR subjects.
pub const EMAIL_ADDRESS_OID: &[u64] = &[1, 2, 840, 113549, 1, 9, 1];

/// Validity granted to self-signed CA certificates.
pub const CA_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
/// Default validity requested for TLS leaf certificates.
pub const TLS_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A certificate's function within the zone's trust hierarchy.
#[derive(Copy, Clone, Debug, Display, Eq, PartialEq)]
pub enum CertRole {
    /// The zone's trust anchor.
    RootCa,
    /// A doorman intermediate between the root and node CAs.
    IntermediateCa,
    /// A per-node signing certificate issued by the doorman; the root of
    /// everything the node itself issues. Also known as the client CA.
    NodeCa,
    /// A transport-only leaf, signed by the node CA.
    Tls,
    /// A well-known legal identity.
    LegalIdentity,
    /// An unpublished legal identity.
    ConfidentialLegalIdentity,
    /// An identity shared by multiple nodes backing one service.
    ServiceIdentity,
}

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("failed to parse certificate: {0}")]
    Parse(String),
    #[error("subject is not a well-formed legal name: {0}")]
    BadSubject(#[from] palisade_common::x500::ParseError),
    #[error("issuer and requested validity windows do not overlap")]
    NoValidityOverlap,
    #[error("unknown certificate role tag: {0}")]
    UnknownRole(u8),
}

impl CertRole {
    fn tag(self) -> u8 {
        match self {
            Self::RootCa => 1,
            Self::IntermediateCa => 2,
            Self::NodeCa => 3,
            Self::Tls => 4,
            Self::LegalIdentity => 5,
            Self::ConfidentialLegalIdentity => 6,
            Self::ServiceIdentity => 7,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CertError> {
        match tag {
            1 => Ok(Self::RootCa),
            2 => Ok(Self::IntermediateCa),
            3 => Ok(Self::NodeCa),
            4 => Ok(Self::Tls),
            5 => Ok(Self::LegalIdentity),
            6 => Ok(Self::ConfidentialLegalIdentity),
            7 => Ok(Self::ServiceIdentity),
            other => Err(CertError::UnknownRole(other)),
        }
    }

    /// Whether certificates of this role sign other certificates.
    pub fn is_ca(self) -> bool {
        matches!(self, Self::RootCa | Self::IntermediateCa | Self::NodeCa)
    }

    /// How many further CA certificates may appear below this one.
    fn path_len(self) -> IsCa {
        match self {
            // Root signs intermediates which sign node CAs.
            Self::RootCa => IsCa::Ca(BasicConstraints::Unconstrained),
            Self::IntermediateCa => IsCa::Ca(BasicConstraints::Constrained(1)),
            Self::NodeCa => IsCa::Ca(BasicConstraints::Constrained(0)),
            _ => IsCa::NoCa,
        }
    }

    fn key_usages(self) -> Vec<KeyUsagePurpose> {
        if self.is_ca() {
            vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
            ]
        } else {
            vec![KeyUsagePurpose::DigitalSignature]
        }
    }

    fn extended_key_usages(self) -> Vec<ExtendedKeyUsagePurpose> {
        match self {
            Self::Tls => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            _ => Vec::new(),
        }
    }

    /// The DER content of the role extension: a single ASN.1 INTEGER.
    fn extension(self) -> CustomExtension {
        CustomExtension::from_oid_content(
            ROLE_EXTENSION_OID,
            vec![0x02, 0x01, self.tag()],
        )
    }
}

/// Read the [`CertRole`] out of a parsed certificate, if one is present.
pub fn role_of(cert: &X509Certificate) -> Result<Option<CertRole>, CertError> {
    let ext = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == ROLE_EXTENSION_OID_STR);
    let Some(ext) = ext else { return Ok(None) };
    match ext.value {
        [0x02, 0x01, tag] => CertRole::from_tag(*tag).map(Some),
        _ => Err(CertError::Parse("malformed role extension".to_owned())),
    }
}

/// Build an [`rcgen::DistinguishedName`] from a [`LegalName`]. The attribute
/// order here is the canonical one; both sides of every conversion in this
/// crate use it, so name encodings stay bit-stable across re-issuance.
pub fn to_distinguished_name(name: &LegalName) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, name.organization());
    dn.push(DnType::LocalityName, name.locality());
    dn.push(DnType::CountryName, name.country());
    if let Some(ou) = name.organizational_unit() {
        dn.push(DnType::OrganizationalUnitName, ou);
    }
    if let Some(cn) = name.common_name() {
        dn.push(DnType::CommonName, cn);
    }
    if let Some(st) = name.state() {
        dn.push(DnType::StateOrProvinceName, st);
    }
    dn
}

/// Recover a [`LegalName`] from an X.509 subject or issuer name.
pub fn legal_name_from_x509(name: &X509Name) -> Result<LegalName, CertError> {
    use x509_parser::oid_registry::{
        OID_X509_COMMON_NAME, OID_X509_COUNTRY_NAME, OID_X509_LOCALITY_NAME,
        OID_X509_ORGANIZATIONAL_UNIT, OID_X509_ORGANIZATION_NAME,
        OID_X509_STATE_OR_PROVINCE_NAME,
    };

    fn first_attr(
        name: &X509Name,
        oid: &x509_parser::oid_registry::Oid,
    ) -> Option<String> {
        name.iter_by_oid(oid)
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned)
    }

    let missing =
        |ty| CertError::Parse(format!("subject is missing attribute {ty}"));

    let mut legal_name = LegalName::new(
        first_attr(name, &OID_X509_ORGANIZATION_NAME).ok_or(missing("O"))?,
        first_attr(name, &OID_X509_LOCALITY_NAME).ok_or(missing("L"))?,
        first_attr(name, &OID_X509_COUNTRY_NAME).ok_or(missing("C"))?,
    )?;
    if let Some(ou) = first_attr(name, &OID_X509_ORGANIZATIONAL_UNIT) {
        legal_name = legal_name.with_organizational_unit(ou)?;
    }
    if let Some(cn) = first_attr(name, &OID_X509_COMMON_NAME) {
        legal_name = legal_name.with_common_name(cn)?;
    }
    if let Some(st) = first_attr(name, &OID_X509_STATE_OR_PROVINCE_NAME) {
        legal_name = legal_name.with_state(st)?;
    }
    Ok(legal_name)
}

/// A safe default for [`CertificateParams::subject_alt_names`]. Some TLS
/// stacks refuse certs without any SAN even where the name itself is
/// ignored, so every cert carries this placeholder.
fn default_subject_alt_names() -> Result<Vec<SanType>, rcgen::Error> {
    Ok(vec![SanType::DnsName("node.palisade.network".try_into()?)])
}

fn base_params(
    role: CertRole,
    subject: &LegalName,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<CertificateParams, rcgen::Error> {
    let mut params = CertificateParams::default();
    params.not_before = not_before;
    params.not_after = not_after;
    params.distinguished_name = to_distinguished_name(subject);
    params.subject_alt_names = default_subject_alt_names()?;
    params.is_ca = role.path_len();
    params.key_usages = role.key_usages();
    params.extended_key_usages = role.extended_key_usages();
    params.custom_extensions = vec![role.extension()];
    params.key_identifier_method = rcgen::KeyIdMethod::Sha256;
    Ok(params)
}

/// Issue a self-signed certificate of the given role.
pub fn create_self_signed(
    role: CertRole,
    subject: &LegalName,
    key_pair: &NodeKeyPair,
    lifetime: Duration,
) -> Result<DerCert, CertError> {
    let now = OffsetDateTime::now_utc();
    // Backdate an hour so minor clock skew between peers can't reject us.
    let not_before = now - time::Duration::HOUR;
    let not_after = now + lifetime;
    let params = base_params(role, subject, not_before, not_after)?;
    let cert = params.self_signed(key_pair.rcgen())?;
    Ok(DerCert(cert.der().to_vec()))
}

/// Issue the self-signed node CA placeholder used while a certificate
/// request is outstanding at the doorman.
pub fn create_self_signed_ca(
    subject: &LegalName,
    key_pair: &NodeKeyPair,
) -> Result<DerCert, CertError> {
    create_self_signed(CertRole::NodeCa, subject, key_pair, CA_LIFETIME)
}

/// Issue a certificate for `subject_public_key`, signed by `issuer_key`.
///
/// The validity window is clamped into the issuer's own:
/// `start = max(now, issuer.not_before)`,
/// `end = min(now + requested_lifetime, issuer.not_after)`. An empty window
/// fails with [`CertError::NoValidityOverlap`].
pub fn create_certificate(
    role: CertRole,
    issuer_cert: &DerCert,
    issuer_key: &NodeKeyPair,
    subject: &LegalName,
    subject_public_key: &impl rcgen::PublicKeyData,
    requested_lifetime: Duration,
) -> Result<DerCert, CertError> {
    let (_, issuer) =
        X509Certificate::from_der(issuer_cert.as_slice())
            .map_err(|e| CertError::Parse(e.to_string()))?;
    let issuer_subject = legal_name_from_x509(issuer.subject())?;
    let issuer_not_before = issuer.validity().not_before.timestamp();
    let issuer_not_after = issuer.validity().not_after.timestamp();

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let not_before = now.max(issuer_not_before);
    let not_after =
        (now + requested_lifetime.as_secs() as i64).min(issuer_not_after);
    if not_after <= not_before {
        return Err(CertError::NoValidityOverlap);
    }
    let to_odt = |ts| {
        OffsetDateTime::from_unix_timestamp(ts)
            .map_err(|e| CertError::Parse(e.to_string()))
    };

    let params =
        base_params(role, subject, to_odt(not_before)?, to_odt(not_after)?)?;

    // rcgen needs the issuer's DN to write the child's issuer field; rebuild
    // it from the parsed subject. Canonical attribute ordering makes this
    // byte-stable with the issuer cert's own subject encoding.
    let mut issuer_params = CertificateParams::default();
    issuer_params.distinguished_name =
        to_distinguished_name(&issuer_subject);
    issuer_params.key_identifier_method = rcgen::KeyIdMethod::Sha256;
    let issuer = rcgen::Issuer::from_params(&issuer_params, issuer_key.rcgen());

    let cert = params.signed_by(subject_public_key, &issuer)?;
    Ok(DerCert(cert.der().to_vec()))
}

#[cfg(test)]
mod test {
    use palisade_common::config::SignatureScheme;

    use super::*;

    fn name(org: &str) -> LegalName {
        LegalName::new(org, "London", "GB").unwrap()
    }

    #[test]
    fn roles_roundtrip_through_certs() {
        let key = NodeKeyPair::generate(SignatureScheme::default()).unwrap();
        let root = create_self_signed(
            CertRole::RootCa,
            &name("Zone Root"),
            &key,
            CA_LIFETIME,
        )
        .unwrap();

        let (_, parsed) = X509Certificate::from_der(root.as_slice()).unwrap();
        assert_eq!(role_of(&parsed).unwrap(), Some(CertRole::RootCa));
        let bc = parsed.basic_constraints().unwrap().unwrap();
        assert!(bc.value.ca);
        assert_eq!(
            legal_name_from_x509(parsed.subject()).unwrap(),
            name("Zone Root"),
        );
    }

    #[test]
    fn issue_chain_root_to_tls() {
        let root_key =
            NodeKeyPair::generate(SignatureScheme::default()).unwrap();
        let root = create_self_signed(
            CertRole::RootCa,
            &name("Zone Root"),
            &root_key,
            CA_LIFETIME,
        )
        .unwrap();

        let node_key =
            NodeKeyPair::generate(SignatureScheme::default()).unwrap();
        let node_ca = create_certificate(
            CertRole::NodeCa,
            &root,
            &root_key,
            &name("Alice Corp"),
            node_key.rcgen(),
            CA_LIFETIME,
        )
        .unwrap();

        let tls_key =
            NodeKeyPair::generate(SignatureScheme::default()).unwrap();
        let tls = create_certificate(
            CertRole::Tls,
            &node_ca,
            &node_key,
            &name("Alice Corp"),
            tls_key.rcgen(),
            TLS_LIFETIME,
        )
        .unwrap();

        let (_, tls_parsed) =
            X509Certificate::from_der(tls.as_slice()).unwrap();
        let (_, node_ca_parsed) =
            X509Certificate::from_der(node_ca.as_slice()).unwrap();

        assert_eq!(role_of(&tls_parsed).unwrap(), Some(CertRole::Tls));
        assert!(tls_parsed.basic_constraints().unwrap().is_none());
        // The TLS leaf's issuer is the node CA's subject, byte for byte.
        assert_eq!(
            tls_parsed.issuer().as_raw(),
            node_ca_parsed.subject().as_raw(),
        );
        // And the signature verifies against the node CA key.
        tls_parsed
            .verify_signature(Some(node_ca_parsed.public_key()))
            .unwrap();
    }

    #[test]
    fn validity_window_is_clamped_to_issuer() {
        let root_key =
            NodeKeyPair::generate(SignatureScheme::default()).unwrap();
        // A short-lived issuer.
        let root = create_self_signed(
            CertRole::RootCa,
            &name("Zone Root"),
            &root_key,
            Duration::from_secs(24 * 60 * 60),
        )
        .unwrap();

        let leaf_key =
            NodeKeyPair::generate(SignatureScheme::default()).unwrap();
        let leaf = create_certificate(
            CertRole::Tls,
            &root,
            &root_key,
            &name("Alice Corp"),
            leaf_key.rcgen(),
            // Requesting far more than the issuer has left.
            Duration::from_secs(100 * 24 * 60 * 60),
        )
        .unwrap();

        let (_, root_parsed) =
            X509Certificate::from_der(root.as_slice()).unwrap();
        let (_, leaf_parsed) =
            X509Certificate::from_der(leaf.as_slice()).unwrap();
        assert!(
            leaf_parsed.validity().not_after
                <= root_parsed.validity().not_after
        );
    }

    #[test]
    fn expired_issuer_has_no_overlap() {
        let root_key =
            NodeKeyPair::generate(SignatureScheme::default()).unwrap();
        // Zero lifetime: the issuer's window ends the moment it is created.
        let root = create_self_signed(
            CertRole::RootCa,
            &name("Zone Root"),
            &root_key,
            Duration::ZERO,
        )
        .unwrap();

        let leaf_key =
            NodeKeyPair::generate(SignatureScheme::default()).unwrap();
        let err = create_certificate(
            CertRole::Tls,
            &root,
            &root_key,
            &name("Alice Corp"),
            leaf_key.rcgen(),
            TLS_LIFETIME,
        )
        .unwrap_err();
        assert!(matches!(err, CertError::NoValidityOverlap));
    }
}
