//! DER newtypes.

use std::fmt;

use palisade_common::serde_helpers::hexstr_or_bytes;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};

/// A DER-encoded X.509 certificate which can be serialized and deserialized.
/// Can be constructed from arbitrary bytes; does not enforce any invariants.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DerCert(#[serde(with = "hexstr_or_bytes")] pub Vec<u8>);

/// A DER-encoded PKCS#8 private key which can be serialized and
/// deserialized. Can be constructed from arbitrary bytes; does not enforce
/// any invariants.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DerPkcs8Key(#[serde(with = "hexstr_or_bytes")] pub Vec<u8>);

// --- impl DerCert --- //

impl DerCert {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// We intentionally avoid the reverse impls because they require
/// re-allocation.
impl From<DerCert> for CertificateDer<'static> {
    fn from(cert: DerCert) -> Self {
        Self::from(cert.0)
    }
}
impl<'der> From<&'der DerCert> for CertificateDer<'der> {
    fn from(cert: &'der DerCert) -> Self {
        Self::from(cert.as_slice())
    }
}

// --- impl DerPkcs8Key --- //

impl DerPkcs8Key {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

// Don't leak key material into logs.
impl fmt::Debug for DerPkcs8Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerPkcs8Key(..)")
    }
}

/// We intentionally avoid the reverse impls because they require
/// re-allocation.
impl From<DerPkcs8Key> for PrivateKeyDer<'static> {
    fn from(key: DerPkcs8Key) -> Self {
        Self::from(PrivatePkcs8KeyDer::from(key.0))
    }
}
impl<'der> From<&'der DerPkcs8Key> for PrivatePkcs8KeyDer<'der> {
    fn from(key: &'der DerPkcs8Key) -> Self {
        Self::from(key.as_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serde_roundtrip() {
        let cert = DerCert(vec![0x30, 0x82, 0x01, 0x00]);
        let json = serde_json::to_string(&cert).unwrap();
        assert_eq!(json, "\"30820100\"");
        assert_eq!(serde_json::from_str::<DerCert>(&json).unwrap(), cert);
    }

    #[test]
    fn key_debug_is_redacted() {
        let key = DerPkcs8Key(vec![1, 2, 3]);
        assert_eq!(format!("{key:?}"), "DerPkcs8Key(..)");
    }
}
