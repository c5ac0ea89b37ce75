//! Key pairs, certificates, and credential stores for the compatibility
//! zone.
//!
//! This crate owns everything cryptographic that happens before a socket is
//! opened: generating key pairs, issuing role-tagged X.509 certificates,
//! building and parsing PKCS#10 certificate signing requests, validating
//! certificate chains against the zone's trust root, and persisting all of
//! it into password-protected credential stores.

/// Certificate roles, issuance, and X.500 name conversions.
pub mod cert;
/// Certificate chain validation against a trusted root.
pub mod chain;
/// PKCS#10 certificate signing requests.
pub mod csr;
/// Signature-scheme-tagged key pairs.
pub mod keypair;
/// Password-protected credential stores.
pub mod keystore;
/// Password-based encryption of key material.
pub mod password;
/// DER newtypes.
pub mod types;
