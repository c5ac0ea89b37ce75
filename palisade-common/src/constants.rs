//! On-disk file names and credential store aliases.
//!
//! These names are the interface between a node and the rest of the zone
//! tooling. Changing any of them breaks compatibility with already-enrolled
//! node directories.

/// The keystore holding the node's signing identity, under
/// `certificates_directory`.
pub const NODE_KEYSTORE_FILE: &str = "nodekeystore.jks";
/// The keystore holding the node's transport TLS leaf.
pub const SSL_KEYSTORE_FILE: &str = "sslkeystore.jks";
/// The truststore holding only the zone root certificate.
pub const TRUSTSTORE_FILE: &str = "truststore.jks";
/// Single ASCII line holding the outstanding doorman request id. Present only
/// between CSR submission and a successful install.
pub const REQUEST_ID_FILE: &str = "certificate-request-id.txt";

/// Alias of the node CA entry installed by enrolment.
pub const CLIENT_CA_ALIAS: &str = "cordaclientca";
/// Alias of the transport TLS leaf derived from the node CA.
pub const CLIENT_TLS_ALIAS: &str = "cordaclienttls";
/// Alias of the zone root in the truststore.
pub const ROOT_CA_ALIAS: &str = "cordarootca";
/// Transient alias holding the self-signed placeholder while a certificate
/// request is outstanding. Never present once `CLIENT_CA_ALIAS` is installed.
pub const SELF_SIGNED_ALIAS: &str = "selfsignedprivatekey";

/// Entry names inside the doorman's certificate archive, leaf to root.
pub const ARCHIVE_CLIENT_CA_ENTRY: &str = "cordaclientca.cer";
pub const ARCHIVE_INTERMEDIATE_CA_ENTRY: &str = "cordaintermediateca.cer";
pub const ARCHIVE_ROOT_CA_ENTRY: &str = "cordarootca.cer";
