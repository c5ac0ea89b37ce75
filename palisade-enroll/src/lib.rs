//! Node enrolment against the zone's registration authority (the
//! "doorman").
//!
//! A freshly installed node runs
//! [`Enrolment::build_keystore`](enrolment::Enrolment::build_keystore)
//! once: it
//! generates the node's key pair, submits a certificate signing request,
//! polls until the doorman decides, validates the issued chain against the
//! pre-provisioned trust root, and persists the node CA plus a derived TLS
//! leaf into the credential stores. Every step is persisted before the next
//! begins, so the process can be killed at any point and resumed.

/// The doorman HTTP client.
pub mod doorman;
/// The resumable enrolment state machine.
pub mod enrolment;
