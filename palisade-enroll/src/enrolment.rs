//! The resumable enrolment state machine.
//!
//! Each step persists its effects before the next begins, so the
//! filesystem alone determines where a restarted run resumes:
//!
//! - node keystore holds the node CA (and the TLS leaf exists): enrolled,
//!   nothing to do;
//! - node keystore holds the node CA only: re-derive the TLS leaf;
//! - `certificate-request-id.txt` present: resume polling that request;
//! - node keystore holds the self-signed placeholder: submit a CSR over
//!   that same key (never a fresh one);
//! - nothing: start from key generation.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use palisade_common::{
    config::NodeConfig,
    constants::{
        CLIENT_CA_ALIAS, CLIENT_TLS_ALIAS, NODE_KEYSTORE_FILE,
        REQUEST_ID_FILE, ROOT_CA_ALIAS, SELF_SIGNED_ALIAS, SSL_KEYSTORE_FILE,
        TRUSTSTORE_FILE,
    },
    shutdown::ShutdownChannel,
};
use palisade_pki::{
    cert::{self, CertError, CertRole},
    chain::{self, ChainError},
    csr::{self, CsrError},
    keypair::{KeyError, NodeKeyPair},
    keystore::{CredentialStore, StoreError},
    types::DerCert,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};
use x509_parser::{certificate::X509Certificate, prelude::FromDer};

use crate::doorman::{DoormanClient, DoormanError, PollResponse};

#[derive(Debug, Error)]
pub enum EnrolmentError {
    #[error("trust store not found at {0}; it must be provisioned out of band")]
    TrustStoreMissing(PathBuf),
    #[error("trust store has no '{ROOT_CA_ALIAS}' entry")]
    NoRootInTrustStore,
    #[error("trust store unusable: {0}")]
    TrustStoreUnusable(StoreError),
    #[error("certificate signing request rejected by the doorman: {reason}")]
    CsrRejected { reason: String },
    #[error("enrolment did not complete within the configured timeout")]
    Timeout,
    #[error("enrolment interrupted by shutdown")]
    Interrupted,
    #[error("issued certificate does not certify the key we submitted")]
    IssuedKeyMismatch,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error(transparent)]
    Csr(#[from] CsrError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What [`Enrolment::build_keystore`] found to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// All credentials were already in place.
    AlreadyEnrolled,
    /// Fresh or resumed enrolment ran to completion.
    Enrolled,
}

/// The explicit step ladder. `build_keystore` walks these in order,
/// skipping the ones the on-disk state shows as already done.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Step {
    EnsureSelfSigned,
    SubmitOrResume,
    Poll,
    Install,
    DeriveTls,
    Done,
}

pub struct Enrolment {
    config: NodeConfig,
    doorman: DoormanClient,
    shutdown: ShutdownChannel,
}

impl Enrolment {
    pub fn new(
        config: NodeConfig,
        doorman: DoormanClient,
        shutdown: ShutdownChannel,
    ) -> Self {
        Self {
            config,
            doorman,
            shutdown,
        }
    }

    fn dir(&self) -> &Path {
        &self.config.certificates_directory
    }

    fn key_password(&self) -> &str {
        self.config.private_key_password()
    }

    /// Run enrolment to completion (idempotent, crash-resumable).
    pub async fn build_keystore(&self) -> Result<Outcome, EnrolmentError> {
        fs::create_dir_all(self.dir())?;
        let root = self.load_trusted_root()?;

        let node_keystore_path = self.dir().join(NODE_KEYSTORE_FILE);
        let mut node_store = CredentialStore::load_or_create(
            &node_keystore_path,
            &self.config.key_store_password,
        )?;

        // Decide where the on-disk state says we are.
        let mut step = if node_store.contains(CLIENT_CA_ALIAS) {
            if self.tls_leaf_installed()? {
                info!(
                    "Certificate already exists for {}; skipping enrolment",
                    self.config.my_legal_name,
                );
                return Ok(Outcome::AlreadyEnrolled);
            }
            // Interrupted after install: only the TLS leaf is missing.
            Step::DeriveTls
        } else {
            Step::EnsureSelfSigned
        };

        let mut request_id = String::new();
        let mut issued_chain: Vec<DerCert> = Vec::new();

        while step != Step::Done {
            step = match step {
                Step::EnsureSelfSigned => {
                    self.ensure_self_signed(
                        &mut node_store,
                        &node_keystore_path,
                    )?;
                    Step::SubmitOrResume
                }
                Step::SubmitOrResume => {
                    request_id = self.submit_or_resume(&node_store).await?;
                    Step::Poll
                }
                Step::Poll => {
                    issued_chain = self.poll(&request_id).await?;
                    Step::Install
                }
                Step::Install => {
                    self.install(
                        &mut node_store,
                        &node_keystore_path,
                        &root,
                        std::mem::take(&mut issued_chain),
                    )?;
                    Step::DeriveTls
                }
                Step::DeriveTls => {
                    self.derive_tls(&node_store)?;
                    let _ = fs::remove_file(self.request_id_path());
                    Step::Done
                }
                Step::Done => unreachable!("Loop exits at Done"),
            };
        }

        info!(
            "Enrolment complete for {}; certificate stores written to {}",
            self.config.my_legal_name,
            self.dir().display(),
        );
        Ok(Outcome::Enrolled)
    }

    fn load_trusted_root(&self) -> Result<DerCert, EnrolmentError> {
        let path = self.dir().join(TRUSTSTORE_FILE);
        if !path.exists() {
            return Err(EnrolmentError::TrustStoreMissing(path));
        }
        let truststore =
            CredentialStore::load(&path, &self.config.trust_store_password)
                .map_err(EnrolmentError::TrustStoreUnusable)?;
        truststore
            .get_cert(ROOT_CA_ALIAS)
            .map_err(|_| EnrolmentError::NoRootInTrustStore)
    }

    fn tls_leaf_installed(&self) -> Result<bool, EnrolmentError> {
        let path = self.dir().join(SSL_KEYSTORE_FILE);
        if !path.exists() {
            return Ok(false);
        }
        let ssl_store =
            CredentialStore::load(&path, &self.config.key_store_password)?;
        Ok(ssl_store.contains(CLIENT_TLS_ALIAS))
    }

    fn request_id_path(&self) -> PathBuf {
        self.dir().join(REQUEST_ID_FILE)
    }

    /// Step 1: make sure the placeholder key exists, persisting it before
    /// any CSR can be built over it.
    fn ensure_self_signed(
        &self,
        node_store: &mut CredentialStore,
        node_keystore_path: &Path,
    ) -> Result<(), EnrolmentError> {
        if node_store.contains(SELF_SIGNED_ALIAS) {
            return Ok(());
        }
        info!(
            "Generating a fresh {:?} key pair for {}",
            self.config.tls_signature_scheme, self.config.my_legal_name,
        );
        let key_pair =
            NodeKeyPair::generate(self.config.tls_signature_scheme)?;
        let cert =
            cert::create_self_signed_ca(&self.config.my_legal_name, &key_pair)?;
        node_store.put_key_entry(
            SELF_SIGNED_ALIAS,
            &key_pair.serialize_pkcs8_der(),
            self.key_password(),
            vec![cert],
        )?;
        node_store.save(node_keystore_path, &self.config.key_store_password)?;
        Ok(())
    }

    /// Step 2: submit a CSR, or pick up the request id a previous run left
    /// behind.
    async fn submit_or_resume(
        &self,
        node_store: &CredentialStore,
    ) -> Result<String, EnrolmentError> {
        let path = self.request_id_path();
        if path.exists() {
            let request_id = fs::read_to_string(&path)?.trim().to_owned();
            info!("Resuming outstanding certificate request {request_id}");
            return Ok(request_id);
        }

        let (key_der, _chain) =
            node_store.get_key_entry(SELF_SIGNED_ALIAS, self.key_password())?;
        let key_pair = NodeKeyPair::from_pkcs8_der(
            self.config.tls_signature_scheme,
            &key_der,
        )?;
        let csr_der = csr::create_csr(
            &self.config.my_legal_name,
            self.config.email_address.as_deref(),
            &key_pair,
        )?;

        let request_id = loop {
            match self.doorman.submit_request(&csr_der).await {
                Ok(request_id) => break request_id,
                Err(e) => {
                    warn!(
                        "Could not submit certificate request: {e}; \
                         retrying in {:?}",
                        self.config.poll_interval,
                    );
                    self.sleep(self.config.poll_interval).await?;
                }
            }
        };
        info!(
            "Certificate signing request submitted for {}; request id \
             {request_id}",
            self.config.my_legal_name,
        );

        // Persist before returning so a crash cannot resubmit.
        let mut file = fs::File::create(&path)?;
        file.write_all(request_id.as_bytes())?;
        file.sync_all()?;
        Ok(request_id)
    }

    /// Step 3: poll until the doorman decides.
    async fn poll(
        &self,
        request_id: &str,
    ) -> Result<Vec<DerCert>, EnrolmentError> {
        let deadline = self
            .config
            .enrolment_timeout
            .map(|timeout| Instant::now() + timeout);
        info!("Waiting for the doorman to approve request {request_id}");

        loop {
            match self.doorman.retrieve_certificates(request_id).await {
                Ok(PollResponse::Issued(chain)) => {
                    info!("Certificate signing request approved");
                    return Ok(chain);
                }
                Ok(PollResponse::Pending) => (),
                Ok(PollResponse::Rejected { reason }) => {
                    error!(
                        "Certificate request rejected by the doorman: \
                         {reason}. Please check that the node configuration \
                         matches what was registered with the zone operator. \
                         This process will now terminate.",
                    );
                    let _ = fs::remove_file(self.request_id_path());
                    return Err(EnrolmentError::CsrRejected { reason });
                }
                Err(DoormanError::BadArchive(detail)) => {
                    // The decision arrived but is unusable; retrying cannot
                    // help.
                    let _ = fs::remove_file(self.request_id_path());
                    return Err(EnrolmentError::Chain(ChainError::Parse {
                        index: 0,
                        detail,
                    }));
                }
                Err(e) => warn!("Doorman poll failed: {e}; will retry"),
            }

            if let Some(deadline) = deadline
                && Instant::now() + self.config.poll_interval >= deadline
            {
                return Err(EnrolmentError::Timeout);
            }
            self.sleep(self.config.poll_interval).await?;
        }
    }

    /// Step 4: validate and install the issued chain, retiring the
    /// placeholder.
    fn install(
        &self,
        node_store: &mut CredentialStore,
        node_keystore_path: &Path,
        root: &DerCert,
        issued_chain: Vec<DerCert>,
    ) -> Result<(), EnrolmentError> {
        if let Err(e) = chain::validate_chain(root, &issued_chain) {
            error!(
                "Issued certificate chain does not validate against the \
                 zone root: {e}",
            );
            let _ = fs::remove_file(self.request_id_path());
            return Err(e.into());
        }

        let (key_der, _placeholder_chain) =
            node_store.get_key_entry(SELF_SIGNED_ALIAS, self.key_password())?;
        let key_pair = NodeKeyPair::from_pkcs8_der(
            self.config.tls_signature_scheme,
            &key_der,
        )?;

        // The issued leaf must certify the exact key the CSR covered.
        let leaf = issued_chain.first().expect("Validated chain is non-empty");
        let (_, leaf_parsed) = X509Certificate::from_der(leaf.as_slice())
            .map_err(|e| CertError::Parse(e.to_string()))?;
        if leaf_parsed.public_key().raw != key_pair.public_key_der().as_slice()
        {
            let _ = fs::remove_file(self.request_id_path());
            return Err(EnrolmentError::IssuedKeyMismatch);
        }

        node_store.put_key_entry(
            CLIENT_CA_ALIAS,
            &key_der,
            self.key_password(),
            issued_chain,
        )?;
        node_store.delete(SELF_SIGNED_ALIAS)?;
        node_store.save(node_keystore_path, &self.config.key_store_password)?;
        info!("Node CA certificate chain installed");
        Ok(())
    }

    /// Step 5: derive the transport TLS leaf from the node CA.
    fn derive_tls(
        &self,
        node_store: &CredentialStore,
    ) -> Result<(), EnrolmentError> {
        let (ca_key_der, ca_chain) =
            node_store.get_key_entry(CLIENT_CA_ALIAS, self.key_password())?;
        let ca_key = NodeKeyPair::from_pkcs8_der(
            self.config.tls_signature_scheme,
            &ca_key_der,
        )?;
        let ca_cert = ca_chain
            .first()
            .cloned()
            .expect("Installed chain is non-empty");

        let tls_key =
            NodeKeyPair::generate(self.config.tls_signature_scheme)?;
        let tls_cert = cert::create_certificate(
            CertRole::Tls,
            &ca_cert,
            &ca_key,
            &self.config.my_legal_name,
            tls_key.rcgen(),
            cert::TLS_LIFETIME,
        )?;

        let mut tls_chain = vec![tls_cert];
        tls_chain.extend(ca_chain);

        let ssl_keystore_path = self.dir().join(SSL_KEYSTORE_FILE);
        let mut ssl_store = CredentialStore::load_or_create(
            &ssl_keystore_path,
            &self.config.key_store_password,
        )?;
        ssl_store.put_key_entry(
            CLIENT_TLS_ALIAS,
            &tls_key.serialize_pkcs8_der(),
            self.key_password(),
            tls_chain,
        )?;
        ssl_store.save(&ssl_keystore_path, &self.config.key_store_password)?;
        info!("TLS key and certificate installed");
        Ok(())
    }

    /// Sleep that loses a race against shutdown.
    async fn sleep(&self, duration: Duration) -> Result<(), EnrolmentError> {
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            () = self.shutdown.recv() => Err(EnrolmentError::Interrupted),
        }
    }
}
