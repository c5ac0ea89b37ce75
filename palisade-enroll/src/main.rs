//! The enrolment CLI.
//!
//! Exit codes: 0 success, 1 configuration invalid, 2 trust store missing or
//! malformed, 3 certificate request rejected by the doorman, 4 issued chain
//! failed validation.

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::Context;
use argh::FromArgs;
use palisade_common::{config::NodeConfig, logger, shutdown::ShutdownChannel};
use palisade_enroll::{
    doorman::DoormanClient,
    enrolment::{Enrolment, EnrolmentError},
};
use tracing::{error, info};

#[derive(FromArgs)]
/// Register this node with the zone doorman and build its credential
/// stores.
struct Args {
    /// this node's X.500 legal name, e.g. "O=Alice Corp, L=Madrid, C=ES"
    #[argh(option)]
    legal_name: String,

    /// contact email submitted with the certificate request
    #[argh(option)]
    email: Option<String>,

    /// directory holding the credential stores; the truststore must already
    /// be present in it
    #[argh(option)]
    certificates_directory: PathBuf,

    /// base URL of the doorman, e.g. http://doorman.zone.example:10000
    #[argh(option)]
    doorman_url: String,

    /// password protecting the node and SSL keystores
    #[argh(option)]
    key_store_password: String,

    /// password protecting the truststore
    #[argh(option)]
    trust_store_password: String,

    /// seconds between doorman polls (default 10)
    #[argh(option, default = "10")]
    poll_interval: u64,

    /// give up after this many seconds if the doorman never decides
    /// (default: poll forever)
    #[argh(option)]
    enrolment_timeout: Option<u64>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(NodeConfig, String)> {
        let legal_name = self
            .legal_name
            .parse()
            .context("--legal-name is not a well-formed X.500 name")?;
        let mut config = NodeConfig::new(
            legal_name,
            self.certificates_directory,
            self.key_store_password,
            self.trust_store_password,
        );
        config.email_address = self.email;
        config.poll_interval = Duration::from_secs(self.poll_interval);
        config.enrolment_timeout =
            self.enrolment_timeout.map(Duration::from_secs);
        Ok((config, self.doorman_url))
    }
}

fn exit_code_for(err: &EnrolmentError) -> ExitCode {
    match err {
        EnrolmentError::TrustStoreMissing(_)
        | EnrolmentError::NoRootInTrustStore
        | EnrolmentError::TrustStoreUnusable(_) => ExitCode::from(2),
        EnrolmentError::CsrRejected { .. } => ExitCode::from(3),
        EnrolmentError::Chain(_) | EnrolmentError::IssuedKeyMismatch =>
            ExitCode::from(4),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logger::init();
    let args: Args = argh::from_env();

    let (config, doorman_url) = match args.into_config() {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("Invalid configuration: {e:#}");
            return ExitCode::from(1);
        }
    };
    let doorman = match DoormanClient::new(doorman_url.as_str()) {
        Ok(doorman) => doorman,
        Err(e) => {
            error!("Invalid doorman URL: {e}");
            return ExitCode::from(1);
        }
    };

    // Ctrl-C interrupts polling cleanly; on-disk state stays resumable.
    let shutdown = ShutdownChannel::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; shutting down");
            signal_shutdown.send();
        }
    });

    match Enrolment::new(config, doorman, shutdown).build_keystore().await {
        Ok(outcome) => {
            info!("Enrolment finished: {outcome:?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Enrolment failed: {e}");
            exit_code_for(&e)
        }
    }
}
