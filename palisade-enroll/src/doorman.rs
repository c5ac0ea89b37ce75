//! The doorman HTTP client.
//!
//! The wire protocol is small:
//! - `POST /certificate` with an `application/octet-stream` PKCS#10 DER
//!   body returns the request id as `text/plain`.
//! - `GET /certificate/{requestId}` returns `200 application/zip` once the
//!   request is approved, `204`/`404` while it is pending, and `403` with a
//!   plain-text reason if it was rejected. The archive holds the issued
//!   chain leaf-to-root under well-known entry names.

use std::{io::Read, time::Duration};

use palisade_common::constants::{
    ARCHIVE_CLIENT_CA_ENTRY, ARCHIVE_INTERMEDIATE_CA_ENTRY,
    ARCHIVE_ROOT_CA_ENTRY,
};
use palisade_pki::types::DerCert;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DoormanError {
    #[error("doorman request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("doorman returned unexpected status {0}")]
    UnexpectedStatus(StatusCode),
    #[error("doorman returned an empty request id")]
    EmptyRequestId,
    #[error("certificate archive is malformed: {0}")]
    BadArchive(String),
}

/// The three poll outcomes.
#[derive(Debug)]
pub enum PollResponse {
    /// The request has not been decided yet; ask again later.
    Pending,
    /// The issued chain, leaf to root.
    Issued(Vec<DerCert>),
    /// The doorman refused to sign, with its stated reason.
    Rejected { reason: String },
}

pub struct DoormanClient {
    client: reqwest::Client,
    base_url: String,
}

impl DoormanClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DoormanError> {
        let client = reqwest::Client::builder()
            .user_agent("palisade-enroll")
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self { client, base_url })
    }

    /// Submit a PKCS#10 DER request; returns the doorman's request id.
    pub async fn submit_request(
        &self,
        csr_der: &[u8],
    ) -> Result<String, DoormanError> {
        let url = format!("{}/certificate", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(csr_der.to_vec())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(DoormanError::UnexpectedStatus(resp.status()));
        }
        let request_id = resp.text().await?.trim().to_owned();
        if request_id.is_empty() {
            return Err(DoormanError::EmptyRequestId);
        }
        debug!("Doorman accepted our request under id {request_id}");
        Ok(request_id)
    }

    /// Ask whether `request_id` has been decided.
    pub async fn retrieve_certificates(
        &self,
        request_id: &str,
    ) -> Result<PollResponse, DoormanError> {
        let url = format!("{}/certificate/{request_id}", self.base_url);
        let resp = self.client.get(&url).send().await?;
        match resp.status() {
            StatusCode::OK => {
                let bytes = resp.bytes().await?;
                Ok(PollResponse::Issued(parse_archive(&bytes)?))
            }
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND =>
                Ok(PollResponse::Pending),
            StatusCode::FORBIDDEN => {
                let reason = resp.text().await.unwrap_or_default();
                Ok(PollResponse::Rejected {
                    reason: if reason.is_empty() {
                        "no reason given".to_owned()
                    } else {
                        reason
                    },
                })
            }
            other => Err(DoormanError::UnexpectedStatus(other)),
        }
    }
}

/// Unpack the certificate archive into a leaf-to-root chain.
fn parse_archive(bytes: &[u8]) -> Result<Vec<DerCert>, DoormanError> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| DoormanError::BadArchive(e.to_string()))?;

    let mut read_entry = |name: &str,
                          required: bool|
     -> Result<Option<DerCert>, DoormanError> {
        match archive.by_name(name) {
            Ok(mut entry) => {
                let mut der = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut der)
                    .map_err(|e| DoormanError::BadArchive(e.to_string()))?;
                Ok(Some(DerCert(der)))
            }
            Err(zip::result::ZipError::FileNotFound) if !required => Ok(None),
            Err(e) => Err(DoormanError::BadArchive(format!("{name}: {e}"))),
        }
    };

    let client_ca = read_entry(ARCHIVE_CLIENT_CA_ENTRY, true)?
        .expect("Required entry present or error");
    let intermediate = read_entry(ARCHIVE_INTERMEDIATE_CA_ENTRY, false)?;
    let root = read_entry(ARCHIVE_ROOT_CA_ENTRY, true)?
        .expect("Required entry present or error");

    let mut chain = vec![client_ca];
    chain.extend(intermediate);
    chain.push(root);
    Ok(chain)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer =
            zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn parses_full_archive_in_order() {
        let bytes = archive(&[
            (ARCHIVE_ROOT_CA_ENTRY, b"root"),
            (ARCHIVE_CLIENT_CA_ENTRY, b"leaf"),
            (ARCHIVE_INTERMEDIATE_CA_ENTRY, b"mid"),
        ]);
        let chain = parse_archive(&bytes).unwrap();
        assert_eq!(chain, vec![
            DerCert(b"leaf".to_vec()),
            DerCert(b"mid".to_vec()),
            DerCert(b"root".to_vec()),
        ]);
    }

    #[test]
    fn intermediate_is_optional() {
        let bytes = archive(&[
            (ARCHIVE_CLIENT_CA_ENTRY, b"leaf"),
            (ARCHIVE_ROOT_CA_ENTRY, b"root"),
        ]);
        let chain = parse_archive(&bytes).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn missing_required_entry_is_rejected() {
        let bytes = archive(&[(ARCHIVE_ROOT_CA_ENTRY, b"root")]);
        assert!(matches!(
            parse_archive(&bytes),
            Err(DoormanError::BadArchive(_)),
        ));
    }

    #[test]
    fn garbage_archive_is_rejected() {
        assert!(matches!(
            parse_archive(b"definitely not a zip"),
            Err(DoormanError::BadArchive(_)),
        ));
    }
}
