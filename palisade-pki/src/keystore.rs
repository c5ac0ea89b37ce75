//! Password-protected credential stores.
//!
//! A [`CredentialStore`] maps string aliases to either a private key with
//! its certificate chain, or a bare trusted certificate. The whole container
//! is encrypted under the *store* password; private-key entries are
//! additionally encrypted under a per-entry *key* password, so the two
//! secrets are separate at this interface even when a deployment configures
//! them equal.
//!
//! Saves are atomic: the new container is written to a temporary file in the
//! same directory, fsync'd, and renamed over the target, so a crash mid-save
//! leaves the previous store intact.

use std::{
    collections::BTreeMap,
    io::{self, Write},
    path::Path,
};

use palisade_common::serde_helpers::hexstr_or_bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    password::{self, SALT_LEN},
    types::{DerCert, DerPkcs8Key},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential store is corrupt: {0}")]
    StoreCorrupt(String),
    #[error("wrong password")]
    BadPassword,
    #[error("no entry under alias '{0}'")]
    AliasMissing(String),
    #[error("entry under alias '{0}' is not of the expected kind")]
    WrongEntryKind(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<password::Error> for StoreError {
    fn from(err: password::Error) -> Self {
        match err {
            password::Error::Decrypt => Self::BadPassword,
            password::Error::CiphertextTooShort =>
                Self::StoreCorrupt("truncated ciphertext".to_owned()),
            other => Self::StoreCorrupt(other.to_string()),
        }
    }
}

/// One aliased entry.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
enum StoreEntry {
    /// A private key (encrypted under the entry's key password) plus the
    /// certificate chain for its public half, leaf first.
    Key {
        #[serde(with = "hexstr_or_bytes")]
        salt: Vec<u8>,
        #[serde(with = "hexstr_or_bytes")]
        encrypted_key: Vec<u8>,
        chain: Vec<DerCert>,
    },
    /// A certificate trusted as-is, e.g. the zone root.
    TrustedCert { cert: DerCert },
}

/// The outer on-disk container.
#[derive(Serialize, Deserialize)]
struct StoreFile {
    #[serde(with = "hexstr_or_bytes")]
    salt: Vec<u8>,
    #[serde(with = "hexstr_or_bytes")]
    ciphertext: Vec<u8>,
}

/// An in-memory credential store. See the module docs for the on-disk
/// protection scheme.
#[derive(Debug, Default)]
pub struct CredentialStore {
    entries: BTreeMap<String, StoreEntry>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and decrypt a store from `path`.
    pub fn load(
        path: &Path,
        store_password: &str,
    ) -> Result<Self, StoreError> {
        let bytes = std::fs::read(path)?;
        let file: StoreFile = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::StoreCorrupt(e.to_string()))?;
        let salt = to_salt(&file.salt)?;
        let plaintext =
            password::decrypt(store_password, &salt, &file.ciphertext)?;
        let entries: BTreeMap<String, StoreEntry> =
            serde_json::from_slice(&plaintext)
                .map_err(|e| StoreError::StoreCorrupt(e.to_string()))?;
        Ok(Self { entries })
    }

    /// Like [`load`](Self::load), but a missing file yields a fresh empty
    /// store.
    pub fn load_or_create(
        path: &Path,
        store_password: &str,
    ) -> Result<Self, StoreError> {
        if path.exists() {
            Self::load(path, store_password)
        } else {
            Ok(Self::new())
        }
    }

    /// Encrypt and atomically persist the store to `path`.
    pub fn save(
        &self,
        path: &Path,
        store_password: &str,
    ) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(&self.entries)
            .map_err(|e| StoreError::StoreCorrupt(e.to_string()))?;
        let salt = password::generate_salt()?;
        let ciphertext =
            password::encrypt(store_password, &salt, &plaintext)?;
        let file = StoreFile {
            salt: salt.to_vec(),
            ciphertext,
        };
        let json = serde_json::to_vec(&file)
            .map_err(|e| StoreError::StoreCorrupt(e.to_string()))?;

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        debug!("Persisted credential store: {}", path.display());
        Ok(())
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Insert (or replace) a private key + chain entry. The key material is
    /// encrypted under `key_password` before it enters the map.
    pub fn put_key_entry(
        &mut self,
        alias: &str,
        key: &DerPkcs8Key,
        key_password: &str,
        chain: Vec<DerCert>,
    ) -> Result<(), StoreError> {
        let salt = password::generate_salt()?;
        let encrypted_key =
            password::encrypt(key_password, &salt, key.as_bytes())?;
        self.entries.insert(
            alias.to_owned(),
            StoreEntry::Key {
                salt: salt.to_vec(),
                encrypted_key,
                chain,
            },
        );
        Ok(())
    }

    /// Insert (or replace) a trusted certificate entry.
    pub fn put_trusted_cert(&mut self, alias: &str, cert: DerCert) {
        self.entries
            .insert(alias.to_owned(), StoreEntry::TrustedCert { cert });
    }

    /// Decrypt and return the private key + chain under `alias`.
    pub fn get_key_entry(
        &self,
        alias: &str,
        key_password: &str,
    ) -> Result<(DerPkcs8Key, Vec<DerCert>), StoreError> {
        match self.entries.get(alias) {
            Some(StoreEntry::Key {
                salt,
                encrypted_key,
                chain,
            }) => {
                let salt = to_salt(salt)?;
                let key_der =
                    password::decrypt(key_password, &salt, encrypted_key)?;
                Ok((DerPkcs8Key(key_der), chain.clone()))
            }
            Some(StoreEntry::TrustedCert { .. }) =>
                Err(StoreError::WrongEntryKind(alias.to_owned())),
            None => Err(StoreError::AliasMissing(alias.to_owned())),
        }
    }

    /// Return the certificate under `alias`: the trusted cert itself, or the
    /// leaf of a key entry's chain.
    pub fn get_cert(&self, alias: &str) -> Result<DerCert, StoreError> {
        match self.entries.get(alias) {
            Some(StoreEntry::TrustedCert { cert }) => Ok(cert.clone()),
            Some(StoreEntry::Key { chain, .. }) => chain
                .first()
                .cloned()
                .ok_or_else(|| StoreError::WrongEntryKind(alias.to_owned())),
            None => Err(StoreError::AliasMissing(alias.to_owned())),
        }
    }

    /// The full chain of a key entry, without touching the private key.
    pub fn get_chain(&self, alias: &str) -> Result<Vec<DerCert>, StoreError> {
        match self.entries.get(alias) {
            Some(StoreEntry::Key { chain, .. }) => Ok(chain.clone()),
            Some(StoreEntry::TrustedCert { cert }) => Ok(vec![cert.clone()]),
            None => Err(StoreError::AliasMissing(alias.to_owned())),
        }
    }

    pub fn delete(&mut self, alias: &str) -> Result<(), StoreError> {
        self.entries
            .remove(alias)
            .map(|_| ())
            .ok_or_else(|| StoreError::AliasMissing(alias.to_owned()))
    }
}

fn to_salt(bytes: &[u8]) -> Result<[u8; SALT_LEN], StoreError> {
    bytes
        .try_into()
        .map_err(|_| StoreError::StoreCorrupt("bad salt length".to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;

    const STORE_PW: &str = "store-password";
    const KEY_PW: &str = "key-password";

    fn sample_store() -> CredentialStore {
        let mut store = CredentialStore::new();
        store
            .put_key_entry(
                "nodeca",
                &DerPkcs8Key(vec![1, 2, 3, 4]),
                KEY_PW,
                vec![DerCert(vec![0xde]), DerCert(vec![0xad])],
            )
            .unwrap();
        store.put_trusted_cert("root", DerCert(vec![0xbe, 0xef]));
        store
    }

    #[test]
    fn save_load_roundtrip_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jks");

        let store = sample_store();
        store.save(&path, STORE_PW).unwrap();

        let loaded = CredentialStore::load(&path, STORE_PW).unwrap();
        assert_eq!(store.entries, loaded.entries);

        let (key, chain) = loaded.get_key_entry("nodeca", KEY_PW).unwrap();
        assert_eq!(key.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(chain, vec![DerCert(vec![0xde]), DerCert(vec![0xad])]);
        assert_eq!(loaded.get_cert("root").unwrap(), DerCert(vec![0xbe, 0xef]));
        assert_eq!(loaded.get_cert("nodeca").unwrap(), DerCert(vec![0xde]));
    }

    #[test]
    fn wrong_store_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jks");
        sample_store().save(&path, STORE_PW).unwrap();

        let err = CredentialStore::load(&path, "wrong").unwrap_err();
        assert!(matches!(err, StoreError::BadPassword));
    }

    #[test]
    fn wrong_key_password() {
        let store = sample_store();
        let err = store.get_key_entry("nodeca", "wrong").unwrap_err();
        assert!(matches!(err, StoreError::BadPassword));
    }

    #[test]
    fn store_and_key_passwords_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jks");
        sample_store().save(&path, STORE_PW).unwrap();

        // Opening the container doesn't unlock the key entries.
        let loaded = CredentialStore::load(&path, STORE_PW).unwrap();
        assert!(loaded.get_key_entry("nodeca", STORE_PW).is_err());
        assert!(loaded.get_key_entry("nodeca", KEY_PW).is_ok());
    }

    #[test]
    fn missing_and_mismatched_aliases() {
        let mut store = sample_store();
        assert!(matches!(
            store.get_key_entry("nope", KEY_PW).unwrap_err(),
            StoreError::AliasMissing(_),
        ));
        assert!(matches!(
            store.get_key_entry("root", KEY_PW).unwrap_err(),
            StoreError::WrongEntryKind(_),
        ));
        assert!(matches!(
            store.delete("nope").unwrap_err(),
            StoreError::AliasMissing(_),
        ));

        store.delete("nodeca").unwrap();
        assert!(!store.contains("nodeca"));
        assert!(store.contains("root"));
    }

    #[test]
    fn load_or_create_handles_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.jks");
        let store = CredentialStore::load_or_create(&path, STORE_PW).unwrap();
        assert_eq!(store.aliases().count(), 0);
        // But load() alone refuses.
        assert!(CredentialStore::load(&path, STORE_PW).is_err());
    }

    #[test]
    fn corrupt_container_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jks");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = CredentialStore::load(&path, STORE_PW).unwrap_err();
        assert!(matches!(err, StoreError::StoreCorrupt(_)));
    }
}
