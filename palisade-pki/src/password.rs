//! Password-based encryption / decryption of arbitrary bytes.
//!
//! This module is a relatively thin wrapper around [`ring::pbkdf2`] and
//! [`ring::aead`] which fixes some parameters (algorithm choice, key
//! stretching iterations, etc) to provide a simple API for encrypting and
//! decrypting arbitrary data under a password.
//!
//! The encryption scheme is very simple:
//!
//! Encrypt:
//! - pbkdf2(password, salt) -> aes_key
//! - aes_key.encrypt(nonce, aad=salt, data) -> ciphertext
//! - output = nonce || ciphertext || tag
//!
//! Decrypt:
//! - pbkdf2(password, salt) -> aes_key
//! - aes_key.decrypt(nonce, aad=salt, ciphertext || tag) -> data
//!
//! The main entrypoints to this module are [`encrypt`] and [`decrypt`]. The
//! caller is responsible for persisting the `salt` alongside the ciphertext;
//! the credential store keeps one per container and one per key entry.

use std::num::NonZeroU32;

use ring::{
    aead::{self, Aad, BoundKey, Nonce, NonceSequence, UnboundKey},
    pbkdf2,
    rand::{SecureRandom, SystemRandom},
};
use thiserror::Error;

/// The specific algorithm used for our password encryption scheme.
static PBKDF2_ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;
/// The number of iterations used to stretch the derived key.
const PBKDF2_ITERATIONS: u32 = 100_000;

/// The byte length of salts produced by [`generate_salt`].
pub const SALT_LEN: usize = 32;
/// AES-256-GCM nonce length.
const NONCE_LEN: usize = 12;
/// AES-256-GCM tag length.
const TAG_LEN: usize = 16;

/// The maximum number of characters allowed in the password.
pub const MAX_PASSWORD_LENGTH: usize = 512;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Password cannot have more than {MAX_PASSWORD_LENGTH} characters")]
    PasswordTooLong,
    #[error("Decryption failed: wrong password or corrupt ciphertext")]
    Decrypt,
    #[error("Ciphertext is too short to be valid")]
    CiphertextTooShort,
    #[error("System RNG failed")]
    Rng,
}

/// Sample a fresh random salt.
pub fn generate_salt() -> Result<[u8; SALT_LEN], Error> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new().fill(&mut salt).map_err(|_| Error::Rng)?;
    Ok(salt)
}

/// Password-encrypt some binary `data` to a [`Vec<u8>`] ciphertext.
///
/// The caller must persist `salt` and supply the same value at decryption
/// time. The salt must minimally be unique per container; use
/// [`generate_salt`] and resample whenever the container is rewritten.
///
/// This function does not validate that the supplied password has sufficient
/// entropy. It is the responsibility of the operator to pick store passwords
/// that resist dictionary attacks.
pub fn encrypt(
    password: &str,
    salt: &[u8; SALT_LEN],
    data: &[u8],
) -> Result<Vec<u8>, Error> {
    validate_password_len(password)?;

    let key = derive_aes_key(password, salt);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| Error::Rng)?;

    let mut sealing_key =
        aead::SealingKey::new(key, SingleNonce(Some(nonce_bytes)));

    let mut out = Vec::with_capacity(NONCE_LEN + data.len() + TAG_LEN);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(data);
    let tag = sealing_key
        .seal_in_place_separate_tag(
            Aad::from(salt.as_slice()),
            &mut out[NONCE_LEN..],
        )
        .map_err(|_| Error::Decrypt)?;
    out.extend_from_slice(tag.as_ref());

    Ok(out)
}

/// Given a `password`, `salt`, and some `ciphertext`, decrypts the
/// ciphertext. A wrong password and a corrupt ciphertext are
/// indistinguishable; both surface as [`Error::Decrypt`].
pub fn decrypt(
    password: &str,
    salt: &[u8; SALT_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
    validate_password_len(password)?;

    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::CiphertextTooShort);
    }
    let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
    let nonce_bytes: [u8; NONCE_LEN] =
        nonce_bytes.try_into().expect("Split at NONCE_LEN");

    let key = derive_aes_key(password, salt);
    let mut opening_key =
        aead::OpeningKey::new(key, SingleNonce(Some(nonce_bytes)));

    let mut buf = sealed.to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::from(salt.as_slice()), &mut buf)
        .map_err(|_| Error::Decrypt)?;
    let plaintext_len = plaintext.len();
    buf.truncate(plaintext_len);
    Ok(buf)
}

fn validate_password_len(password: &str) -> Result<(), Error> {
    if password.chars().count() > MAX_PASSWORD_LENGTH {
        return Err(Error::PasswordTooLong);
    }
    Ok(())
}

fn derive_aes_key(password: &str, salt: &[u8; SALT_LEN]) -> UnboundKey {
    let mut key_bytes = [0u8; 32];
    pbkdf2::derive(
        PBKDF2_ALGORITHM,
        NonZeroU32::new(PBKDF2_ITERATIONS).expect("Nonzero constant"),
        salt,
        password.as_bytes(),
        &mut key_bytes,
    );
    UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
        .expect("Key length matches AES-256-GCM")
}

/// A [`NonceSequence`] which yields a single pre-sampled nonce. Each derived
/// key encrypts exactly one message, so a one-shot sequence is all we need.
struct SingleNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let salt = generate_salt().unwrap();
        let data = b"some private key material".as_slice();
        let ciphertext = encrypt("p4ssw0rd", &salt, data).unwrap();
        assert_ne!(&ciphertext, data);
        let plaintext = decrypt("p4ssw0rd", &salt, &ciphertext).unwrap();
        assert_eq!(plaintext, data);
    }

    #[test]
    fn wrong_password_fails() {
        let salt = generate_salt().unwrap();
        let ciphertext = encrypt("correct horse", &salt, b"data").unwrap();
        let err = decrypt("battery staple", &salt, &ciphertext).unwrap_err();
        assert!(matches!(err, Error::Decrypt));
    }

    #[test]
    fn wrong_salt_fails() {
        let salt1 = generate_salt().unwrap();
        let salt2 = generate_salt().unwrap();
        let ciphertext = encrypt("correct horse", &salt1, b"data").unwrap();
        let err = decrypt("correct horse", &salt2, &ciphertext).unwrap_err();
        assert!(matches!(err, Error::Decrypt));
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let salt = generate_salt().unwrap();
        let ciphertext = encrypt("correct horse", &salt, b"data").unwrap();
        let err =
            decrypt("correct horse", &salt, &ciphertext[..10]).unwrap_err();
        assert!(matches!(err, Error::CiphertextTooShort));
    }
}
