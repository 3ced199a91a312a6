// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Seed-password sealing of identity signing keys.
//!
//! The sealing key is derived from the seed password with Argon2id and a
//! per-identity random salt, then expanded through HKDF-SHA256. The signing
//! key bytes are sealed with AES-256-GCM. Salt and nonce are stored next to
//! the ciphertext; neither is secret.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use argon2::Argon2;
use hkdf::Hkdf;
use rand_chacha::rand_core::{RngCore as _, SeedableRng as _};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use super::{RandomnessError, signatures::AgentSigningKey};

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const SEALING_KEY_SIZE: usize = 32;

const SEALING_KEY_INFO: &[u8] = b"agent signing key sealing";

/// A signing key sealed under a seed password. This is the at-rest form of
/// the private half of an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedSigningKey {
    #[serde(with = "hex::serde")]
    salt: [u8; SALT_SIZE],
    #[serde(with = "hex::serde")]
    nonce: [u8; NONCE_SIZE],
    #[serde(with = "hex::serde")]
    ciphertext: Vec<u8>,
}

impl SealedSigningKey {
    /// Seal the given signing key under the seed password with a fresh salt
    /// and nonce.
    pub fn seal(key: &AgentSigningKey, seed_password: &str) -> Result<Self, KeySealError> {
        let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
        let mut salt = [0u8; SALT_SIZE];
        rng.try_fill_bytes(&mut salt)
            .map_err(|_| RandomnessError::InsufficientRandomness)?;
        let mut nonce = [0u8; NONCE_SIZE];
        rng.try_fill_bytes(&mut nonce)
            .map_err(|_| RandomnessError::InsufficientRandomness)?;

        let sealing_key = derive_sealing_key(seed_password, &salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&sealing_key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), key.secret_bytes())
            .map_err(|_| KeySealError::Encryption)?;

        Ok(Self {
            salt,
            nonce,
            ciphertext,
        })
    }

    /// Recover the signing key. Fails if the seed password is wrong or the
    /// sealed blob was tampered with.
    pub fn open(&self, seed_password: &str) -> Result<AgentSigningKey, KeyOpenError> {
        let sealing_key = derive_sealing_key(seed_password, &self.salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&sealing_key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|_| KeyOpenError::WrongPasswordOrCorrupt)?;
        AgentSigningKey::from_bytes(&plaintext)
            .map_err(|_| KeyOpenError::WrongPasswordOrCorrupt)
    }
}

fn derive_sealing_key(
    seed_password: &str,
    salt: &[u8; SALT_SIZE],
) -> Result<[u8; SEALING_KEY_SIZE], KeyDerivationError> {
    let mut password_key = [0u8; SEALING_KEY_SIZE];
    Argon2::default()
        .hash_password_into(seed_password.as_bytes(), salt, &mut password_key)
        .map_err(|_| KeyDerivationError::Kdf)?;
    let hkdf = Hkdf::<Sha256>::new(Some(salt), &password_key);
    let mut sealing_key = [0u8; SEALING_KEY_SIZE];
    hkdf.expand(SEALING_KEY_INFO, &mut sealing_key)
        .map_err(|_| KeyDerivationError::Kdf)?;
    Ok(sealing_key)
}

#[derive(Debug, Error)]
pub enum KeyDerivationError {
    #[error("Could not derive the sealing key from the seed password")]
    Kdf,
}

#[derive(Debug, Error)]
pub enum KeySealError {
    #[error(transparent)]
    Randomness(#[from] RandomnessError),
    #[error(transparent)]
    Derivation(#[from] KeyDerivationError),
    #[error("Could not encrypt the signing key")]
    Encryption,
}

#[derive(Debug, Error)]
pub enum KeyOpenError {
    #[error(transparent)]
    Derivation(#[from] KeyDerivationError),
    #[error("Wrong seed password or corrupted key file")]
    WrongPasswordOrCorrupt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = AgentSigningKey::generate().unwrap();
        let sealed = SealedSigningKey::seal(&key, "correct horse").unwrap();
        let opened = sealed.open("correct horse").unwrap();
        assert_eq!(key.verifying_key(), opened.verifying_key());
        assert_eq!(key.secret_bytes(), opened.secret_bytes());
    }

    #[test]
    fn wrong_password_fails() {
        let key = AgentSigningKey::generate().unwrap();
        let sealed = SealedSigningKey::seal(&key, "correct horse").unwrap();
        assert!(matches!(
            sealed.open("battery staple"),
            Err(KeyOpenError::WrongPasswordOrCorrupt)
        ));
    }

    #[test]
    fn sealed_blob_survives_serde() {
        let key = AgentSigningKey::generate().unwrap();
        let sealed = SealedSigningKey::seal(&key, "pw").unwrap();
        let json = serde_json::to_string(&sealed).unwrap();
        let back: SealedSigningKey = serde_json::from_str(&json).unwrap();
        let opened = back.open("pw").unwrap();
        assert_eq!(key.verifying_key(), opened.verifying_key());
    }
}
