// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ed25519 identity keys and detached signatures.
//!
//! A signature travels on the wire as a base64 string, both in HTTP bodies
//! and inside the binary heartbeat record.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signer as _, Verifier as _};
use serde::{Deserialize, Serialize, de};
use thiserror::Error;

use super::{KeyGenerationError, SecretBytes};

pub const SIGNATURE_SIZE: usize = ed25519_dalek::SIGNATURE_LENGTH;
pub const VERIFYING_KEY_SIZE: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;
pub const SIGNING_KEY_SIZE: usize = ed25519_dalek::SECRET_KEY_LENGTH;

/// A key that can be used to verify signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentVerifyingKey {
    key: Vec<u8>,
}

impl AgentVerifyingKey {
    pub(super) fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, SignatureVerificationError> {
        if bytes.len() != VERIFYING_KEY_SIZE {
            return Err(SignatureVerificationError::InvalidKeyMaterial);
        }
        Ok(Self { key: bytes })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.key
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.key)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, SignatureVerificationError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| SignatureVerificationError::InvalidKeyMaterial)?;
        Self::from_bytes(bytes)
    }

    /// Verify the given signature over the given payload.
    pub fn verify(
        &self,
        payload: &[u8],
        signature: &Signature,
    ) -> Result<(), SignatureVerificationError> {
        let key_bytes: &[u8; VERIFYING_KEY_SIZE] = self
            .key
            .as_slice()
            .try_into()
            .map_err(|_| SignatureVerificationError::InvalidKeyMaterial)?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(key_bytes)
            .map_err(|_| SignatureVerificationError::InvalidKeyMaterial)?;
        let signature_bytes: &[u8; SIGNATURE_SIZE] = signature
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignatureVerificationError::VerificationFailure)?;
        key.verify(payload, &ed25519_dalek::Signature::from_bytes(signature_bytes))
            .map_err(|_| SignatureVerificationError::VerificationFailure)
    }
}

/// The key an agent signs protocol payloads with. It also contains the
/// matching public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSigningKey {
    signing_key: SecretBytes,
    verifying_key: AgentVerifyingKey,
}

impl AgentSigningKey {
    /// Generate a new signing key.
    pub fn generate() -> Result<Self, KeyGenerationError> {
        let key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        Ok(Self {
            verifying_key: AgentVerifyingKey::new(key.verifying_key().to_bytes().to_vec()),
            signing_key: SecretBytes::from(key.to_bytes().to_vec()),
        })
    }

    /// Reconstruct a signing key from raw secret bytes, e.g. after unsealing.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyGenerationError> {
        let key_bytes: &[u8; SIGNING_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| KeyGenerationError::KeypairGeneration)?;
        let key = ed25519_dalek::SigningKey::from_bytes(key_bytes);
        Ok(Self {
            verifying_key: AgentVerifyingKey::new(key.verifying_key().to_bytes().to_vec()),
            signing_key: SecretBytes::from(key.to_bytes().to_vec()),
        })
    }

    pub fn verifying_key(&self) -> &AgentVerifyingKey {
        &self.verifying_key
    }

    pub(crate) fn secret_bytes(&self) -> &[u8] {
        &self.signing_key
    }

    #[cfg(any(test, feature = "test_utils"))]
    pub fn secret_bytes_for_test(&self) -> &[u8] {
        &self.signing_key
    }

    /// Sign the given payload with this signing key.
    pub fn sign(&self, payload: &[u8]) -> Signature {
        // The secret was length-checked on construction.
        let key_bytes: &[u8; SIGNING_KEY_SIZE] =
            self.signing_key.as_slice().try_into().unwrap();
        let key = ed25519_dalek::SigningKey::from_bytes(key_bytes);
        Signature {
            bytes: key.sign(payload).to_bytes().to_vec(),
        }
    }
}

/// A detached signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    bytes: Vec<u8>,
}

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, SignatureVerificationError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| SignatureVerificationError::MalformedSignature)?;
        Ok(Self { bytes })
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum SignatureVerificationError {
    #[error("Could not verify this signature with the given payload.")]
    VerificationFailure,
    #[error("The key material does not form a valid Ed25519 key.")]
    InvalidKeyMaterial,
    #[error("The signature encoding is malformed.")]
    MalformedSignature,
}
