// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cryptographic primitives of the client: Ed25519 identity keys, the
//! seed-password key sealing scheme, and PEM helpers for certificate
//! material.

use thiserror::Error;

mod secrets;
pub mod seal;
pub mod signatures;

pub use secrets::SecretBytes;

#[derive(Debug, Error)]
pub enum RandomnessError {
    #[error("Not enough randomness available")]
    InsufficientRandomness,
}

#[derive(Debug, Error)]
pub enum KeyGenerationError {
    #[error("Could not generate the keypair")]
    KeypairGeneration,
}

/// PEM tag used for certificate chains issued by the authority.
pub const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";

/// Checks that the given PEM text contains at least one certificate block.
pub fn validate_certificate_pem(pem_text: &str) -> Result<(), CertificatePemError> {
    let blocks = pem::parse_many(pem_text.as_bytes())?;
    if blocks.is_empty() {
        return Err(CertificatePemError::Empty);
    }
    if let Some(block) = blocks.iter().find(|b| b.tag() != CERTIFICATE_PEM_TAG) {
        return Err(CertificatePemError::UnexpectedTag(block.tag().to_owned()));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum CertificatePemError {
    #[error(transparent)]
    Malformed(#[from] pem::PemError),
    #[error("The PEM text contains no certificate blocks")]
    Empty,
    #[error("Unexpected PEM block tag: {0}")]
    UnexpectedTag(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_pem_validation() {
        let block = pem::Pem::new(CERTIFICATE_PEM_TAG, vec![1, 2, 3]);
        let text = pem::encode(&block);
        validate_certificate_pem(&text).unwrap();

        assert!(matches!(
            validate_certificate_pem(""),
            Err(CertificatePemError::Empty)
        ));

        let wrong = pem::encode(&pem::Pem::new("PRIVATE KEY", vec![1]));
        assert!(matches!(
            validate_certificate_pem(&wrong),
            Err(CertificatePemError::UnexpectedTag(_))
        ));
    }
}
