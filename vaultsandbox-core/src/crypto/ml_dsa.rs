// SPDX-License-Identifier: MIT OR Apache-2.0

//! ML-DSA-65 signature verification (FIPS 204).
//!
//! Signatures are created with an empty context string.
use fips204::ml_dsa_65;
#[cfg(any(test, feature = "test_utils"))]
use fips204::traits::Signer;
use fips204::traits::{SerDes, Verifier};
use thiserror::Error;

/// Size of an ML-DSA-65 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 1952;

/// Size of an ML-DSA-65 signature in bytes.
pub const SIGNATURE_SIZE: usize = 3309;

pub type PublicKeyBytes = [u8; PUBLIC_KEY_SIZE];

pub type SignatureBytes = [u8; SIGNATURE_SIZE];

/// Parsed ML-DSA-65 public key.
#[derive(Clone)]
pub struct VerifyingKey(ml_dsa_65::PublicKey);

impl VerifyingKey {
    pub fn from_bytes(bytes: &PublicKeyBytes) -> Result<Self, MlDsaError> {
        let public_key = ml_dsa_65::PublicKey::try_from_bytes(*bytes)
            .map_err(|err| MlDsaError::InvalidPublicKey(err.to_string()))?;
        Ok(Self(public_key))
    }

    /// Returns `true` if the signature is valid for this message.
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> bool {
        self.0.verify(message, signature, &[])
    }
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VerifyingKey").finish()
    }
}

/// ML-DSA-65 signing key, only used to produce fixtures in tests.
#[cfg(any(test, feature = "test_utils"))]
pub struct SigningKey {
    private_key: ml_dsa_65::PrivateKey,
    public_key: PublicKeyBytes,
}

#[cfg(any(test, feature = "test_utils"))]
impl SigningKey {
    pub fn generate() -> Result<Self, MlDsaError> {
        let (public_key, private_key) =
            ml_dsa_65::try_keygen().map_err(|err| MlDsaError::KeyGeneration(err.to_string()))?;
        Ok(Self {
            private_key,
            public_key: public_key.into_bytes(),
        })
    }

    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public_key
    }

    pub fn sign(&self, message: &[u8]) -> Result<SignatureBytes, MlDsaError> {
        self.private_key
            .try_sign(message, &[])
            .map_err(|err| MlDsaError::Signing(err.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum MlDsaError {
    #[error("invalid ml-dsa public key: {0}")]
    InvalidPublicKey(String),

    #[error("ml-dsa key generation failed: {0}")]
    KeyGeneration(String),

    #[error("ml-dsa signing failed: {0}")]
    Signing(String),
}
