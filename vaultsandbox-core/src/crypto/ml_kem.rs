// SPDX-License-Identifier: MIT OR Apache-2.0

//! ML-KEM-768 key encapsulation mechanism (FIPS 203).
use fips203::ml_kem_768;
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};
use thiserror::Error;

/// Size of an ML-KEM-768 public (encapsulation) key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 1184;

/// Size of an ML-KEM-768 secret (decapsulation) key in bytes.
pub const SECRET_KEY_SIZE: usize = 2400;

/// Size of an ML-KEM-768 ciphertext in bytes.
pub const CIPHERTEXT_SIZE: usize = 1088;

/// Size of the established shared secret in bytes.
pub const SHARED_SECRET_SIZE: usize = 32;

/// Byte offset of the public key embedded inside the secret key.
pub const PUBLIC_KEY_OFFSET: usize = 1152;

pub type PublicKeyBytes = [u8; PUBLIC_KEY_SIZE];

pub type SecretKeyBytes = [u8; SECRET_KEY_SIZE];

pub type CiphertextBytes = [u8; CIPHERTEXT_SIZE];

pub type SharedSecretBytes = [u8; SHARED_SECRET_SIZE];

/// Generates a fresh ML-KEM-768 keypair using the operating system's randomness.
pub fn generate() -> Result<(PublicKeyBytes, SecretKeyBytes), MlKemError> {
    let (encaps_key, decaps_key) =
        ml_kem_768::KG::try_keygen().map_err(|err| MlKemError::KeyGeneration(err.to_string()))?;
    Ok((encaps_key.into_bytes(), decaps_key.into_bytes()))
}

/// Extracts the public key which FIPS 203 embeds inside every decapsulation key.
pub fn public_key_from_secret(secret_key: &SecretKeyBytes) -> PublicKeyBytes {
    let mut public_key = [0u8; PUBLIC_KEY_SIZE];
    public_key
        .copy_from_slice(&secret_key[PUBLIC_KEY_OFFSET..PUBLIC_KEY_OFFSET + PUBLIC_KEY_SIZE]);
    public_key
}

/// Recovers the shared secret from a ciphertext.
pub fn decapsulate(
    secret_key: &SecretKeyBytes,
    ciphertext: &CiphertextBytes,
) -> Result<SharedSecretBytes, MlKemError> {
    let decaps_key = ml_kem_768::DecapsKey::try_from_bytes(*secret_key)
        .map_err(|err| MlKemError::InvalidSecretKey(err.to_string()))?;
    let ciphertext = ml_kem_768::CipherText::try_from_bytes(*ciphertext)
        .map_err(|err| MlKemError::InvalidCiphertext(err.to_string()))?;
    let shared_secret = decaps_key
        .try_decaps(&ciphertext)
        .map_err(|err| MlKemError::Decapsulation(err.to_string()))?;
    Ok(shared_secret.into_bytes())
}

/// Establishes a shared secret towards the holder of the public key.
pub fn encapsulate(
    public_key: &PublicKeyBytes,
) -> Result<(CiphertextBytes, SharedSecretBytes), MlKemError> {
    let encaps_key = ml_kem_768::EncapsKey::try_from_bytes(*public_key)
        .map_err(|err| MlKemError::InvalidPublicKey(err.to_string()))?;
    let (shared_secret, ciphertext) = encaps_key
        .try_encaps()
        .map_err(|err| MlKemError::Encapsulation(err.to_string()))?;
    Ok((ciphertext.into_bytes(), shared_secret.into_bytes()))
}

#[derive(Debug, Error)]
pub enum MlKemError {
    #[error("ml-kem key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid ml-kem public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid ml-kem secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid ml-kem ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("ml-kem encapsulation failed: {0}")]
    Encapsulation(String),

    #[error("ml-kem decapsulation failed: {0}")]
    Decapsulation(String),
}
