// SPDX-License-Identifier: MIT OR Apache-2.0

//! AES-256-GCM authenticated symmetric encryption with additional data (AEAD) with 256-bit key,
//! 128-bit tag and 96-bit nonce.
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use thiserror::Error;

pub const AEAD_KEY_SIZE: usize = 32;

pub const AEAD_NONCE_SIZE: usize = 12;

pub const AEAD_TAG_SIZE: usize = 16;

pub type AeadKey = [u8; AEAD_KEY_SIZE];

pub type AeadNonce = [u8; AEAD_NONCE_SIZE];

/// Encrypts the plaintext and attaches the authentication tag to the end of the ciphertext.
pub fn aead_encrypt(
    key: &AeadKey,
    plaintext: &[u8],
    nonce: &AeadNonce,
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Encrypt)
}

/// Decrypts a ciphertext with the authentication tag attached to its end.
pub fn aead_decrypt(
    key: &AeadKey,
    ciphertext_tag: &[u8],
    nonce: &AeadNonce,
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    if ciphertext_tag.len() < AEAD_TAG_SIZE {
        return Err(AeadError::MissingTag);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext_tag,
                aad,
            },
        )
        .map_err(|_| AeadError::Decrypt)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("ciphertext is shorter than the authentication tag")]
    MissingTag,

    #[error("could not encrypt with aead")]
    Encrypt,

    #[error("could not decrypt with aead")]
    Decrypt,
}
