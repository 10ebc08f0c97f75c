// SPDX-License-Identifier: MIT OR Apache-2.0

//! ML-KEM-768 keypair held by every inbox.
//!
//! The server encapsulates towards the public key of an inbox for every email it stores, so the
//! keypair is all that is needed to open the messages of that inbox, next to the pinned server
//! signing key.
use std::fmt;

use thiserror::Error;

use crate::crypto::ml_kem::{
    self, CiphertextBytes, MlKemError, PUBLIC_KEY_SIZE, PublicKeyBytes, SECRET_KEY_SIZE,
    SecretKeyBytes, SharedSecretBytes,
};
use crate::crypto::secret::Secret;

/// ML-KEM-768 keypair of one inbox.
#[derive(Clone, PartialEq, Eq)]
pub struct Keypair {
    public_key: PublicKeyBytes,
    secret_key: Secret<SECRET_KEY_SIZE>,
}

impl Keypair {
    /// Generates a new keypair.
    pub fn generate() -> Result<Self, KeyError> {
        let (public_key, secret_key) = ml_kem::generate()?;
        Ok(Self {
            public_key,
            secret_key: Secret::from_bytes(secret_key),
        })
    }

    /// Restores a keypair from the secret key alone, reading the embedded public key.
    pub fn from_secret_key(secret_key: &[u8]) -> Result<Self, KeyError> {
        let secret_key: SecretKeyBytes =
            secret_key
                .try_into()
                .map_err(|_| KeyError::InvalidSecretKeyLength {
                    expected: SECRET_KEY_SIZE,
                    actual: secret_key.len(),
                })?;

        Ok(Self {
            public_key: ml_kem::public_key_from_secret(&secret_key),
            secret_key: Secret::from_bytes(secret_key),
        })
    }

    /// Restores a keypair from both halves and checks that they belong together.
    pub fn from_parts(public_key: &[u8], secret_key: &[u8]) -> Result<Self, KeyError> {
        if public_key.len() != PUBLIC_KEY_SIZE {
            return Err(KeyError::InvalidPublicKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: public_key.len(),
            });
        }

        let keypair = Self::from_secret_key(secret_key)?;
        if keypair.public_key.as_slice() != public_key {
            return Err(KeyError::PublicKeyMismatch);
        }

        Ok(keypair)
    }

    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public_key
    }

    pub fn secret_key(&self) -> &SecretKeyBytes {
        self.secret_key.as_bytes()
    }

    /// Recovers the shared secret the server encapsulated towards this inbox.
    pub fn decapsulate(&self, ciphertext: &CiphertextBytes) -> Result<SharedSecretBytes, KeyError> {
        Ok(ml_kem::decapsulate(self.secret_key.as_bytes(), ciphertext)?)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &crate::codec::encode_url(&self.public_key[..8]))
            .field("secret_key", &self.secret_key)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid public key length, expected {expected} bytes, got {actual}")]
    InvalidPublicKeyLength { expected: usize, actual: usize },

    #[error("invalid secret key length, expected {expected} bytes, got {actual}")]
    InvalidSecretKeyLength { expected: usize, actual: usize },

    #[error("public key does not match the one embedded in the secret key")]
    PublicKeyMismatch,

    #[error(transparent)]
    MlKem(#[from] MlKemError),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::crypto::ml_kem;

    use super::{KeyError, Keypair};

    #[test]
    fn restore_from_secret_key() {
        let keypair = Keypair::generate().unwrap();
        let restored = Keypair::from_secret_key(keypair.secret_key()).unwrap();
        assert_eq!(keypair, restored);
        assert_eq!(keypair.public_key(), restored.public_key());
    }

    #[test]
    fn restore_from_parts() {
        let keypair = Keypair::generate().unwrap();
        let other = Keypair::generate().unwrap();

        assert!(Keypair::from_parts(keypair.public_key(), keypair.secret_key()).is_ok());
        assert_matches!(
            Keypair::from_parts(other.public_key(), keypair.secret_key()),
            Err(KeyError::PublicKeyMismatch)
        );
        assert_matches!(
            Keypair::from_parts(&keypair.public_key()[1..], keypair.secret_key()),
            Err(KeyError::InvalidPublicKeyLength { actual: 1183, .. })
        );
        assert_matches!(
            Keypair::from_secret_key(&[0; 32]),
            Err(KeyError::InvalidSecretKeyLength { actual: 32, .. })
        );
    }

    #[test]
    fn decapsulate() {
        let keypair = Keypair::generate().unwrap();
        let (ciphertext, shared_secret) = ml_kem::encapsulate(keypair.public_key()).unwrap();
        assert_eq!(keypair.decapsulate(&ciphertext).unwrap(), shared_secret);
    }

    #[test]
    fn debug_hides_secret() {
        let keypair = Keypair::generate().unwrap();
        assert!(format!("{keypair:?}").contains("***"));
    }
}
