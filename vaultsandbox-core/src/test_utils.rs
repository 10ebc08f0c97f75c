// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixtures to produce valid server payloads in tests.
use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec;
use crate::crypto::aead::{AeadNonce, aead_encrypt};
use crate::crypto::ml_dsa::SigningKey;
use crate::crypto::ml_kem::{self, PublicKeyBytes};
use crate::envelope::{
    AlgorithmSuite, EncryptedPayload, PROTOCOL_VERSION, ServerKey, derive_key, transcript,
};

/// Plays the role of the server: encrypts towards inbox public keys and signs the transcript.
pub struct ServerSigner {
    signing_key: SigningKey,
    nonce_counter: AtomicU64,
}

impl ServerSigner {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate().expect("ml-dsa key generation"),
            nonce_counter: AtomicU64::new(1),
        }
    }

    pub fn public_key(&self) -> &ServerKey {
        self.signing_key.public_key()
    }

    /// Public key in the base64url form the server advertises.
    pub fn public_key_b64(&self) -> String {
        codec::encode_url(self.public_key())
    }

    /// Encrypts the plaintext towards an inbox and signs the resulting payload.
    pub fn seal(
        &self,
        plaintext: &[u8],
        inbox_public_key: &PublicKeyBytes,
        aad: &[u8],
    ) -> EncryptedPayload {
        let (ct_kem, shared_secret) =
            ml_kem::encapsulate(inbox_public_key).expect("ml-kem encapsulation");
        let key = derive_key(&shared_secret, &ct_kem, aad).expect("key derivation");
        let nonce = self.next_nonce();
        let ciphertext = aead_encrypt(&key, plaintext, &nonce, aad).expect("aead encryption");

        self.resign(EncryptedPayload {
            v: PROTOCOL_VERSION,
            algs: AlgorithmSuite::supported(),
            ct_kem: codec::encode_url(ct_kem),
            nonce: codec::encode_url(nonce),
            aad: codec::encode_url(aad),
            ciphertext: codec::encode_url(ciphertext),
            sig: String::new(),
            server_sig_pk: self.public_key_b64(),
        })
    }

    /// Computes a fresh signature over the (possibly modified) payload fields.
    pub fn resign(&self, payload: EncryptedPayload) -> EncryptedPayload {
        let decode = |value: &str| codec::decode_url(value).expect("valid base64 in fixture");
        let transcript = transcript(
            payload.v,
            &payload.algs,
            &decode(&payload.ct_kem),
            &decode(&payload.nonce),
            &decode(&payload.aad),
            &decode(&payload.ciphertext),
            &decode(&payload.server_sig_pk),
        );
        let signature = self.signing_key.sign(&transcript).expect("ml-dsa signing");

        EncryptedPayload {
            sig: codec::encode_url(signature),
            ..payload
        }
    }

    fn next_nonce(&self) -> AeadNonce {
        let counter = self.nonce_counter.fetch_add(1, Ordering::Relaxed);
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }
}

impl std::fmt::Debug for ServerSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSigner").finish_non_exhaustive()
    }
}
