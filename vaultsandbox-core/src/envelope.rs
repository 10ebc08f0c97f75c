// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verify-then-decrypt pipeline for encrypted payloads sent by the server.
//!
//! Every payload carries a KEM ciphertext encapsulated towards the inbox public key, an AES-GCM
//! ciphertext and a detached ML-DSA signature of the server over a transcript binding all of these
//! inputs. Opening a payload runs in strict order:
//!
//! 1. The signing key inside the payload must equal the key pinned at inbox creation.
//! 2. Protocol version, algorithm suite and all field sizes must match exactly.
//! 3. The signature over the transcript must verify.
//! 4. Only then the shared secret is decapsulated, the AEAD key derived and the ciphertext
//!    decrypted.
//!
//! Nothing is decapsulated or decrypted for payloads which did not pass verification, so
//! malformed or substituted inputs can not be used as a decryption oracle.
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::crypto::aead::{AEAD_NONCE_SIZE, AeadKey, AeadNonce, aead_decrypt};
use crate::crypto::hkdf::hkdf;
use crate::crypto::ml_dsa::{self, VerifyingKey};
use crate::crypto::ml_kem::{self, CiphertextBytes};
use crate::crypto::sha2::sha2_256;
use crate::keystore::Keypair;

/// The only protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Domain-separation string mixed into the transcript and the key derivation.
pub const CONTEXT: &str = "vaultsandbox:email:v1";

pub const KEM_ALGORITHM: &str = "ML-KEM-768";

pub const SIG_ALGORITHM: &str = "ML-DSA-65";

pub const AEAD_ALGORITHM: &str = "AES-256-GCM";

pub const KDF_ALGORITHM: &str = "HKDF-SHA-512";

/// Server signing public key, pinned when an inbox gets created or imported.
pub type ServerKey = ml_dsa::PublicKeyBytes;

/// Names of the algorithms used to produce a payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmSuite {
    pub kem: String,
    pub sig: String,
    pub aead: String,
    pub kdf: String,
}

impl AlgorithmSuite {
    /// The one suite this implementation accepts.
    pub fn supported() -> Self {
        Self {
            kem: KEM_ALGORITHM.to_string(),
            sig: SIG_ALGORITHM.to_string(),
            aead: AEAD_ALGORITHM.to_string(),
            kdf: KDF_ALGORITHM.to_string(),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.kem == KEM_ALGORITHM
            && self.sig == SIG_ALGORITHM
            && self.aead == AEAD_ALGORITHM
            && self.kdf == KDF_ALGORITHM
    }

    fn transcript_label(&self) -> String {
        format!("{}:{}:{}:{}", self.kem, self.sig, self.aead, self.kdf)
    }
}

/// Encrypted and signed payload as received from the server.
///
/// All binary fields are base64url strings without padding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub v: u32,
    pub algs: AlgorithmSuite,
    #[serde(alias = "ctKem")]
    pub ct_kem: String,
    pub nonce: String,
    pub aad: String,
    pub ciphertext: String,
    pub sig: String,
    #[serde(alias = "serverSigPk")]
    pub server_sig_pk: String,
}

/// Decoded binary fields of a payload which passed all size checks.
struct DecodedPayload {
    ct_kem: CiphertextBytes,
    nonce: AeadNonce,
    aad: Vec<u8>,
    ciphertext: Vec<u8>,
}

/// Checks that the payload was signed by the pinned server key over the canonical transcript.
pub fn verify(payload: &EncryptedPayload, pinned_key: &ServerKey) -> Result<(), EnvelopeError> {
    verify_decoded(payload, pinned_key).map(|_| ())
}

/// Decrypts a payload with the secret key of an inbox, without checking its signature.
///
/// Use [`open`] unless the payload was verified already.
pub fn decrypt(payload: &EncryptedPayload, keypair: &Keypair) -> Result<Vec<u8>, EnvelopeError> {
    check_suite(payload)?;
    let ct_kem: CiphertextBytes = decode_fixed(&payload.ct_kem, "ct_kem")?;
    let nonce: AeadNonce = decode_fixed(&payload.nonce, "nonce")?;
    let aad = decode(&payload.aad, "aad")?;
    let ciphertext = decode(&payload.ciphertext, "ciphertext")?;
    decrypt_decoded(&ct_kem, &nonce, &aad, &ciphertext, keypair)
}

/// Verifies and then decrypts a payload.
///
/// Decryption is never attempted for payloads which fail verification.
pub fn open(
    payload: &EncryptedPayload,
    pinned_key: &ServerKey,
    keypair: &Keypair,
) -> Result<Vec<u8>, EnvelopeError> {
    let decoded = verify_decoded(payload, pinned_key)?;
    decrypt_decoded(
        &decoded.ct_kem,
        &decoded.nonce,
        &decoded.aad,
        &decoded.ciphertext,
        keypair,
    )
}

/// Canonical byte string signed by the server.
pub fn transcript(
    version: u32,
    algs: &AlgorithmSuite,
    ct_kem: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
    server_sig_pk: &[u8],
) -> Vec<u8> {
    let label = algs.transcript_label();
    let mut transcript = Vec::with_capacity(
        1 + label.len()
            + CONTEXT.len()
            + ct_kem.len()
            + nonce.len()
            + aad.len()
            + ciphertext.len()
            + server_sig_pk.len(),
    );
    // Versions are small integers, only the lowest byte is part of the transcript.
    transcript.push(version as u8);
    transcript.extend_from_slice(label.as_bytes());
    transcript.extend_from_slice(CONTEXT.as_bytes());
    transcript.extend_from_slice(ct_kem);
    transcript.extend_from_slice(nonce);
    transcript.extend_from_slice(aad);
    transcript.extend_from_slice(ciphertext);
    transcript.extend_from_slice(server_sig_pk);
    transcript
}

/// Derives the AEAD key from the KEM shared secret, bound to the KEM ciphertext and the AAD.
pub fn derive_key(
    shared_secret: &[u8],
    ct_kem: &[u8],
    aad: &[u8],
) -> Result<AeadKey, EnvelopeError> {
    let salt = sha2_256(&[ct_kem]);
    let aad_len = u32::try_from(aad.len()).map_err(|_| EnvelopeError::SizeMismatch {
        field: "aad",
        expected: u32::MAX as usize,
        actual: aad.len(),
    })?;

    let mut info = Vec::with_capacity(CONTEXT.len() + 4 + aad.len());
    info.extend_from_slice(CONTEXT.as_bytes());
    info.extend_from_slice(&aad_len.to_be_bytes());
    info.extend_from_slice(aad);

    hkdf(&salt, shared_secret, &info).map_err(|_| EnvelopeError::AeadFailure)
}

fn verify_decoded(
    payload: &EncryptedPayload,
    pinned_key: &ServerKey,
) -> Result<DecodedPayload, EnvelopeError> {
    // Key pinning comes first: a payload signed under any other key is rejected before we look
    // at anything else in it.
    // A key which does not even decode is just another key.
    let server_sig_pk =
        codec::decode_url(&payload.server_sig_pk).map_err(|_| EnvelopeError::KeyMismatch)?;
    if !bool::from(server_sig_pk.as_slice().ct_eq(pinned_key.as_slice())) {
        return Err(EnvelopeError::KeyMismatch);
    }

    check_suite(payload)?;

    let ct_kem = decode(&payload.ct_kem, "ct_kem")?;
    let nonce = decode(&payload.nonce, "nonce")?;
    let aad = decode(&payload.aad, "aad")?;
    let ciphertext = decode(&payload.ciphertext, "ciphertext")?;
    let sig = decode(&payload.sig, "sig")?;

    let ct_kem: CiphertextBytes = check_size(ct_kem, "ct_kem")?;
    let nonce: AeadNonce = check_size(nonce, "nonce")?;
    let sig: ml_dsa::SignatureBytes = check_size(sig, "sig")?;
    let server_sig_pk: ServerKey = check_size(server_sig_pk, "server_sig_pk")?;

    let verifying_key =
        VerifyingKey::from_bytes(&server_sig_pk).map_err(|_| EnvelopeError::BadKeyFormat)?;

    let transcript = transcript(
        payload.v,
        &payload.algs,
        &ct_kem,
        &nonce,
        &aad,
        &ciphertext,
        &server_sig_pk,
    );
    if !verifying_key.verify(&transcript, &sig) {
        return Err(EnvelopeError::BadSignature);
    }

    Ok(DecodedPayload {
        ct_kem,
        nonce,
        aad,
        ciphertext,
    })
}

fn decrypt_decoded(
    ct_kem: &CiphertextBytes,
    nonce: &AeadNonce,
    aad: &[u8],
    ciphertext: &[u8],
    keypair: &Keypair,
) -> Result<Vec<u8>, EnvelopeError> {
    let shared_secret = keypair
        .decapsulate(ct_kem)
        .map_err(|_| EnvelopeError::BadPrivateKey)?;
    let key = derive_key(&shared_secret, ct_kem, aad)?;
    aead_decrypt(&key, ciphertext, nonce, aad).map_err(|_| EnvelopeError::AeadFailure)
}

fn check_suite(payload: &EncryptedPayload) -> Result<(), EnvelopeError> {
    if payload.v != PROTOCOL_VERSION {
        return Err(EnvelopeError::VersionMismatch(payload.v));
    }

    if !payload.algs.is_supported() {
        return Err(EnvelopeError::AlgMismatch(payload.algs.transcript_label()));
    }

    Ok(())
}

fn decode(value: &str, field: &'static str) -> Result<Vec<u8>, EnvelopeError> {
    codec::decode_url(value).map_err(|err| EnvelopeError::BadBase64 { field, source: err })
}

fn decode_fixed<const N: usize>(value: &str, field: &'static str) -> Result<[u8; N], EnvelopeError> {
    check_size(decode(value, field)?, field)
}

fn check_size<const N: usize>(bytes: Vec<u8>, field: &'static str) -> Result<[u8; N], EnvelopeError> {
    let actual = bytes.len();
    bytes.try_into().map_err(|_| EnvelopeError::SizeMismatch {
        field,
        expected: N,
        actual,
    })
}

// Sizes are part of the protocol, make sure the constants agree with the primitives.
const _: () = assert!(AEAD_NONCE_SIZE == 12);
const _: () = assert!(ml_kem::CIPHERTEXT_SIZE == 1088);
const _: () = assert!(ml_dsa::PUBLIC_KEY_SIZE == 1952);
const _: () = assert!(ml_dsa::SIGNATURE_SIZE == 3309);

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("server signing key in payload does not match pinned key")]
    KeyMismatch,

    #[error("unsupported protocol version {0}")]
    VersionMismatch(u32),

    #[error("unsupported algorithm suite {0}")]
    AlgMismatch(String),

    #[error("invalid size of {field}, expected {expected} bytes, got {actual}")]
    SizeMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid base64 in {field}: {source}")]
    BadBase64 {
        field: &'static str,
        #[source]
        source: CodecError,
    },

    #[error("signature verification failed")]
    BadSignature,

    #[error("server signing key could not be parsed")]
    BadKeyFormat,

    #[error("inbox secret key could not be used for decapsulation")]
    BadPrivateKey,

    #[error("authenticated decryption failed")]
    AeadFailure,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::codec;
    use crate::keystore::Keypair;
    use crate::test_utils::ServerSigner;

    use super::{AlgorithmSuite, EncryptedPayload, EnvelopeError, decrypt, open, verify};

    const PLAINTEXT: &[u8] =
        br#"{"from":"a@x","subject":"hi","text":"ok","receivedAt":"2024-01-01T00:00:00Z"}"#;

    fn fixture() -> (ServerSigner, Keypair, EncryptedPayload) {
        let signer = ServerSigner::generate();
        let keypair = Keypair::generate().unwrap();
        let payload = signer.seal(PLAINTEXT, keypair.public_key(), b"metadata");
        (signer, keypair, payload)
    }

    fn flip_last_byte(value: &str) -> String {
        let mut bytes = codec::decode_url(value).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        codec::encode_url(bytes)
    }

    #[test]
    fn happy_path() {
        let (signer, keypair, payload) = fixture();

        assert!(verify(&payload, signer.public_key()).is_ok());
        let plaintext = open(&payload, signer.public_key(), &keypair).unwrap();
        assert_eq!(plaintext, PLAINTEXT);
    }

    #[test]
    fn swapped_server_key() {
        let (_, keypair, payload) = fixture();
        let other_signer = ServerSigner::generate();

        assert_matches!(
            open(&payload, other_signer.public_key(), &keypair),
            Err(EnvelopeError::KeyMismatch)
        );

        // Mismatch is detected before any KEM operation: a keypair which could never decapsulate
        // this payload yields the same error.
        let unrelated = Keypair::generate().unwrap();
        assert_matches!(
            open(&payload, other_signer.public_key(), &unrelated),
            Err(EnvelopeError::KeyMismatch)
        );
    }

    #[test]
    fn payload_carries_attacker_key() {
        let (signer, keypair, payload) = fixture();

        // Attacker re-signs the payload with their own key and embeds it.
        let attacker = ServerSigner::generate();
        let forged = attacker.resign(EncryptedPayload {
            server_sig_pk: codec::encode_url(attacker.public_key()),
            ..payload
        });

        assert_matches!(
            open(&forged, signer.public_key(), &keypair),
            Err(EnvelopeError::KeyMismatch)
        );
    }

    #[test]
    fn undecodable_server_key_is_a_mismatch() {
        let (signer, keypair, payload) = fixture();

        for server_sig_pk in ["not base64!", "", "AAAA"] {
            let tampered = EncryptedPayload {
                server_sig_pk: server_sig_pk.to_string(),
                ..payload.clone()
            };
            assert_matches!(
                open(&tampered, signer.public_key(), &keypair),
                Err(EnvelopeError::KeyMismatch)
            );
        }
    }

    #[test]
    fn flipped_aad() {
        let (signer, keypair, payload) = fixture();
        let tampered = EncryptedPayload {
            aad: flip_last_byte(&payload.aad),
            ..payload
        };

        assert_matches!(
            open(&tampered, signer.public_key(), &keypair),
            Err(EnvelopeError::BadSignature)
        );
    }

    #[test]
    fn truncated_ciphertext_after_resigning() {
        let (signer, keypair, payload) = fixture();

        let mut ciphertext = codec::decode_url(&payload.ciphertext).unwrap();
        ciphertext.pop();
        let truncated = signer.resign(EncryptedPayload {
            ciphertext: codec::encode_url(ciphertext),
            ..payload
        });

        assert!(verify(&truncated, signer.public_key()).is_ok());
        assert_matches!(
            open(&truncated, signer.public_key(), &keypair),
            Err(EnvelopeError::AeadFailure)
        );
    }

    #[test]
    fn any_flipped_field_fails() {
        let (signer, keypair, payload) = fixture();

        let mut candidates = vec![
            EncryptedPayload {
                ct_kem: flip_last_byte(&payload.ct_kem),
                ..payload.clone()
            },
            EncryptedPayload {
                nonce: flip_last_byte(&payload.nonce),
                ..payload.clone()
            },
            EncryptedPayload {
                aad: flip_last_byte(&payload.aad),
                ..payload.clone()
            },
            EncryptedPayload {
                ciphertext: flip_last_byte(&payload.ciphertext),
                ..payload.clone()
            },
            EncryptedPayload {
                server_sig_pk: flip_last_byte(&payload.server_sig_pk),
                ..payload.clone()
            },
            EncryptedPayload {
                sig: flip_last_byte(&payload.sig),
                ..payload.clone()
            },
            EncryptedPayload {
                v: 2,
                ..payload.clone()
            },
        ];

        for slot in 0..4 {
            let mut algs = payload.algs.clone();
            let name = match slot {
                0 => &mut algs.kem,
                1 => &mut algs.sig,
                2 => &mut algs.aead,
                _ => &mut algs.kdf,
            };
            // Flip a single bit of the last character.
            let mut bytes = name.clone().into_bytes();
            let last = bytes.len() - 1;
            bytes[last] ^= 0x01;
            *name = String::from_utf8(bytes).unwrap();
            candidates.push(EncryptedPayload {
                algs,
                ..payload.clone()
            });
        }

        for candidate in candidates {
            assert!(open(&candidate, signer.public_key(), &keypair).is_err());
        }
    }

    #[test]
    fn algorithm_and_size_pinning() {
        let (signer, keypair, payload) = fixture();

        let other_suite = EncryptedPayload {
            algs: AlgorithmSuite {
                kem: "ML-KEM-1024".into(),
                ..AlgorithmSuite::supported()
            },
            ..payload.clone()
        };
        assert_matches!(
            open(&other_suite, signer.public_key(), &keypair),
            Err(EnvelopeError::AlgMismatch(_))
        );

        let short_nonce = EncryptedPayload {
            nonce: codec::encode_url([0u8; 8]),
            ..payload.clone()
        };
        assert_matches!(
            open(&short_nonce, signer.public_key(), &keypair),
            Err(EnvelopeError::SizeMismatch { field: "nonce", expected: 12, actual: 8 })
        );

        let bad_base64 = EncryptedPayload {
            sig: "not base64!".into(),
            ..payload
        };
        assert_matches!(
            open(&bad_base64, signer.public_key(), &keypair),
            Err(EnvelopeError::BadBase64 { field: "sig", .. })
        );
    }

    #[test]
    fn wrong_inbox_key() {
        let (signer, _, payload) = fixture();
        let other_keypair = Keypair::generate().unwrap();

        // Signature is valid, but the payload was not encrypted towards this inbox.
        assert_matches!(
            open(&payload, signer.public_key(), &other_keypair),
            Err(EnvelopeError::AeadFailure)
        );
    }

    #[test]
    fn decrypt_without_verification() {
        let (_, keypair, payload) = fixture();
        assert_eq!(decrypt(&payload, &keypair).unwrap(), PLAINTEXT);
    }

    #[test]
    fn json_field_names() {
        let (_, _, payload) = fixture();
        let json = serde_json::to_value(&payload).unwrap();
        for key in ["v", "algs", "ct_kem", "nonce", "aad", "ciphertext", "sig", "server_sig_pk"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }

        // camelCase spelling is accepted as well.
        let mut camel = json.clone();
        let object = camel.as_object_mut().unwrap();
        let ct_kem = object.remove("ct_kem").unwrap();
        let server_sig_pk = object.remove("server_sig_pk").unwrap();
        object.insert("ctKem".into(), ct_kem);
        object.insert("serverSigPk".into(), server_sig_pk);
        let parsed: EncryptedPayload = serde_json::from_value(camel).unwrap();
        assert_eq!(parsed, payload);
    }
}
