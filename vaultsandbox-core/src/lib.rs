// SPDX-License-Identifier: MIT OR Apache-2.0

//! Data types and post-quantum cryptography for VaultSandbox inboxes.
//!
//! Every inbox owns an ML-KEM-768 keypair. The server encrypts each incoming email towards the
//! public key of the inbox, derives an AES-256-GCM key with HKDF-SHA-512 and signs a transcript of
//! the result with its ML-DSA-65 key. The server signing key is pinned when the inbox gets created,
//! payloads signed under any other key are rejected before anything is decrypted.
//!
//! This crate contains the synchronous building blocks of that scheme:
//!
//! * [`envelope`]: verify-then-decrypt of [`EncryptedPayload`]s,
//! * [`keystore`]: inbox keypairs with zeroizing secret storage,
//! * [`inbox`]: inbox descriptors and the portable export format,
//! * [`email`]: decrypted emails, attachments and authentication results,
//! * [`codec`]: the base64 encodings used on the wire.
//!
//! Networking, synchronisation and delivery of emails live in `vaultsandbox-client`.
pub mod codec;
pub mod crypto;
pub mod email;
pub mod envelope;
pub mod inbox;
pub mod keystore;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use email::{
    Attachment, AuthCheck, AuthResults, AuthValidation, DecryptedEmail, EmailError,
};
pub use envelope::{AlgorithmSuite, EncryptedPayload, EnvelopeError, ServerKey};
pub use inbox::{ExportError, ExportedInbox, InboxDescriptor};
pub use keystore::{KeyError, Keypair};
