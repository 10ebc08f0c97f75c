// SPDX-License-Identifier: MIT OR Apache-2.0

//! Implementations of all cryptographic algorithms of the pinned suite: ML-KEM-768, ML-DSA-65,
//! AES-256-GCM and HKDF-SHA-512.
pub mod aead;
pub mod hkdf;
pub mod ml_dsa;
pub mod ml_kem;
pub mod secret;
pub mod sha2;
