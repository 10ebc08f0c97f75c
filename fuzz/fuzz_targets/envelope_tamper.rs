// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]

use std::sync::LazyLock;

use libfuzzer_sys::fuzz_target;
use vaultsandbox_core::codec;
use vaultsandbox_core::envelope::{self, EncryptedPayload};
use vaultsandbox_core::test_utils::ServerSigner;
use vaultsandbox_core::{Keypair, ServerKey};

const PLAINTEXT: &[u8] = br#"{"from":"a@example.com","to":"b@vaultsandbox.test","subject":"hi"}"#;

struct Fixture {
    server_key: ServerKey,
    keypair: Keypair,
    payload: EncryptedPayload,
}

static FIXTURE: LazyLock<Fixture> = LazyLock::new(|| {
    let signer = ServerSigner::generate();
    let keypair = Keypair::generate().expect("ml-kem key generation");
    let payload = signer.seal(PLAINTEXT, keypair.public_key(), b"metadata");
    Fixture {
        server_key: *signer.public_key(),
        keypair,
        payload,
    }
});

fn flip(value: &str, position: usize, mask: u8) -> String {
    let mut bytes = codec::decode_url(value).expect("valid fixture");
    if bytes.is_empty() {
        bytes.push(mask);
    } else {
        let index = position % bytes.len();
        bytes[index] ^= mask;
    }
    codec::encode_url(bytes)
}

// Flip bits in one field of a valid payload, opening it has to fail.
fuzz_target!(|args: (u8, usize, u8)| {
    let (field, position, mask) = args;
    let mask = mask | 1;
    let fixture = &*FIXTURE;

    let mut payload = fixture.payload.clone();
    match field % 7 {
        0 => payload.ct_kem = flip(&payload.ct_kem, position, mask),
        1 => payload.nonce = flip(&payload.nonce, position, mask),
        2 => payload.aad = flip(&payload.aad, position, mask),
        3 => payload.ciphertext = flip(&payload.ciphertext, position, mask),
        4 => payload.sig = flip(&payload.sig, position, mask),
        5 => payload.server_sig_pk = flip(&payload.server_sig_pk, position, mask),
        _ => payload.v ^= u32::from(mask),
    }

    assert!(envelope::open(&payload, &fixture.server_key, &fixture.keypair).is_err());
});
