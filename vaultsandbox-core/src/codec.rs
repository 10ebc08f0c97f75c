// SPDX-License-Identifier: MIT OR Apache-2.0

//! Base64 encodings used by the protocol.
//!
//! Every binary value on the wire uses the URL-safe alphabet without padding (RFC 4648 §5).
//! Attachment contents embedded inside decrypted payloads use the standard alphabet (RFC 4648
//! §4), but we accept any alphabet and padding variant there.
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use thiserror::Error;

/// Encode bytes with the URL-safe alphabet, without padding.
pub fn encode_url(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode a URL-safe, unpadded base64 string.
pub fn decode_url(value: &str) -> Result<Vec<u8>, CodecError> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|err| CodecError::InvalidBase64(err.to_string()))
}

/// Decode a URL-safe, unpadded base64 string into exactly `N` bytes.
pub fn decode_url_fixed<const N: usize>(value: &str) -> Result<[u8; N], CodecError> {
    let bytes = decode_url(value)?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CodecError::InvalidLength { expected: N, actual })
}

/// Encode bytes with the standard alphabet, with padding.
pub fn encode_std(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

/// Decode base64 in any of the common variants.
///
/// Tries standard with padding, standard without padding, URL-safe with padding and URL-safe
/// without padding, in that order. ASCII whitespace (line breaks from MIME encoders) is ignored.
pub fn decode_std_lenient(value: &str) -> Result<Vec<u8>, CodecError> {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    let mut last_error = None;
    for engine in [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        match engine.decode(&compact) {
            Ok(bytes) => return Ok(bytes),
            Err(err) => last_error = Some(err),
        }
    }

    Err(CodecError::InvalidBase64(
        last_error.map(|err| err.to_string()).unwrap_or_default(),
    ))
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    #[error("invalid length after decoding, expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::{
        CodecError, decode_std_lenient, decode_url, decode_url_fixed, encode_std, encode_url,
    };

    #[test]
    fn url_round_trip() {
        // Covers all lengths modulo 3 and every byte value.
        let all_bytes: Vec<u8> = (0..=255).collect();
        for len in 0..=all_bytes.len() {
            let bytes = &all_bytes[..len];
            let encoded = encode_url(bytes);
            assert!(
                encoded
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            );
            assert_eq!(decode_url(&encoded).unwrap(), bytes);
        }
    }

    #[test]
    fn url_rejects_padding_and_standard_alphabet() {
        assert!(decode_url("AA==").is_err());
        assert!(decode_url("+/+/").is_err());
        assert_eq!(decode_url("-_-_").unwrap(), vec![0xfb, 0xff, 0xbf]);
    }

    #[test]
    fn fixed_length() {
        let encoded = encode_url([7u8; 12]);
        let decoded: [u8; 12] = decode_url_fixed(&encoded).unwrap();
        assert_eq!(decoded, [7u8; 12]);

        let result = decode_url_fixed::<16>(&encoded);
        assert_eq!(
            result,
            Err(CodecError::InvalidLength {
                expected: 16,
                actual: 12
            })
        );
    }

    #[test]
    fn lenient_accepts_all_variants() {
        let bytes = vec![0xfb, 0xff, 0xbf, 0x01];
        let expected = bytes.clone();

        assert_eq!(decode_std_lenient(&encode_std(&bytes)).unwrap(), expected);
        assert_eq!(decode_std_lenient("+/+/AQ").unwrap(), expected);
        assert_eq!(decode_std_lenient("-_-_AQ==").unwrap(), expected);
        assert_eq!(decode_std_lenient(&encode_url(&bytes)).unwrap(), expected);
        assert_eq!(decode_std_lenient("+/+/\r\nAQ==").unwrap(), expected);
        assert!(decode_std_lenient("not base64!").is_err());
    }
}
