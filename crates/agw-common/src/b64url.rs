//! Unpadded base64url encoding for keys and signatures.
//!
//! Wraps the `base64` crate with convenience functions for the transport
//! form used by the connect handshake.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;

pub use base64::DecodeError;

/// Errors that can occur when decoding a fixed-size key.
#[derive(Debug, Error)]
pub enum KeyDecodeError {
    /// The input is not valid base64url.
    #[error("invalid base64url: {0}")]
    Base64(#[from] DecodeError),
    /// The decoded bytes are not exactly 32 bytes.
    #[error("key must be exactly 32 bytes, got {0}")]
    WrongLength(usize),
}

/// Encodes raw bytes as unpadded base64url.
///
/// # Examples
///
/// ```
/// assert_eq!(agw_common::b64url::encode(&[0xfb, 0xff]), "-_8");
/// ```
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes unpadded base64url. Trailing `=` padding is tolerated.
///
/// # Errors
///
/// Returns `DecodeError` if the input is not valid base64url.
pub fn decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE_NO_PAD.decode(s.trim_end_matches('='))
}

/// Decodes a base64url string to a 32-byte key.
///
/// # Errors
///
/// Returns [`KeyDecodeError`] if the input is not valid base64url or does
/// not decode to exactly 32 bytes.
pub fn decode_key(s: &str) -> Result<[u8; 32], KeyDecodeError> {
    let bytes = decode(s)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_: Vec<u8>| KeyDecodeError::WrongLength(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_url_safe_and_unpadded() {
        let encoded = encode(&[0xFFu8; 31]);
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
    }

    #[test]
    fn decode_accepts_padding() {
        assert_eq!(decode("AQI=").unwrap(), vec![1, 2]);
    }

    #[test]
    fn decode_key_wrong_length() {
        let short = encode(&[1u8; 16]);
        let err = decode_key(&short).unwrap_err();
        assert!(matches!(err, KeyDecodeError::WrongLength(16)));
    }

    #[test]
    fn decode_key_rejects_garbage() {
        assert!(matches!(
            decode_key("not base64!"),
            Err(KeyDecodeError::Base64(_))
        ));
    }
}
