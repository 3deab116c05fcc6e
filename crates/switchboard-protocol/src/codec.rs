//! Codec for encoding and decoding Switchboard envelopes.
//!
//! Envelopes are plain JSON text. One WebSocket frame carries exactly one
//! envelope, so there is no length prefix or stream reassembly here.

use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds the size limit.
    #[error("Envelope size {size} exceeds maximum {max}")]
    EnvelopeTooLarge { size: usize, max: usize },

    /// Binary payload was not UTF-8 text.
    #[error("Envelope is not valid UTF-8")]
    InvalidUtf8,

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an envelope to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode an envelope from JSON text, using [`MAX_ENVELOPE_SIZE`].
///
/// # Errors
///
/// Returns an error if the text is too large or is not a valid envelope.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    decode_limited(text, MAX_ENVELOPE_SIZE)
}

/// Decode an envelope from JSON text with an explicit size limit.
///
/// # Errors
///
/// Returns an error if the text is too large or is not a valid envelope.
pub fn decode_limited(text: &str, max_size: usize) -> Result<Envelope, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::EnvelopeTooLarge {
            size: text.len(),
            max: max_size,
        });
    }
    Ok(serde_json::from_str(text)?)
}

/// Decode an envelope carried in a binary frame.
///
/// # Errors
///
/// Returns an error if the bytes are not UTF-8 or not a valid envelope.
pub fn decode_bytes(data: &[u8]) -> Result<Envelope, ProtocolError> {
    let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
    decode(text)
}

/// Envelope codec carrying a size limit.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_size: usize,
}

impl EnvelopeCodec {
    /// Create a codec with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_size(MAX_ENVELOPE_SIZE)
    }

    /// Create a codec with a custom size limit.
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }

    /// Decode an envelope from text.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, text: &str) -> Result<Envelope, ProtocolError> {
        decode_limited(text, self.max_size)
    }

    /// Decode an envelope from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not UTF-8 or decoding fails.
    pub fn decode_bytes(&self, data: &[u8]) -> Result<Envelope, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
        self.decode(text)
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use serde_json::{json, Value};

    #[test]
    fn test_message_forwarding_shape() {
        let env = decode(r#"{"type":"message","from":"alice","to":"bob","message":"hi","timestamp":1}"#)
            .unwrap();
        let out: Value = serde_json::from_str(&encode(&env).unwrap()).unwrap();
        assert_eq!(
            out,
            json!({"type": "message", "to": "bob", "from": "alice", "message": "hi", "timestamp": 1})
        );
    }

    #[test]
    fn test_error_text_is_exact() {
        let text = encode(&Envelope::error("User \"alice\" is already registered.")).unwrap();
        assert_eq!(
            text,
            r#"{"type":"error","message":"User \"alice\" is already registered."}"#
        );
    }

    #[test]
    fn test_decode_malformed_json() {
        assert!(matches!(decode("{not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(decode("[1,2,3]"), Err(ProtocolError::Json(_))));
        assert!(matches!(decode(r#"{"userId":"x"}"#), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_envelope_too_large() {
        let codec = EnvelopeCodec::with_max_size(16);
        let text = r#"{"type":"register","userId":"someone-long"}"#;
        match codec.decode(text) {
            Err(ProtocolError::EnvelopeTooLarge { size, max }) => {
                assert_eq!(size, text.len());
                assert_eq!(max, 16);
            }
            other => panic!("Expected EnvelopeTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_bytes() {
        let env = decode_bytes(br#"{"type":"register","userId":"carol"}"#).unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Register);

        assert!(matches!(
            decode_bytes(&[0xff, 0xfe, 0x00]),
            Err(ProtocolError::InvalidUtf8)
        ));
    }
}
