//! Payload encoding shared by control messages and interface code.
//!
//! Payloads use bincode with fixed-width integers. Decoding is bounded by the payload length so
//! a forged length prefix fails instead of allocating, and trailing bytes are rejected so a
//! payload has exactly one valid encoding length.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::validation::ValidationError;
use crate::MAX_MESSAGE_BYTES;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode payload: {message}")]
    Encode { message: String },
    #[error("failed to decode payload: {message}")]
    Decode { message: String },
}

impl From<CodecError> for ValidationError {
    fn from(err: CodecError) -> Self {
        ValidationError::MalformedPayload {
            message: err.to_string(),
        }
    }
}

fn options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
        .with_limit(limit as u64)
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    options(MAX_MESSAGE_BYTES)
        .serialize(value)
        .map_err(|err| CodecError::Encode {
            message: err.to_string(),
        })
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    options(bytes.len())
        .deserialize(bytes)
        .map_err(|err| CodecError::Decode {
            message: err.to_string(),
        })
}
