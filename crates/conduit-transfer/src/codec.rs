/// Chunk codec: binary chunks travel as standard base64 text so they survive
/// the channel's structured serialization.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use tracing::warn;

use crate::error::DecodeError;

/// Encode a chunk into its channel-safe form.
pub fn encode(chunk: &[u8]) -> String {
    STANDARD.encode(chunk)
}

/// Decode a channel payload back into the original bytes.
pub fn decode(payload: &str) -> Result<Bytes, DecodeError> {
    STANDARD
        .decode(payload)
        .map(Bytes::from)
        .map_err(|source| DecodeError {
            payload_len: payload.len(),
            source,
        })
}

/// Decode, substituting an empty chunk for a malformed payload.
///
/// A single corrupt payload must not halt the transfer; the failure is only
/// reported through logging.
pub fn decode_or_empty(payload: &str) -> Bytes {
    match decode(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(error = %e, "malformed chunk payload, substituting empty chunk");
            Bytes::new()
        }
    }
}
