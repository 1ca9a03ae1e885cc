//! Binary framing for cached tile payloads.
//!
//! Layout: a big-endian `u32` header length, a `MessagePack` header
//! ([`EnvelopeHeader`]), then the raw payload bytes. Keeping the payload
//! outside the `MessagePack` body avoids encoding every byte as an integer.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::CacheError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EnvelopeHeader {
    version: u64,
    etag: String,
    created_at_ms: i64,
    payload_len: u64,
}

/// A cached payload together with the version it was generated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEnvelope {
    /// Version tag of the data the payload was generated from.
    pub version: u64,
    /// Content hash of `payload`.
    pub etag: String,
    /// Milliseconds since the Unix epoch at generation time.
    pub created_at_ms: i64,
    pub payload: Vec<u8>,
}

impl CacheEnvelope {
    /// Wraps `payload`, stamping it with the current time.
    #[must_use]
    pub fn new(version: u64, etag: String, payload: Vec<u8>) -> Self {
        Self {
            version,
            etag,
            created_at_ms: Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Serializes the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Encode`] if the header cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        let header = EnvelopeHeader {
            version: self.version,
            etag: self.etag.clone(),
            created_at_ms: self.created_at_ms,
            payload_len: self.payload.len() as u64,
        };
        let header_bytes =
            rmp_serde::to_vec_named(&header).map_err(|e| CacheError::Encode(e.to_string()))?;
        let header_len = u32::try_from(header_bytes.len())
            .map_err(|_| CacheError::Encode("envelope header too large".to_string()))?;

        let mut out = Vec::with_capacity(4 + header_bytes.len() + self.payload.len());
        out.extend_from_slice(&header_len.to_be_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parses an envelope produced by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Corrupt`] when the bytes are truncated, the
    /// header does not parse, or the payload length disagrees with the
    /// header.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self, CacheError> {
        let corrupt = |reason: String| CacheError::Corrupt {
            key: key.to_string(),
            reason,
        };

        let (len_bytes, rest) = bytes
            .split_first_chunk::<4>()
            .ok_or_else(|| corrupt("missing header length".to_string()))?;
        let header_len = u32::from_be_bytes(*len_bytes) as usize;
        if rest.len() < header_len {
            return Err(corrupt(format!(
                "header length {header_len} exceeds {} available bytes",
                rest.len()
            )));
        }
        let (header_bytes, payload) = rest.split_at(header_len);
        let header: EnvelopeHeader =
            rmp_serde::from_slice(header_bytes).map_err(|e| corrupt(e.to_string()))?;
        if header.payload_len != payload.len() as u64 {
            return Err(corrupt(format!(
                "payload length {} does not match header {}",
                payload.len(),
                header.payload_len
            )));
        }

        Ok(Self {
            version: header.version,
            etag: header.etag,
            created_at_ms: header.created_at_ms,
            payload: payload.to_vec(),
        })
    }
}
