//! # Wire Codec
//!
//! Envelopes are serialized with bincode. Stream transports prefix each
//! envelope with its length:
//!
//! ```text
//! [len: u32 big-endian][bincode envelope: len bytes]
//! ```
//!
//! Datagrams carry one bare envelope. Decoding is bounded by
//! `max_frame_bytes`, so a hostile length prefix cannot force a large
//! allocation.

use bincode::Options;

use crate::domain::messages::Envelope;
use crate::domain::ProtocolError;

/// Length prefix size in bytes.
pub const FRAME_HEADER_BYTES: usize = 4;

/// Default upper bound on one encoded envelope.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Envelope encoder/decoder.
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    max_frame_bytes: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl WireCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn options(&self) -> impl Options {
        bincode::options()
            .with_fixint_encoding()
            .with_limit(self.max_frame_bytes as u64)
    }

    /// Encode one envelope without framing.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
        self.options()
            .serialize(envelope)
            .map_err(|e| ProtocolError::Malformed(format!("encode: {e}")))
    }

    /// Decode one unframed envelope, such as a datagram payload.
    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, ProtocolError> {
        if bytes.len() > self.max_frame_bytes {
            return Err(ProtocolError::Malformed(format!(
                "{} bytes exceeds the {} byte limit",
                bytes.len(),
                self.max_frame_bytes
            )));
        }
        self.options()
            .deserialize(bytes)
            .map_err(|e| ProtocolError::Malformed(format!("decode: {e}")))
    }

    /// Encode one envelope with its length prefix.
    pub fn encode_frame(&self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
        let payload = self.encode(envelope)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| ProtocolError::Malformed("frame length overflows u32".to_string()))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode the first frame in `buffer`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete, otherwise the
    /// envelope and the number of bytes consumed.
    pub fn decode_frame(&self, buffer: &[u8]) -> Result<Option<(Envelope, usize)>, ProtocolError> {
        let Some(header) = buffer.get(..FRAME_HEADER_BYTES) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; FRAME_HEADER_BYTES];
        len_bytes.copy_from_slice(header);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.max_frame_bytes {
            return Err(ProtocolError::Malformed(format!(
                "frame of {len} bytes exceeds the {} byte limit",
                self.max_frame_bytes
            )));
        }
        let end = FRAME_HEADER_BYTES + len;
        let Some(payload) = buffer.get(FRAME_HEADER_BYTES..end) else {
            return Ok(None);
        };
        Ok(Some((self.decode(payload)?, end)))
    }
}
