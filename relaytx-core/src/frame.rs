//! `ChunkFrame` — a [`ChunkHeader`] plus its payload, assembled and
//! disassembled for the wire (§4.1).
//!
//! The Framer is a leaf component: it does not hash or verify anything,
//! it only knows how to glue a header to its payload and split them back
//! apart. Hash computation and verification live in [`crate::hash`].

use crate::error::RelayError;
use crate::header::{ChunkHeader, HEADER_SIZE};

/// Default maximum payload size accepted by [`ChunkFrame::encode`]: the
/// largest negotiated chunk size (64 KiB, §4.3) plus slack for a frame
/// whose size was negotiated upward mid-session.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 256 * 1024;

/// An assembled chunk frame: header plus its exact payload.
#[derive(Clone)]
pub struct ChunkFrame {
    header: ChunkHeader,
    payload: Vec<u8>,
}

impl ChunkFrame {
    /// Build a frame from a header and payload, without any length or
    /// hash checks. Use [`ChunkFrame::encode`] when the caller wants
    /// the §4.1 size check enforced.
    pub fn new(header: ChunkHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Returns the frame's header.
    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// Returns the frame's payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Build a frame, rejecting a payload larger than `max_payload_size`.
    pub fn encode(
        header: ChunkHeader,
        payload: Vec<u8>,
        max_payload_size: usize,
    ) -> Result<Self, RelayError> {
        if payload.len() > max_payload_size {
            return Err(RelayError::MalformedFrame("payload exceeds configured maximum"));
        }
        if payload.len() != header.size as usize {
            return Err(RelayError::MalformedFrame("header size does not match payload length"));
        }
        Ok(Self { header, payload })
    }

    /// Serialize the full frame (header + payload) to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize a frame from raw bytes.
    ///
    /// Fails with [`RelayError::MalformedFrame`] if `bytes` is shorter
    /// than the header, or if `48 + header.size != bytes.len()`. Does
    /// not verify the payload hash.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        if bytes.len() < HEADER_SIZE {
            return Err(RelayError::MalformedFrame("buffer too short for header"));
        }

        let header = ChunkHeader::from_bytes(&bytes[..HEADER_SIZE])?;

        let expected_total = HEADER_SIZE + header.size as usize;
        if bytes.len() != expected_total {
            return Err(RelayError::MalformedFrame(
                "frame length does not match header size field",
            ));
        }

        let payload = bytes[HEADER_SIZE..].to_vec();
        Ok(Self { header, payload })
    }
}

impl std::fmt::Debug for ChunkFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkFrame")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(sequence: u32, size: u32) -> ChunkHeader {
        ChunkHeader::new(sequence, sequence as i64 * size as i64, size, [0u8; 32])
    }

    #[test]
    fn roundtrip() {
        let payload = b"hello chunk".to_vec();
        let h = header(0, payload.len() as u32);
        let frame = ChunkFrame::encode(h, payload.clone(), DEFAULT_MAX_PAYLOAD_SIZE).unwrap();

        let bytes = frame.to_bytes();
        let decoded = ChunkFrame::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.header(), frame.header());
        assert_eq!(decoded.payload(), payload.as_slice());
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; 10];
        let h = header(0, payload.len() as u32);
        let err = ChunkFrame::encode(h, payload, 4).unwrap_err();
        assert!(matches!(err, RelayError::MalformedFrame(_)));
    }

    #[test]
    fn encode_rejects_size_mismatch() {
        let payload = vec![0u8; 10];
        let h = header(0, 9);
        let err = ChunkFrame::encode(h, payload, DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
        assert!(matches!(err, RelayError::MalformedFrame(_)));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let h = header(0, 10);
        let mut bytes = h.to_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 5]); // declared size 10, only 5 present
        let err = ChunkFrame::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, RelayError::MalformedFrame(_)));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let bytes = [0u8; 10];
        assert!(ChunkFrame::from_bytes(&bytes).is_err());
    }

    #[test]
    fn empty_payload_frame() {
        let h = header(3, 0);
        let frame = ChunkFrame::encode(h, Vec::new(), DEFAULT_MAX_PAYLOAD_SIZE).unwrap();
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let decoded = ChunkFrame::from_bytes(&bytes).unwrap();
        assert!(decoded.payload().is_empty());
    }
}
