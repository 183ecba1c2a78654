//! Chunk wire header — 48 bytes, fixed, little-endian (spec §4.1).
//!
//! ```text
//! Offset  Size  Field      Semantics
//! ──────  ────  ─────────  ─────────────────────────────────
//!   0       4   sequence   unsigned 32-bit chunk index
//!   4       8   offset     signed 64-bit byte offset
//!  12       4   size       unsigned 32-bit payload length
//!  16      32   hash       raw SHA-256 of payload
//! ──────  ────  ─────────  ─────────────────────────────────
//! Total:  48 bytes, followed by exactly `size` payload bytes.
//! ```
//!
//! Endianness and field layout are part of the wire contract and must be
//! byte-exact across implementations — decode does not verify the hash,
//! that is [`crate::hash`]'s job.

use crate::error::RelayError;

/// Fixed size of the on-wire chunk header.
pub const HEADER_SIZE: usize = 48;

/// Type alias for the exact byte array that holds one header.
pub type HeaderBytes = [u8; HEADER_SIZE];

/// The 48-byte chunk header, decoded into its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Zero-based chunk index.
    pub sequence: u32,
    /// Byte offset of this chunk within the source file.
    pub offset: i64,
    /// Payload length in bytes.
    pub size: u32,
    /// Raw SHA-256 digest of the payload.
    pub hash: [u8; 32],
}

impl ChunkHeader {
    /// Build a header from its fields.
    pub fn new(sequence: u32, offset: i64, size: u32, hash: [u8; 32]) -> Self {
        Self {
            sequence,
            offset,
            size,
            hash,
        }
    }

    /// Serialize to exactly [`HEADER_SIZE`] bytes (little-endian).
    pub fn to_bytes(&self) -> HeaderBytes {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..48].copy_from_slice(&self.hash);
        buf
    }

    /// Deserialize a header from exactly [`HEADER_SIZE`] bytes.
    ///
    /// Fails with [`RelayError::MalformedFrame`] if `bytes` is shorter
    /// than [`HEADER_SIZE`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        if bytes.len() < HEADER_SIZE {
            return Err(RelayError::MalformedFrame("buffer too short for header"));
        }

        let sequence = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let offset = i64::from_le_bytes(bytes[4..12].try_into().unwrap());
        let size = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let hash: [u8; 32] = bytes[16..48].try_into().unwrap();

        Ok(Self {
            sequence,
            offset,
            size,
            hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_48() {
        assert_eq!(HEADER_SIZE, 48);
    }

    #[test]
    fn roundtrip() {
        let header = ChunkHeader::new(7, 28672, 4096, [0xAB; 32]);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let parsed = ChunkHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn too_short_rejected() {
        let bytes = [0u8; 10];
        assert!(ChunkHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn little_endian_layout() {
        let header = ChunkHeader::new(1, 0, 0, [0u8; 32]);
        let bytes = header.to_bytes();
        // sequence = 1 at offset 0, little-endian
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
    }
}
