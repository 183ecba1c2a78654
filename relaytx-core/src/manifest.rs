//! The transfer manifest and its acknowledgement (§3).

use serde::{Deserialize, Serialize};

use crate::chunking::DeviceClass;

/// The protocol version this implementation speaks. Receivers MUST
/// reject a manifest declaring a different major version (§6).
pub const PROTOCOL_VERSION: u32 = 1;

/// Opaque, sender-chosen unique identifier for one transfer session.
/// Receivers treat it as opaque and echo it on every control message.
pub type TransferId = String;

/// Created by the Sender at session start; immutable after creation
/// except that `chunk_size` and `total_chunks` are rewritten once on
/// `manifest-ack` if the Receiver proposes a smaller size (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    /// Lowercase hex SHA-256 over the whole file.
    pub file_hash: String,
    pub proposed_chunk_size: u32,
    pub total_chunks: u32,
    pub sender_device_class: DeviceClass,
    pub protocol_version: u32,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Manifest {
    /// Build a manifest for a file of the given size and hash, using
    /// the chunk size selected for `sender_device_class` (§4.3).
    pub fn new(
        transfer_id: TransferId,
        file_name: String,
        file_size: u64,
        file_type: String,
        file_hash: String,
        sender_device_class: DeviceClass,
        proposed_chunk_size: u32,
        total_chunks: u32,
        timestamp: u64,
    ) -> Self {
        Self {
            transfer_id,
            file_name,
            file_size,
            file_type,
            file_hash,
            proposed_chunk_size,
            total_chunks,
            sender_device_class,
            protocol_version: PROTOCOL_VERSION,
            timestamp,
        }
    }

    /// True iff this manifest's major protocol version matches ours.
    pub fn is_supported_version(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }

    /// Apply a negotiated-down chunk size and recomputed chunk count,
    /// mutating this manifest in place (§3, §4.3).
    pub fn apply_negotiation(&mut self, agreed_chunk_size: u32, total_chunks: u32) {
        self.proposed_chunk_size = agreed_chunk_size;
        self.total_chunks = total_chunks;
    }
}

/// The Receiver's response to a [`Manifest`] (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAck {
    pub transfer_id: TransferId,
    pub agreed_chunk_size: u32,
    pub receiver_device_class: DeviceClass,
    pub use_durable_spool: bool,
    pub ack_batch_size: u32,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_protocol_version_is_supported() {
        let m = Manifest::new(
            "t1".into(),
            "file.bin".into(),
            1024,
            "application/octet-stream".into(),
            "a".repeat(64),
            DeviceClass::Desktop,
            32 * 1024,
            1,
            0,
        );
        assert!(m.is_supported_version());
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut m = Manifest::new(
            "t1".into(),
            "file.bin".into(),
            1024,
            "application/octet-stream".into(),
            "a".repeat(64),
            DeviceClass::Desktop,
            32 * 1024,
            1,
            0,
        );
        m.protocol_version = 2;
        assert!(!m.is_supported_version());
    }

    #[test]
    fn negotiation_rewrites_chunk_size_and_total() {
        let mut m = Manifest::new(
            "t1".into(),
            "file.bin".into(),
            60 * 1024 * 1024,
            "application/octet-stream".into(),
            "a".repeat(64),
            DeviceClass::Mobile,
            64 * 1024,
            915,
            0,
        );
        m.apply_negotiation(16 * 1024, 3840);
        assert_eq!(m.proposed_chunk_size, 16 * 1024);
        assert_eq!(m.total_chunks, 3840);
    }

    #[test]
    fn manifest_json_roundtrip() {
        let m = Manifest::new(
            "t1".into(),
            "file.bin".into(),
            1024,
            "application/octet-stream".into(),
            "a".repeat(64),
            DeviceClass::Desktop,
            32 * 1024,
            1,
            0,
        );
        let json = serde_json::to_string(&m).unwrap();
        let parsed: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, m);
    }
}
