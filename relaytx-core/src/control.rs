//! The tagged `ControlMessage` union carried as JSON text frames
//! alongside binary chunk frames on the same channel (§6).
//!
//! Modeled as a closed discriminated union per §9's "implicit typing of
//! control messages → tagged variant" design note: unknown tags are
//! rejected with [`RelayError::Protocol`] rather than silently ignored.

use serde::{Deserialize, Serialize};

use crate::chunking::DeviceClass;
use crate::error::RelayError;
use crate::manifest::{Manifest, ManifestAck, TransferId};

/// Why a resend was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResendReason {
    HashMismatch,
    Gap,
}

/// Why a transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    HashMismatch,
    Protocol,
    StorageError,
    Cancelled,
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAckPayload {
    pub transfer_id: TransferId,
    pub last_contiguous_seq: i64,
    pub received_sequences: Vec<u32>,
    pub gaps: Vec<u32>,
    pub total_received: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResendPayload {
    pub transfer_id: TransferId,
    pub sequences: Vec<u32>,
    pub reason: ResendReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEndPayload {
    pub transfer_id: TransferId,
    pub file_hash: String,
    pub total_chunks_sent: u32,
    pub total_bytes_sent: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCompletePayload {
    pub transfer_id: TransferId,
    pub verified: bool,
    pub calculated_hash: String,
    pub total_chunks_received: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFailedPayload {
    pub transfer_id: TransferId,
    pub reason: FailureReason,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expected_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub calculated_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPausePayload {
    pub transfer_id: TransferId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResumePayload {
    pub transfer_id: TransferId,
}

/// `{ "type": <tag>, "payload": <body> }`, one of the nine shapes the
/// control plane exchanges (§6). `device_class` fields inside payloads
/// reuse [`DeviceClass`] from the chunking engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlMessage {
    #[serde(rename = "transfer-manifest")]
    TransferManifest(Manifest),
    #[serde(rename = "manifest-ack")]
    ManifestAck(ManifestAck),
    #[serde(rename = "chunk-ack")]
    ChunkAck(ChunkAckPayload),
    #[serde(rename = "request-resend")]
    RequestResend(RequestResendPayload),
    #[serde(rename = "transfer-end")]
    TransferEnd(TransferEndPayload),
    #[serde(rename = "transfer-complete")]
    TransferComplete(TransferCompletePayload),
    #[serde(rename = "transfer-failed")]
    TransferFailed(TransferFailedPayload),
    #[serde(rename = "transfer-pause")]
    TransferPause(TransferPausePayload),
    #[serde(rename = "transfer-resume")]
    TransferResume(TransferResumePayload),
}

impl ControlMessage {
    /// Serialize to the wire JSON text frame.
    pub fn to_json(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a wire JSON text frame.
    ///
    /// `serde`'s internally-tagged enum already rejects an unrecognized
    /// `type` value with a deserialization error; we map that to
    /// [`RelayError::Protocol`] rather than a raw encoding error, since
    /// an unknown tag is a protocol violation, not a malformed payload.
    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|_| RelayError::Protocol("unknown control message type"))
    }

    /// The `transferId` this message pertains to.
    pub fn transfer_id(&self) -> &str {
        match self {
            ControlMessage::TransferManifest(m) => &m.transfer_id,
            ControlMessage::ManifestAck(m) => &m.transfer_id,
            ControlMessage::ChunkAck(m) => &m.transfer_id,
            ControlMessage::RequestResend(m) => &m.transfer_id,
            ControlMessage::TransferEnd(m) => &m.transfer_id,
            ControlMessage::TransferComplete(m) => &m.transfer_id,
            ControlMessage::TransferFailed(m) => &m.transfer_id,
            ControlMessage::TransferPause(m) => &m.transfer_id,
            ControlMessage::TransferResume(m) => &m.transfer_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PROTOCOL_VERSION;

    #[test]
    fn chunk_ack_roundtrip() {
        let msg = ControlMessage::ChunkAck(ChunkAckPayload {
            transfer_id: "t1".into(),
            last_contiguous_seq: 9,
            received_sequences: vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
            gaps: vec![],
            total_received: 10,
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"chunk-ack\""));
        let parsed = ControlMessage::from_json(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn request_resend_roundtrip() {
        let msg = ControlMessage::RequestResend(RequestResendPayload {
            transfer_id: "t1".into(),
            sequences: vec![5, 7],
            reason: ResendReason::Gap,
        });
        let json = msg.to_json().unwrap();
        let parsed = ControlMessage::from_json(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let json = r#"{"type":"transfer-teleport","payload":{}}"#;
        let err = ControlMessage::from_json(json).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[test]
    fn manifest_roundtrip_with_device_class() {
        let manifest = Manifest::new(
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
        let msg = ControlMessage::TransferManifest(manifest);
        let json = msg.to_json().unwrap();
        let parsed = ControlMessage::from_json(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn transfer_failed_omits_absent_hashes() {
        let msg = ControlMessage::TransferFailed(TransferFailedPayload {
            transfer_id: "t1".into(),
            reason: FailureReason::ConnectionLost,
            expected_hash: None,
            calculated_hash: None,
        });
        let json = msg.to_json().unwrap();
        assert!(!json.contains("expectedHash"));
    }

    #[test]
    fn protocol_version_constant_is_one() {
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
