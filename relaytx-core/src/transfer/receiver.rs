//! Transfer Controller — receiver path (§4.5).

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::bitmap::ChunkBitmap;
use crate::channel::{Channel, ChannelMessage};
use crate::chunking::{self, DeviceClass};
use crate::config::RelayConfig;
use crate::control::{
    ChunkAckPayload, ControlMessage, FailureReason, RequestResendPayload, ResendReason,
    TransferCompletePayload, TransferFailedPayload,
};
use crate::error::RelayError;
use crate::hash::{hash_bytes, hex_eq, to_hex, verify_frame};
use crate::manifest::{Manifest, ManifestAck};
use crate::spool::DurableSpool;

/// Whether to spool received chunks durably rather than holding them
/// in memory: `config.spool.force_durable_spool` overrides the §4.3
/// device-class/file-size policy when set; otherwise the policy
/// decides.
fn resolve_use_durable_spool(
    config: &RelayConfig,
    file_size: u64,
    device_class: DeviceClass,
    spool_available: bool,
) -> bool {
    config
        .spool
        .force_durable_spool
        .unwrap_or_else(|| chunking::use_durable_spool(file_size, device_class, spool_available))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Receiver-side lifecycle (§4.5).
///
/// ```text
/// idle --manifest--> negotiating --ack-sent--> transferring
/// transferring --chunk-ok--> transferring  (bitmap updated)
/// transferring --chunk-bad-hash--> transferring (+ immediate resend request)
/// transferring --end + no gaps--> completing
/// transferring --end + gaps--> awaiting-fill  (resend request) --gap-closed--> completing
/// completing --hash-ok--> completed
/// completing --hash-bad | assembly-error--> failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReceiverState {
    #[default]
    Idle,
    Negotiating,
    Transferring,
    AwaitingFill,
    Completing,
    Completed,
    Failed,
}

impl ReceiverState {
    pub fn receive_manifest(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Idle => {
                *self = Self::Negotiating;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot accept manifest: not idle")),
        }
    }

    pub fn ack_sent(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Negotiating => {
                *self = Self::Transferring;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot send ack: not negotiating")),
        }
    }

    pub fn end_no_gaps(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Transferring => {
                *self = Self::Completing;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot complete: not transferring")),
        }
    }

    pub fn end_with_gaps(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Transferring => {
                *self = Self::AwaitingFill;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot await-fill: not transferring")),
        }
    }

    pub fn gap_closed(&mut self) -> Result<(), RelayError> {
        match self {
            Self::AwaitingFill => {
                *self = Self::Completing;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot close gap: not awaiting fill")),
        }
    }

    pub fn hash_ok(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Completing => {
                *self = Self::Completed;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot complete: not completing")),
        }
    }

    pub fn hash_bad_or_assembly_error(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Completing => {
                *self = Self::Failed;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot fail: not completing")),
        }
    }

    pub fn force_fail(&mut self) {
        *self = Self::Failed;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Outcome of a completed receive run.
#[derive(Debug, Clone)]
pub enum ReceiverOutcome {
    Completed { bytes: Vec<u8>, calculated_hash: String },
    Failed { reason: FailureReason },
}

/// Drives one inbound transfer over a [`Channel`], assembling and
/// verifying the file.
pub struct ReceiverController<C: Channel, S: DurableSpool> {
    channel: C,
    spool: S,
    device_class: DeviceClass,
    spool_available: bool,
    preferred_chunk_size: u32,
    config: RelayConfig,
    state: ReceiverState,
    manifest: Option<Manifest>,
    bitmap: Option<ChunkBitmap>,
    use_durable_spool: bool,
    ack_batch_size: u32,
    accepted_since_ack: u32,
    max_sequence_seen: Option<u32>,
    in_memory_chunks: std::collections::HashMap<u32, Vec<u8>>,
    paused: bool,
    started_at: Instant,
}

impl<C: Channel, S: DurableSpool> ReceiverController<C, S> {
    pub fn new(
        channel: C,
        spool: S,
        device_class: DeviceClass,
        preferred_chunk_size: u32,
        spool_available: bool,
        config: RelayConfig,
    ) -> Self {
        Self {
            channel,
            spool,
            device_class,
            spool_available,
            preferred_chunk_size,
            config,
            state: ReceiverState::Idle,
            manifest: None,
            bitmap: None,
            use_durable_spool: false,
            ack_batch_size: 10,
            accepted_since_ack: 0,
            max_sequence_seen: None,
            in_memory_chunks: std::collections::HashMap::new(),
            paused: false,
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> &ReceiverState {
        &self.state
    }

    /// Run the full receiver protocol: accept the manifest, negotiate,
    /// accept chunks until `transfer-end`, close any gaps, assemble and
    /// verify.
    pub async fn run(&mut self, timestamp: u64) -> Result<ReceiverOutcome, RelayError> {
        self.await_manifest(timestamp).await?;

        loop {
            match self.channel.recv().await {
                Some(ChannelMessage::Chunk(frame)) => self.accept_chunk(frame).await?,
                Some(ChannelMessage::Control(ControlMessage::TransferEnd(_))) => {
                    return self.handle_transfer_end().await;
                }
                Some(ChannelMessage::Control(ControlMessage::TransferPause(_))) => {
                    self.paused = true;
                }
                Some(ChannelMessage::Control(ControlMessage::TransferResume(_))) => {
                    self.paused = false;
                }
                Some(_) => continue,
                None => {
                    self.state.force_fail();
                    if self.use_durable_spool {
                        if let Some(manifest) = &self.manifest {
                            let _ = self.spool.delete_all(&manifest.transfer_id).await;
                        }
                    }
                    return Ok(ReceiverOutcome::Failed {
                        reason: FailureReason::ConnectionLost,
                    });
                }
            }
        }
    }

    async fn await_manifest(&mut self, timestamp: u64) -> Result<(), RelayError> {
        loop {
            match self.channel.recv().await {
                Some(ChannelMessage::Control(ControlMessage::TransferManifest(manifest))) => {
                    if !manifest.is_supported_version() {
                        self.channel
                            .send_control(ControlMessage::TransferFailed(TransferFailedPayload {
                                transfer_id: manifest.transfer_id.clone(),
                                reason: FailureReason::Protocol,
                                expected_hash: None,
                                calculated_hash: None,
                            }))
                            .await?;
                        self.state.force_fail();
                        return Err(RelayError::UnsupportedVersion(manifest.protocol_version));
                    }

                    self.state.receive_manifest()?;

                    let negotiated = chunking::negotiate_chunk_size(
                        manifest.proposed_chunk_size,
                        self.preferred_chunk_size,
                        manifest.file_size,
                    );
                    self.use_durable_spool = resolve_use_durable_spool(
                        &self.config,
                        manifest.file_size,
                        self.device_class,
                        self.spool_available,
                    );
                    self.ack_batch_size = self
                        .config
                        .spool
                        .ack_batch_size_override
                        .unwrap_or_else(|| chunking::ack_batch_size(negotiated.total_chunks));

                    let mut manifest = manifest;
                    manifest.apply_negotiation(negotiated.agreed_chunk_size, negotiated.total_chunks);

                    let bitmap = ChunkBitmap::new(manifest.total_chunks);
                    if self.use_durable_spool {
                        self.spool.put_meta(&manifest.transfer_id, manifest.clone(), &bitmap).await?;
                    }

                    self.channel
                        .send_control(ControlMessage::ManifestAck(ManifestAck {
                            transfer_id: manifest.transfer_id.clone(),
                            agreed_chunk_size: negotiated.agreed_chunk_size,
                            receiver_device_class: self.device_class,
                            use_durable_spool: self.use_durable_spool,
                            ack_batch_size: self.ack_batch_size,
                            timestamp,
                        }))
                        .await?;
                    self.state.ack_sent()?;

                    self.manifest = Some(manifest);
                    self.bitmap = Some(bitmap);
                    return Ok(());
                }
                Some(_) => continue,
                None => {
                    self.state.force_fail();
                    return Err(RelayError::ChannelClosed);
                }
            }
        }
    }

    async fn accept_chunk(&mut self, frame: crate::frame::ChunkFrame) -> Result<(), RelayError> {
        let manifest = self.manifest.as_ref().expect("manifest set before transferring");
        let sequence = frame.header().sequence;
        let size = frame.header().size;

        if let Err(RelayError::HashMismatchChunk { sequence }) = verify_frame(&frame) {
            self.channel
                .send_control(ControlMessage::RequestResend(RequestResendPayload {
                    transfer_id: manifest.transfer_id.clone(),
                    sequences: vec![sequence],
                    reason: ResendReason::HashMismatch,
                }))
                .await?;
            return Ok(());
        }

        if self.use_durable_spool {
            self.spool
                .put(
                    &manifest.transfer_id,
                    sequence,
                    frame.payload().to_vec(),
                    frame.header().hash,
                    now_millis(),
                )
                .await?;
        } else {
            self.in_memory_chunks.insert(sequence, frame.payload().to_vec());
        }

        let bitmap = self.bitmap.as_mut().expect("bitmap set before transferring");
        bitmap.mark_received(sequence, size);
        self.max_sequence_seen = Some(self.max_sequence_seen.map_or(sequence, |m| m.max(sequence)));
        self.accepted_since_ack += 1;

        if self.use_durable_spool {
            self.spool.update_meta(&manifest.transfer_id, bitmap).await?;
        }

        if self.accepted_since_ack >= self.ack_batch_size {
            self.emit_ack_and_gap_check(false).await?;
        }

        Ok(())
    }

    async fn emit_ack_and_gap_check(&mut self, at_end: bool) -> Result<(), RelayError> {
        let manifest = self.manifest.as_ref().expect("manifest set");
        let bitmap = self.bitmap.as_ref().expect("bitmap set");

        let upper_bound = if at_end {
            manifest.total_chunks.saturating_sub(1)
        } else {
            self.max_sequence_seen.unwrap_or(0)
        };
        let gaps = if manifest.total_chunks == 0 {
            Vec::new()
        } else {
            bitmap.detect_gaps(upper_bound)
        };

        self.channel
            .send_control(ControlMessage::ChunkAck(ChunkAckPayload {
                transfer_id: manifest.transfer_id.clone(),
                last_contiguous_seq: bitmap.last_contiguous(),
                received_sequences: bitmap.recent_received_window(self.ack_batch_size as usize),
                gaps: gaps.clone(),
                total_received: bitmap.total_received(),
            }))
            .await?;

        if !gaps.is_empty() {
            self.channel
                .send_control(ControlMessage::RequestResend(RequestResendPayload {
                    transfer_id: manifest.transfer_id.clone(),
                    sequences: gaps,
                    reason: ResendReason::Gap,
                }))
                .await?;
        }

        self.accepted_since_ack = 0;
        Ok(())
    }

    async fn handle_transfer_end(&mut self) -> Result<ReceiverOutcome, RelayError> {
        self.emit_ack_and_gap_check(true).await?;

        let bitmap = self.bitmap.as_ref().expect("bitmap set").clone();
        if bitmap.is_complete() {
            self.state.end_no_gaps()?;
            return self.assemble_and_verify().await;
        }

        self.state.end_with_gaps()?;
        loop {
            match self.channel.recv().await {
                Some(ChannelMessage::Chunk(frame)) => {
                    self.accept_chunk(frame).await?;
                    let bitmap = self.bitmap.as_ref().expect("bitmap set");
                    if bitmap.is_complete() {
                        self.state.gap_closed()?;
                        return self.assemble_and_verify().await;
                    }
                }
                Some(_) => continue,
                None => {
                    self.state.force_fail();
                    return Ok(ReceiverOutcome::Failed {
                        reason: FailureReason::ConnectionLost,
                    });
                }
            }
        }
    }

    async fn assemble_and_verify(&mut self) -> Result<ReceiverOutcome, RelayError> {
        let manifest = self.manifest.clone().expect("manifest set");

        let mut ordered: Vec<(u32, Vec<u8>)> = if self.use_durable_spool {
            self.spool
                .get_all(&manifest.transfer_id)
                .await?
                .into_iter()
                .map(|c| (c.sequence, c.bytes))
                .collect()
        } else {
            self.in_memory_chunks.clone().into_iter().collect()
        };
        ordered.sort_by_key(|(seq, _)| *seq);

        let mut assembled = Vec::with_capacity(manifest.file_size as usize);
        for (expected, (sequence, bytes)) in (0..manifest.total_chunks).zip(ordered.iter()) {
            if expected != *sequence {
                self.state.hash_bad_or_assembly_error()?;
                return self.fail_transfer(FailureReason::Protocol, None, None).await;
            }
            assembled.extend_from_slice(bytes);
        }

        if ordered.len() != manifest.total_chunks as usize || assembled.len() as u64 != manifest.file_size {
            self.state.hash_bad_or_assembly_error()?;
            return self.fail_transfer(FailureReason::Protocol, None, None).await;
        }

        let calculated = to_hex(&hash_bytes(&assembled));
        let verified = hex_eq(&calculated, &manifest.file_hash);

        self.channel
            .send_control(ControlMessage::TransferComplete(TransferCompletePayload {
                transfer_id: manifest.transfer_id.clone(),
                verified,
                calculated_hash: calculated.clone(),
                total_chunks_received: manifest.total_chunks,
                duration_ms: self.started_at.elapsed().as_millis() as u64,
            }))
            .await?;

        if verified {
            self.state.hash_ok()?;
            if self.use_durable_spool {
                self.spool.delete_all(&manifest.transfer_id).await?;
            }
            Ok(ReceiverOutcome::Completed {
                bytes: assembled,
                calculated_hash: calculated,
            })
        } else {
            self.state.hash_bad_or_assembly_error()?;
            self.channel
                .send_control(ControlMessage::TransferFailed(TransferFailedPayload {
                    transfer_id: manifest.transfer_id.clone(),
                    reason: FailureReason::HashMismatch,
                    expected_hash: Some(manifest.file_hash.clone()),
                    calculated_hash: Some(calculated),
                }))
                .await?;
            Ok(ReceiverOutcome::Failed {
                reason: FailureReason::HashMismatch,
            })
        }
    }

    async fn fail_transfer(
        &mut self,
        reason: FailureReason,
        expected_hash: Option<String>,
        calculated_hash: Option<String>,
    ) -> Result<ReceiverOutcome, RelayError> {
        if let Some(manifest) = &self.manifest {
            self.channel
                .send_control(ControlMessage::TransferFailed(TransferFailedPayload {
                    transfer_id: manifest.transfer_id.clone(),
                    reason,
                    expected_hash,
                    calculated_hash,
                }))
                .await?;
        }
        Ok(ReceiverOutcome::Failed { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut state = ReceiverState::Idle;
        state.receive_manifest().unwrap();
        assert_eq!(state, ReceiverState::Negotiating);
        state.ack_sent().unwrap();
        assert_eq!(state, ReceiverState::Transferring);
        state.end_no_gaps().unwrap();
        assert_eq!(state, ReceiverState::Completing);
        state.hash_ok().unwrap();
        assert_eq!(state, ReceiverState::Completed);
        assert!(state.is_terminal());
    }

    #[test]
    fn gap_path_transitions() {
        let mut state = ReceiverState::Transferring;
        state.end_with_gaps().unwrap();
        assert_eq!(state, ReceiverState::AwaitingFill);
        state.gap_closed().unwrap();
        assert_eq!(state, ReceiverState::Completing);
    }

    #[test]
    fn hash_bad_fails() {
        let mut state = ReceiverState::Completing;
        state.hash_bad_or_assembly_error().unwrap();
        assert_eq!(state, ReceiverState::Failed);
    }

    #[test]
    fn invalid_transition_rejected() {
        let mut state = ReceiverState::Idle;
        assert!(state.ack_sent().is_err());
    }

    #[test]
    fn durable_spool_follows_policy_by_default() {
        let config = RelayConfig::default();
        assert!(resolve_use_durable_spool(&config, 60 * 1024 * 1024, DeviceClass::Mobile, true));
        assert!(!resolve_use_durable_spool(&config, 1024, DeviceClass::Mobile, true));
    }

    #[test]
    fn force_durable_spool_overrides_policy() {
        let mut config = RelayConfig::default();
        config.spool.force_durable_spool = Some(true);
        assert!(resolve_use_durable_spool(&config, 1024, DeviceClass::Desktop, true));

        config.spool.force_durable_spool = Some(false);
        assert!(!resolve_use_durable_spool(&config, 60 * 1024 * 1024, DeviceClass::Mobile, true));
    }
}
