//! Transfer Controller — sender path (§4.4).
//!
//! `SenderState` uses validated transitions returning `Result` instead of
//! panicking on an illegal state change.
//! `SenderController` owns the send loop, `sentChunks`/`pendingResends`
//! bookkeeping, retry policy, and backpressure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::{Channel, ChannelMessage};
use crate::chunking::{self, DeviceClass};
use crate::config::RelayConfig;
use crate::control::{
    ChunkAckPayload, ControlMessage, FailureReason, RequestResendPayload, TransferEndPayload,
};
use crate::error::RelayError;
use crate::hash::to_hex;
use crate::manifest::{Manifest, TransferId};

/// Sender-side lifecycle (§4.4).
///
/// ```text
/// idle --initiate--> awaiting-ack --manifest-ack--> transferring
/// transferring --buffer-high--> throttled --buffer-low--> transferring
/// transferring --all-acked & end-sent--> awaiting-complete
/// awaiting-complete --transfer-complete(verified)--> completed
/// awaiting-complete --transfer-complete(!verified) | transfer-failed--> failed
/// any --channel-close | unrecoverable-error--> failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SenderState {
    #[default]
    Idle,
    AwaitingAck,
    Transferring,
    Throttled,
    AwaitingComplete,
    Completed,
    Failed,
}

impl SenderState {
    pub fn begin_initiate(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Idle => {
                *self = Self::AwaitingAck;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot initiate: not idle")),
        }
    }

    pub fn receive_manifest_ack(&mut self) -> Result<(), RelayError> {
        match self {
            Self::AwaitingAck => {
                *self = Self::Transferring;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot accept manifest-ack: not awaiting it")),
        }
    }

    pub fn enter_throttled(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Transferring => {
                *self = Self::Throttled;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot throttle: not transferring")),
        }
    }

    pub fn resume_from_throttle(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Throttled => {
                *self = Self::Transferring;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot resume: not throttled")),
        }
    }

    pub fn complete_send(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Transferring => {
                *self = Self::AwaitingComplete;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot end transfer: not transferring")),
        }
    }

    /// A `request-resend` arrived after `transfer-end` was already sent
    /// (a late-detected gap or hash mismatch). Drop back into
    /// `transferring` to fill it; `complete_send` moves back to
    /// `awaiting-complete` once the queue drains again.
    pub fn reopen_for_resend(&mut self) -> Result<(), RelayError> {
        match self {
            Self::AwaitingComplete => {
                *self = Self::Transferring;
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot reopen for resend: not awaiting completion")),
        }
    }

    pub fn receive_complete(&mut self, verified: bool) -> Result<(), RelayError> {
        match self {
            Self::AwaitingComplete => {
                *self = if verified { Self::Completed } else { Self::Failed };
                Ok(())
            }
            _ => Err(RelayError::Protocol("cannot accept transfer-complete: not awaiting it")),
        }
    }

    /// Force-transition to `Failed` regardless of current state
    /// (channel close, unrecoverable error, cancellation).
    pub fn force_fail(&mut self) {
        *self = Self::Failed;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Outcome of a completed sender run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderOutcome {
    Completed,
    Failed { reason: FailureReason },
}

/// Drives one outbound transfer over a [`Channel`].
pub struct SenderController<C: Channel> {
    channel: C,
    manifest: Manifest,
    config: RelayConfig,
    state: SenderState,
    file_data: Arc<Vec<u8>>,
    sent_chunks: HashSet<u32>,
    pending_resends: VecDeque<u32>,
    retry_counts: HashMap<u32, u32>,
    consecutive_errors: u32,
    next_candidate: u32,
    paused: bool,
    started_at: Instant,
}

impl<C: Channel> SenderController<C> {
    /// Build a sender for `file_data`, proposing a chunk size per
    /// `device_class` (§4.3), and compute the whole-file manifest hash.
    pub fn new(
        channel: C,
        transfer_id: TransferId,
        file_name: String,
        file_type: String,
        file_data: Vec<u8>,
        device_class: DeviceClass,
        config: RelayConfig,
        timestamp: u64,
    ) -> Self {
        let file_size = file_data.len() as u64;
        let proposed_chunk_size = chunking::select_chunk_size(file_size, device_class);
        let total_chunks = chunking::total_chunks(file_size, proposed_chunk_size);

        let hash = crate::hash::hash_bytes(&file_data);

        let manifest = Manifest::new(
            transfer_id,
            file_name,
            file_size,
            file_type,
            to_hex(&hash),
            device_class,
            proposed_chunk_size,
            total_chunks,
            timestamp,
        );

        Self {
            channel,
            manifest,
            config,
            state: SenderState::Idle,
            file_data: Arc::new(file_data),
            sent_chunks: HashSet::new(),
            pending_resends: VecDeque::new(),
            retry_counts: HashMap::new(),
            consecutive_errors: 0,
            next_candidate: 0,
            paused: false,
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> &SenderState {
        &self.state
    }

    /// The manifest this sender negotiated (or will negotiate) with its peer.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Mutable access to the manifest, for callers that need to adjust
    /// it before `run` (e.g. exercising the §8 file-hash-mismatch
    /// scenario, where the manifest's declared hash deliberately
    /// disagrees with the file's actual contents).
    pub fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.manifest
    }

    /// Run the full sender protocol: manifest, negotiated send loop
    /// with backpressure and resends, `transfer-end`, and the wait for
    /// `transfer-complete`/`transfer-failed`.
    pub async fn run(&mut self) -> Result<SenderOutcome, RelayError> {
        self.send_manifest().await?;
        self.await_manifest_ack().await?;
        self.send_loop().await?;
        self.await_completion().await
    }

    async fn send_manifest(&mut self) -> Result<(), RelayError> {
        self.state.begin_initiate()?;
        self.channel
            .send_control(ControlMessage::TransferManifest(self.manifest.clone()))
            .await?;
        Ok(())
    }

    async fn await_manifest_ack(&mut self) -> Result<(), RelayError> {
        loop {
            match self.channel.recv().await {
                Some(ChannelMessage::Control(ControlMessage::ManifestAck(ack))) => {
                    if ack.transfer_id != self.manifest.transfer_id {
                        continue;
                    }
                    let negotiated = chunking::negotiate_chunk_size(
                        self.manifest.proposed_chunk_size,
                        ack.agreed_chunk_size,
                        self.manifest.file_size,
                    );
                    self.manifest
                        .apply_negotiation(negotiated.agreed_chunk_size, negotiated.total_chunks);
                    self.state.receive_manifest_ack()?;
                    tracing::debug!(
                        transfer_id = %self.manifest.transfer_id,
                        chunk_size = negotiated.agreed_chunk_size,
                        total_chunks = negotiated.total_chunks,
                        "manifest acknowledged"
                    );
                    return Ok(());
                }
                Some(ChannelMessage::Control(ControlMessage::TransferFailed(failed)))
                    if failed.transfer_id == self.manifest.transfer_id =>
                {
                    self.state.force_fail();
                    return Err(RelayError::Protocol("receiver rejected manifest"));
                }
                Some(_) => continue,
                None => {
                    self.state.force_fail();
                    return Err(RelayError::ChannelClosed);
                }
            }
        }
    }

    async fn send_loop(&mut self) -> Result<(), RelayError> {
        self.fill_pending_chunks().await?;

        self.channel
            .send_control(ControlMessage::TransferEnd(TransferEndPayload {
                transfer_id: self.manifest.transfer_id.clone(),
                file_hash: self.manifest.file_hash.clone(),
                total_chunks_sent: self.sent_chunks.len() as u32,
                total_bytes_sent: self.file_data.len() as u64,
                duration_ms: self.started_at.elapsed().as_millis() as u64,
            }))
            .await?;
        self.state.complete_send()?;
        Ok(())
    }

    /// Send every chunk not yet in `sentChunks`, plus anything queued
    /// in `pendingResends`, until both are exhausted. Used both for the
    /// initial pass (before `transfer-end`) and to fill resends the
    /// receiver reports after `transfer-end` has already gone out
    /// (§4.4: the sender does not clean up until `transfer-complete` or
    /// `transfer-failed` arrives, which means it must keep servicing
    /// `request-resend` while `awaiting-complete`).
    async fn fill_pending_chunks(&mut self) -> Result<(), RelayError> {
        let total_chunks = self.manifest.total_chunks;
        let chunk_size = self.manifest.proposed_chunk_size;

        while self.sent_chunks.len() < total_chunks as usize || !self.pending_resends.is_empty() {
            self.drain_inbound().await?;

            if self.paused {
                tokio::time::sleep(Duration::from_millis(self.config.backpressure.poll_interval_ms)).await;
                continue;
            }

            let Some(sequence) = self.next_to_send(total_chunks) else {
                // Nothing left to send but the loop condition above
                // disagreed — only happens if pending_resends named a
                // sequence already exhausted; drop and recheck.
                break;
            };

            let Some(chunk) = chunking::chunk_at(&self.file_data, chunk_size, sequence) else {
                self.sent_chunks.insert(sequence);
                continue;
            };

            let max_payload = crate::frame::DEFAULT_MAX_PAYLOAD_SIZE;
            let frame = chunk.into_frame(max_payload)?;

            match self.send_chunk_with_retry(sequence, frame).await {
                Ok(()) => {
                    self.sent_chunks.insert(sequence);
                    self.consecutive_errors = 0;
                    self.apply_backpressure().await?;
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    if self.consecutive_errors >= self.config.retry.max_consecutive_errors {
                        self.state.force_fail();
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }

    fn next_to_send(&mut self, total_chunks: u32) -> Option<u32> {
        if let Some(seq) = self.pending_resends.pop_front() {
            return Some(seq);
        }
        while self.next_candidate < total_chunks {
            let candidate = self.next_candidate;
            if !self.sent_chunks.contains(&candidate) {
                return Some(candidate);
            }
            self.next_candidate += 1;
        }
        None
    }

    async fn send_chunk_with_retry(
        &mut self,
        sequence: u32,
        frame: crate::frame::ChunkFrame,
    ) -> Result<(), RelayError> {
        let max_attempts = self.config.retry.max_attempts_per_chunk;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.channel.send_chunk(frame.clone()).await {
                Ok(()) => {
                    self.retry_counts.remove(&sequence);
                    return Ok(());
                }
                Err(RelayError::ChannelClosed) => {
                    self.state.force_fail();
                    return Err(RelayError::ChannelClosed);
                }
                Err(e) => {
                    *self.retry_counts.entry(sequence).or_insert(0) += 1;
                    if attempt >= max_attempts {
                        return Err(e);
                    }
                    let backoff = self.config.retry.backoff_unit_ms * attempt as u64;
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    async fn apply_backpressure(&mut self) -> Result<(), RelayError> {
        let high = self.config.high_watermark_for(self.manifest.sender_device_class);
        let low = self.config.backpressure.low_watermark_bytes;
        let buffered = self.channel.buffered_amount();

        if buffered >= high {
            self.state.enter_throttled()?;
            self.channel.wait_for_buffered_below(low).await;
            self.state.resume_from_throttle()?;
        } else {
            let steps = &self.config.backpressure.pre_delay_steps_ms;
            if !steps.is_empty() {
                let level = ((buffered as f64 / high as f64) * (steps.len() - 1) as f64) as usize;
                let delay = steps[level.min(steps.len() - 1)];
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
        Ok(())
    }

    /// Drain any inbound control messages without blocking the send
    /// loop: resend requests, pause/resume.
    async fn drain_inbound(&mut self) -> Result<(), RelayError> {
        while let Some(message) = self.try_recv_inbound().await {
            match message {
                ControlMessage::RequestResend(RequestResendPayload { sequences, .. }) => {
                    for seq in sequences {
                        self.sent_chunks.remove(&seq);
                        if !self.pending_resends.contains(&seq) {
                            self.pending_resends.push_back(seq);
                        }
                    }
                    self.paused = false;
                }
                ControlMessage::TransferPause(_) => self.paused = true,
                ControlMessage::TransferResume(_) => self.paused = false,
                ControlMessage::ChunkAck(ChunkAckPayload { .. }) => {}
                _ => {}
            }
        }
        Ok(())
    }

    async fn try_recv_inbound(&mut self) -> Option<ControlMessage> {
        match tokio::time::timeout(Duration::from_millis(0), self.channel.recv()).await {
            Ok(Some(ChannelMessage::Control(message))) => Some(message),
            _ => None,
        }
    }

    async fn await_completion(&mut self) -> Result<SenderOutcome, RelayError> {
        loop {
            match self.channel.recv().await {
                Some(ChannelMessage::Control(ControlMessage::TransferComplete(complete)))
                    if complete.transfer_id == self.manifest.transfer_id =>
                {
                    self.state.receive_complete(complete.verified)?;
                    return Ok(if complete.verified {
                        SenderOutcome::Completed
                    } else {
                        SenderOutcome::Failed {
                            reason: FailureReason::HashMismatch,
                        }
                    });
                }
                Some(ChannelMessage::Control(ControlMessage::TransferFailed(failed)))
                    if failed.transfer_id == self.manifest.transfer_id =>
                {
                    self.state.force_fail();
                    return Ok(SenderOutcome::Failed { reason: failed.reason });
                }
                Some(ChannelMessage::Control(ControlMessage::RequestResend(RequestResendPayload {
                    sequences,
                    ..
                }))) => {
                    // The receiver found a gap or a bad hash only at
                    // end-of-transfer detection, after transfer-end
                    // already went out. Re-enter the send loop to fill
                    // it rather than dropping the request.
                    for seq in sequences {
                        self.sent_chunks.remove(&seq);
                        if !self.pending_resends.contains(&seq) {
                            self.pending_resends.push_back(seq);
                        }
                    }
                    self.state.reopen_for_resend()?;
                    self.fill_pending_chunks().await?;
                    self.state.complete_send()?;
                }
                Some(_) => continue,
                None => {
                    self.state.force_fail();
                    return Ok(SenderOutcome::Failed {
                        reason: FailureReason::ConnectionLost,
                    });
                }
            }
        }
    }

    /// Cancel the transfer: pauses the send loop and emits
    /// `transfer-failed{cancelled}` (§5 "Cancellation").
    pub async fn cancel(&mut self) -> Result<(), RelayError> {
        self.paused = true;
        self.channel
            .send_control(ControlMessage::TransferFailed(
                crate::control::TransferFailedPayload {
                    transfer_id: self.manifest.transfer_id.clone(),
                    reason: FailureReason::Cancelled,
                    expected_hash: None,
                    calculated_hash: None,
                },
            ))
            .await?;
        self.state.force_fail();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut state = SenderState::Idle;
        state.begin_initiate().unwrap();
        assert_eq!(state, SenderState::AwaitingAck);
        state.receive_manifest_ack().unwrap();
        assert_eq!(state, SenderState::Transferring);
        state.enter_throttled().unwrap();
        assert_eq!(state, SenderState::Throttled);
        state.resume_from_throttle().unwrap();
        assert_eq!(state, SenderState::Transferring);
        state.complete_send().unwrap();
        assert_eq!(state, SenderState::AwaitingComplete);
        state.receive_complete(true).unwrap();
        assert_eq!(state, SenderState::Completed);
        assert!(state.is_terminal());
    }

    #[test]
    fn unverified_complete_fails() {
        let mut state = SenderState::AwaitingComplete;
        state.receive_complete(false).unwrap();
        assert_eq!(state, SenderState::Failed);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut state = SenderState::Idle;
        assert!(state.receive_manifest_ack().is_err());
    }

    #[test]
    fn force_fail_from_any_state() {
        let mut state = SenderState::Transferring;
        state.force_fail();
        assert_eq!(state, SenderState::Failed);
    }

    #[test]
    fn late_resend_reopens_and_recloses() {
        let mut state = SenderState::AwaitingComplete;
        state.reopen_for_resend().unwrap();
        assert_eq!(state, SenderState::Transferring);
        state.complete_send().unwrap();
        assert_eq!(state, SenderState::AwaitingComplete);
    }

    #[test]
    fn reopen_for_resend_rejected_outside_awaiting_complete() {
        let mut state = SenderState::Transferring;
        assert!(state.reopen_for_resend().is_err());
    }
}
