//! The abstract `Channel` contract (§6) plus a concrete TCP
//! implementation with an observable buffered amount and low-watermark
//! notification.
//!
//! Two background tasks (reader, writer) communicate with the transfer
//! domain over bounded mpsc channels, avoiding holding a borrow across an
//! await point.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::{WireCodec, WireMessage};
use crate::control::ControlMessage;
use crate::error::RelayError;
use crate::frame::ChunkFrame;

/// The channel's connection lifecycle (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A message received from the peer: either a chunk frame or a parsed
/// control message.
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    Chunk(ChunkFrame),
    Control(ControlMessage),
}

/// A bidirectional, ordered, message-framed byte channel (§6).
///
/// Implementations must distinguish binary chunk frames from JSON text
/// control frames the way the underlying transport does (WebSocket
/// frame type, WebRTC data-channel message type, or — for the TCP
/// implementation here — an explicit envelope tag, see `codec.rs`).
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a binary chunk frame. Fails with [`RelayError::ChannelClosed`]
    /// if the channel is not open.
    async fn send_chunk(&self, frame: ChunkFrame) -> Result<(), RelayError>;

    /// Send a JSON control message. Fails with
    /// [`RelayError::ChannelClosed`] if the channel is not open.
    async fn send_control(&self, message: ControlMessage) -> Result<(), RelayError>;

    /// The channel's current lifecycle state.
    fn ready_state(&self) -> ReadyState;

    /// Bytes currently queued for send but not yet accepted by the
    /// transport.
    fn buffered_amount(&self) -> u64;

    /// Resolve once `buffered_amount()` drops below `threshold`, using
    /// the transport's low-watermark notification if available rather
    /// than polling (§4.4's "fast path").
    async fn wait_for_buffered_below(&self, threshold: u64);

    /// Receive the next message from the peer, or `None` once the
    /// channel is closed and no further messages will arrive.
    async fn recv(&mut self) -> Option<ChannelMessage>;

    /// Close the channel.
    async fn close(&mut self);
}

/// A concrete [`Channel`] over a `TcpStream`.
pub struct TcpChannel {
    tx: mpsc::Sender<WireMessage>,
    rx: mpsc::Receiver<ChannelMessage>,
    buffered_amount: Arc<AtomicU64>,
    low_watermark: Arc<Notify>,
    state: Arc<std::sync::Mutex<ReadyState>>,
}

impl TcpChannel {
    /// Wrap an already-connected `TcpStream`.
    pub fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);

        let (mut net_writer, mut net_reader) = Framed::new(stream, WireCodec).split();

        let (user_tx, mut network_rx) = mpsc::channel::<WireMessage>(256);
        let (network_tx, user_rx) = mpsc::channel::<ChannelMessage>(256);

        let buffered_amount = Arc::new(AtomicU64::new(0));
        let low_watermark = Arc::new(Notify::new());
        let state = Arc::new(std::sync::Mutex::new(ReadyState::Open));

        // Writer task: drains queued wire messages, tracking the
        // observable buffered amount so the sender can implement
        // backpressure (§4.4).
        {
            let buffered_amount = buffered_amount.clone();
            let low_watermark = low_watermark.clone();
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(message) = network_rx.recv().await {
                    let size = wire_message_size(&message);
                    if let Err(e) = net_writer.send(message).await {
                        warn!(error = %e, "channel write error");
                        break;
                    }
                    let remaining = buffered_amount.fetch_sub(size, Ordering::SeqCst) - size;
                    debug!(remaining, "wire message flushed");
                    low_watermark.notify_waiters();
                }
                *state.lock().unwrap() = ReadyState::Closed;
            });
        }

        // Reader task: decodes wire messages and classifies control
        // text into a `ControlMessage` before handing it to the
        // transfer domain.
        tokio::spawn(async move {
            while let Some(result) = net_reader.next().await {
                match result {
                    Ok(WireMessage::Chunk(frame)) => {
                        if network_tx.send(ChannelMessage::Chunk(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(WireMessage::Control(text)) => match ControlMessage::from_json(&text) {
                        Ok(message) => {
                            if network_tx.send(ChannelMessage::Control(message)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping unparseable control message");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "channel read error");
                        break;
                    }
                }
            }
        });

        Self {
            tx: user_tx,
            rx: user_rx,
            buffered_amount,
            low_watermark,
            state,
        }
    }

    /// Connect to `addr` (`"host:port"`) and wrap the resulting stream.
    pub async fn connect(addr: &str) -> Result<Self, RelayError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

fn wire_message_size(message: &WireMessage) -> u64 {
    match message {
        WireMessage::Chunk(frame) => (48 + frame.payload().len()) as u64,
        WireMessage::Control(text) => text.len() as u64,
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send_chunk(&self, frame: ChunkFrame) -> Result<(), RelayError> {
        if self.ready_state() != ReadyState::Open {
            return Err(RelayError::ChannelClosed);
        }
        let size = (48 + frame.payload().len()) as u64;
        self.buffered_amount.fetch_add(size, Ordering::SeqCst);
        self.tx
            .send(WireMessage::Chunk(frame))
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }

    async fn send_control(&self, message: ControlMessage) -> Result<(), RelayError> {
        if self.ready_state() != ReadyState::Open {
            return Err(RelayError::ChannelClosed);
        }
        let text = message.to_json()?;
        self.buffered_amount.fetch_add(text.len() as u64, Ordering::SeqCst);
        self.tx
            .send(WireMessage::Control(text))
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock().unwrap()
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered_amount.load(Ordering::SeqCst)
    }

    async fn wait_for_buffered_below(&self, threshold: u64) {
        while self.buffered_amount() >= threshold {
            if self.ready_state() != ReadyState::Open {
                return;
            }
            self.low_watermark.notified().await;
        }
    }

    async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        *self.state.lock().unwrap() = ReadyState::Closing;
        self.rx.close();
        *self.state.lock().unwrap() = ReadyState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_state_equality() {
        assert_eq!(ReadyState::Open, ReadyState::Open);
        assert_ne!(ReadyState::Open, ReadyState::Closed);
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        // Port 0 binds are fine, but connecting to an unused high port
        // on loopback with nothing listening should fail fast.
        let result = TcpChannel::connect("127.0.0.1:1").await;
        assert!(result.is_err());
    }
}
