//! Wire codec — `Decoder`/`Encoder` for [`WireMessage`] over a
//! `tokio_util::codec::Framed` stream.
//!
//! The abstract [`crate::channel::Channel`] contract (§6) treats binary
//! chunk frames and JSON text frames as already distinguished at the
//! transport level (`send(bytes|text)`), the way a WebSocket or WebRTC
//! data channel tags each message. A raw TCP byte stream carries no such
//! tagging, so [`TcpChannel`](crate::channel::TcpChannel) needs an
//! explicit envelope: one tag byte (`0` = control JSON, `1` = binary
//! chunk) followed by a 4-byte little-endian length and that many
//! payload bytes.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RelayError;
use crate::frame::{ChunkFrame, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::header::HEADER_SIZE;

const TAG_CONTROL: u8 = 0;
const TAG_CHUNK: u8 = 1;
const ENVELOPE_PREFIX: usize = 1 + 4;

/// Largest envelope payload this codec accepts, guarding against an
/// unbounded allocation from a corrupt length field.
pub const MAX_ENVELOPE_PAYLOAD: usize = HEADER_SIZE + DEFAULT_MAX_PAYLOAD_SIZE;

/// One message as carried over [`TcpChannel`](crate::channel::TcpChannel):
/// either a binary chunk frame or a JSON control message (still encoded
/// as text at this layer — `control.rs` owns parsing it).
#[derive(Debug, Clone)]
pub enum WireMessage {
    Chunk(ChunkFrame),
    Control(String),
}

/// Stateless codec for [`WireMessage`].
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = WireMessage;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < ENVELOPE_PREFIX {
            return Ok(None);
        }

        let tag = src[0];
        let len = u32::from_le_bytes(src[1..5].try_into().unwrap()) as usize;

        if len > MAX_ENVELOPE_PAYLOAD {
            return Err(RelayError::MalformedFrame("envelope payload exceeds maximum"));
        }

        let total = ENVELOPE_PREFIX + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(ENVELOPE_PREFIX);
        let payload = src.split_to(len);

        match tag {
            TAG_CONTROL => {
                let text = String::from_utf8(payload.to_vec())
                    .map_err(|_| RelayError::MalformedFrame("control payload is not valid utf-8"))?;
                Ok(Some(WireMessage::Control(text)))
            }
            TAG_CHUNK => {
                let frame = ChunkFrame::from_bytes(&payload)?;
                Ok(Some(WireMessage::Chunk(frame)))
            }
            _ => Err(RelayError::MalformedFrame("unknown envelope tag")),
        }
    }
}

impl Encoder<WireMessage> for WireCodec {
    type Error = RelayError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (tag, bytes) = match item {
            WireMessage::Chunk(frame) => (TAG_CHUNK, frame.to_bytes()),
            WireMessage::Control(text) => (TAG_CONTROL, text.into_bytes()),
        };

        dst.reserve(ENVELOPE_PREFIX + bytes.len());
        dst.put_u8(tag);
        dst.put_u32_le(bytes.len() as u32);
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
