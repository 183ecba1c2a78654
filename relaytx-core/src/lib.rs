//! # relaytx-core
//!
//! Core protocol library for RelayTx, a reliable, integrity-verified,
//! resumable file-transfer protocol layered over an ordered,
//! message-oriented channel that may drop or stall delivery.
//!
//! This crate contains:
//! - **Wire format**: `ChunkHeader`/`ChunkFrame` — the 48-byte chunk
//!   header and its payload framing
//! - **Hashing**: SHA-256 over chunks and whole files, with streaming
//!   progress for large files
//! - **Chunking engine**: device-class-aware chunk-size selection,
//!   negotiation, and deterministic chunk generation
//! - **Data model**: `Manifest`/`ManifestAck` and the `ChunkBitmap`
//!   receive-side tracking structure
//! - **Control plane**: the tagged `ControlMessage` JSON union
//! - **Durable spool**: the `DurableSpool` contract plus in-memory and
//!   on-disk implementations
//! - **Channel**: the abstract `Channel` contract plus a concrete TCP
//!   implementation with observable backpressure
//! - **Transfer controller**: `SenderController`/`ReceiverController`,
//!   the state machines that drive one transfer session
//! - **Config**: `RelayConfig`, TOML-backed tunables for backpressure,
//!   retry, and spool policy
//! - **Task**: `TaskPool` for tracking spawned background work
//! - **Error**: `RelayError` — typed, `thiserror`-based error hierarchy

pub mod bitmap;
pub mod channel;
pub mod chunking;
pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod hash;
pub mod header;
pub mod manifest;
pub mod spool;
pub mod task;
pub mod transfer;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bitmap::ChunkBitmap;
pub use channel::{Channel, ChannelMessage, ReadyState, TcpChannel};
pub use chunking::{ChunkWithData, DeviceClass, Negotiated};
pub use codec::{WireCodec, WireMessage};
pub use config::RelayConfig;
pub use control::ControlMessage;
pub use error::{RelayError, TaskError};
pub use frame::ChunkFrame;
pub use hash::{Digest32, HashProgress};
pub use header::{ChunkHeader, HEADER_SIZE};
pub use manifest::{Manifest, ManifestAck, PROTOCOL_VERSION, TransferId};
pub use spool::{DiskSpool, DurableSpool, InMemorySpool, SpooledChunk};
pub use task::{Task, TaskEvent, TaskOptions, TaskPool};
pub use transfer::{ReceiverController, ReceiverState, SenderController, SenderState};
