//! Chunking Engine — chunk-size selection, durable-spool policy, ACK
//! batch sizing, negotiation, and deterministic chunk generation (§4.3).

use crate::error::RelayError;
use crate::frame::ChunkFrame;
use crate::hash::hash_bytes;
use crate::header::ChunkHeader;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// The sender or receiver's device tier, used to pick sane chunk-size
/// defaults (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

/// Pure function of `(fileSize, deviceClass)` selecting a default chunk
/// size, per the §4.3 table.
pub fn select_chunk_size(file_size: u64, device_class: DeviceClass) -> u32 {
    match device_class {
        DeviceClass::Mobile | DeviceClass::Tablet => {
            if file_size < 50 * MIB {
                8 * KIB as u32
            } else {
                16 * KIB as u32
            }
        }
        DeviceClass::Desktop => {
            if file_size < 100 * MIB {
                32 * KIB as u32
            } else {
                64 * KIB as u32
            }
        }
    }
}

/// `useDurableSpool = true` iff device is mobile/tablet AND fileSize ≥
/// 50 MiB AND a durable store is available (§4.3).
pub fn use_durable_spool(file_size: u64, device_class: DeviceClass, spool_available: bool) -> bool {
    let is_constrained = matches!(device_class, DeviceClass::Mobile | DeviceClass::Tablet);
    spool_available && is_constrained && file_size >= 50 * MIB
}

/// ACK batch size: 5 for fewer than 20 chunks, 50 for more than 1000,
/// otherwise 10 (§4.3).
pub fn ack_batch_size(total_chunks: u32) -> u32 {
    if total_chunks < 20 {
        5
    } else if total_chunks > 1000 {
        50
    } else {
        10
    }
}

/// Total chunk count for a file of `file_size` bytes chunked at
/// `chunk_size` bytes: `ceil(fileSize / chunkSize)`.
pub fn total_chunks(file_size: u64, chunk_size: u32) -> u32 {
    if file_size == 0 {
        return 0;
    }
    let chunk_size = chunk_size as u64;
    (file_size.div_ceil(chunk_size)) as u32
}

/// Result of negotiating a chunk size between sender and receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub agreed_chunk_size: u32,
    pub total_chunks: u32,
}

/// `agreedChunkSize = min(senderProposed, receiverPreferred)`; total
/// chunk count is recomputed against the agreed size (§4.3).
pub fn negotiate_chunk_size(
    sender_proposed: u32,
    receiver_preferred: u32,
    file_size: u64,
) -> Negotiated {
    let agreed_chunk_size = sender_proposed.min(receiver_preferred);
    Negotiated {
        agreed_chunk_size,
        total_chunks: total_chunks(file_size, agreed_chunk_size),
    }
}

/// One numbered chunk's metadata and owned payload, prior to framing.
#[derive(Debug, Clone)]
pub struct ChunkWithData {
    pub sequence: u32,
    pub offset: i64,
    pub payload: Vec<u8>,
    pub hash: [u8; 32],
}

impl ChunkWithData {
    /// Frame this chunk for the wire (§4.1).
    pub fn into_frame(self, max_payload_size: usize) -> Result<ChunkFrame, RelayError> {
        let header = ChunkHeader::new(
            self.sequence,
            self.offset,
            self.payload.len() as u32,
            self.hash,
        );
        ChunkFrame::encode(header, self.payload, max_payload_size)
    }
}

/// Deterministic chunk generation: chunk `k` is the byte range
/// `[k*C, min((k+1)*C, fileSize))`; its hash is the SHA-256 of exactly
/// those bytes (§4.3).
///
/// A streaming variant over an arbitrary byte source; yields chunks
/// lazily in increasing sequence order.
pub struct ChunkIter<'a> {
    data: &'a [u8],
    chunk_size: u32,
    next_sequence: u32,
    total_chunks: u32,
}

impl<'a> ChunkIter<'a> {
    /// Build an iterator over `data`, splitting it into chunks of
    /// `chunk_size` bytes.
    pub fn new(data: &'a [u8], chunk_size: u32) -> Self {
        let total = total_chunks(data.len() as u64, chunk_size);
        Self {
            data,
            chunk_size,
            next_sequence: 0,
            total_chunks: total,
        }
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = ChunkWithData;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_sequence >= self.total_chunks {
            return None;
        }

        let sequence = self.next_sequence;
        let chunk_size = self.chunk_size as usize;
        let start = sequence as usize * chunk_size;
        let end = (start + chunk_size).min(self.data.len());
        let payload = self.data[start..end].to_vec();
        let hash = hash_bytes(&payload);

        self.next_sequence += 1;

        Some(ChunkWithData {
            sequence,
            offset: start as i64,
            payload,
            hash,
        })
    }
}

/// Split `data` into numbered chunks of `chunk_size` bytes, eagerly.
pub fn chunk_data(data: &[u8], chunk_size: u32) -> Vec<ChunkWithData> {
    ChunkIter::new(data, chunk_size).collect()
}

/// Produce a single numbered chunk by random access, for resends.
/// Returns `None` if `sequence` is beyond the file's chunk count.
pub fn chunk_at(data: &[u8], chunk_size: u32, sequence: u32) -> Option<ChunkWithData> {
    let total = total_chunks(data.len() as u64, chunk_size);
    if sequence >= total {
        return None;
    }
    let chunk_size = chunk_size as usize;
    let start = sequence as usize * chunk_size;
    let end = (start + chunk_size).min(data.len());
    let payload = data[start..end].to_vec();
    let hash = hash_bytes(&payload);
    Some(ChunkWithData {
        sequence,
        offset: start as i64,
        payload,
        hash,
    })
}
