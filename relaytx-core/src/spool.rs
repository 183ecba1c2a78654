//! Durable Spool — contract plus an in-memory and an on-disk
//! implementation (§4.6, §9 "spool as contract, not concrete store").
//!
//! The receiver depends only on the six operations below; any ordered,
//! durable key-value store satisfies the contract, including a plain
//! on-disk directory indexed by `(transferId, sequence)` as implemented
//! by [`DiskSpool`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::bitmap::ChunkBitmap;
use crate::error::RelayError;
use crate::manifest::{Manifest, TransferId};

/// One spooled chunk: raw bytes, its declared hash, and when it was
/// stored (milliseconds since the Unix epoch).
#[derive(Debug, Clone)]
pub struct SpooledChunk {
    pub sequence: u32,
    pub bytes: Vec<u8>,
    pub hash: [u8; 32],
    pub stored_at: u64,
}

/// Per-transfer metadata the spool keeps alongside chunk bytes, so a
/// crashed receiver could in principle resume (§3 "Spooled Chunk").
#[derive(Debug, Clone)]
pub struct TransferMeta {
    pub manifest: Manifest,
    pub bitmap_snapshot: Vec<u32>,
}

/// The six operations a durable chunk store must provide (§4.6).
///
/// Uniqueness: `(transferId, sequence)` is a primary key; a second
/// `put` with the same key overwrites. Implementations must serialize
/// concurrent `put`s for distinct sequences of the same transfer, but
/// need not order them across sequences — ordering is enforced by
/// assembly.
#[async_trait]
pub trait DurableSpool: Send + Sync {
    /// Store (or overwrite) one chunk's bytes under `(transfer_id,
    /// sequence)`, stamped with `stored_at` (milliseconds since the
    /// Unix epoch, §3 "Spooled Chunk").
    async fn put(
        &self,
        transfer_id: &TransferId,
        sequence: u32,
        bytes: Vec<u8>,
        hash: [u8; 32],
        stored_at: u64,
    ) -> Result<(), RelayError>;

    /// All chunks spooled for `transfer_id`, ordered by sequence.
    async fn get_all(&self, transfer_id: &TransferId) -> Result<Vec<SpooledChunk>, RelayError>;

    /// Remove every chunk and the metadata record for `transfer_id`.
    async fn delete_all(&self, transfer_id: &TransferId) -> Result<(), RelayError>;

    /// Store the transfer-level metadata record (manifest + bitmap).
    async fn put_meta(
        &self,
        transfer_id: &TransferId,
        manifest: Manifest,
        bitmap: &ChunkBitmap,
    ) -> Result<(), RelayError>;

    /// Update just the bitmap snapshot of an existing metadata record.
    async fn update_meta(
        &self,
        transfer_id: &TransferId,
        bitmap: &ChunkBitmap,
    ) -> Result<(), RelayError>;
}

fn bitmap_snapshot(bitmap: &ChunkBitmap) -> Vec<u32> {
    let mut received: Vec<u32> = (0..bitmap.total_chunks()).filter(|s| bitmap.contains(*s)).collect();
    received.sort_unstable();
    received
}

// ── In-memory implementation ────────────────────────────────────────

/// A non-durable, in-process spool. Used for transfers where
/// `useDurableSpool = false`, or in tests.
#[derive(Default)]
pub struct InMemorySpool {
    chunks: Mutex<BTreeMap<(TransferId, u32), SpooledChunk>>,
    meta: Mutex<BTreeMap<TransferId, TransferMeta>>,
}

impl InMemorySpool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableSpool for InMemorySpool {
    async fn put(
        &self,
        transfer_id: &TransferId,
        sequence: u32,
        bytes: Vec<u8>,
        hash: [u8; 32],
        stored_at: u64,
    ) -> Result<(), RelayError> {
        let mut chunks = self.chunks.lock().unwrap();
        chunks.insert(
            (transfer_id.clone(), sequence),
            SpooledChunk {
                sequence,
                bytes,
                hash,
                stored_at,
            },
        );
        Ok(())
    }

    async fn get_all(&self, transfer_id: &TransferId) -> Result<Vec<SpooledChunk>, RelayError> {
        let chunks = self.chunks.lock().unwrap();
        let mut out: Vec<SpooledChunk> = chunks
            .iter()
            .filter(|((t, _), _)| t == transfer_id)
            .map(|(_, c)| c.clone())
            .collect();
        out.sort_by_key(|c| c.sequence);
        Ok(out)
    }

    async fn delete_all(&self, transfer_id: &TransferId) -> Result<(), RelayError> {
        let mut chunks = self.chunks.lock().unwrap();
        chunks.retain(|(t, _), _| t != transfer_id);
        self.meta.lock().unwrap().remove(transfer_id);
        Ok(())
    }

    async fn put_meta(
        &self,
        transfer_id: &TransferId,
        manifest: Manifest,
        bitmap: &ChunkBitmap,
    ) -> Result<(), RelayError> {
        self.meta.lock().unwrap().insert(
            transfer_id.clone(),
            TransferMeta {
                manifest,
                bitmap_snapshot: bitmap_snapshot(bitmap),
            },
        );
        Ok(())
    }

    async fn update_meta(
        &self,
        transfer_id: &TransferId,
        bitmap: &ChunkBitmap,
    ) -> Result<(), RelayError> {
        let mut meta = self.meta.lock().unwrap();
        if let Some(entry) = meta.get_mut(transfer_id) {
            entry.bitmap_snapshot = bitmap_snapshot(bitmap);
        }
        Ok(())
    }
}

// ── On-disk implementation ──────────────────────────────────────────

/// A plain on-disk directory indexed by `(transferId, sequence)` — one
/// file per chunk under `root/<transferId>/<sequence>.chunk`, plus a
/// `meta.json` per transfer (§9).
pub struct DiskSpool {
    root: PathBuf,
}

impl DiskSpool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn transfer_dir(&self, transfer_id: &TransferId) -> PathBuf {
        self.root.join(transfer_id)
    }

    fn chunk_path(&self, transfer_id: &TransferId, sequence: u32) -> PathBuf {
        self.transfer_dir(transfer_id).join(format!("{sequence}.chunk"))
    }

    fn meta_path(&self, transfer_id: &TransferId) -> PathBuf {
        self.transfer_dir(transfer_id).join("meta.json")
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct DiskMeta {
    manifest: Manifest,
    bitmap_snapshot: Vec<u32>,
}

/// Size of the fixed prefix written before each chunk's payload on
/// disk: a 32-byte hash plus an 8-byte little-endian `stored_at`
/// timestamp (§3 "Spooled Chunk": "raw bytes + hash + stored-at
/// timestamp").
const DISK_CHUNK_PREFIX: usize = 32 + 8;

#[async_trait]
impl DurableSpool for DiskSpool {
    async fn put(
        &self,
        transfer_id: &TransferId,
        sequence: u32,
        bytes: Vec<u8>,
        hash: [u8; 32],
        stored_at: u64,
    ) -> Result<(), RelayError> {
        let dir = self.transfer_dir(transfer_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RelayError::Spool(e.to_string()))?;

        let mut framed = Vec::with_capacity(DISK_CHUNK_PREFIX + bytes.len());
        framed.extend_from_slice(&hash);
        framed.extend_from_slice(&stored_at.to_le_bytes());
        framed.extend_from_slice(&bytes);

        let path = self.chunk_path(transfer_id, sequence);
        let tmp_path = path.with_extension("chunk.tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| RelayError::Spool(e.to_string()))?;
        file.write_all(&framed)
            .await
            .map_err(|e| RelayError::Spool(e.to_string()))?;
        file.flush().await.map_err(|e| RelayError::Spool(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| RelayError::Spool(e.to_string()))?;
        Ok(())
    }

    async fn get_all(&self, transfer_id: &TransferId) -> Result<Vec<SpooledChunk>, RelayError> {
        let dir = self.transfer_dir(transfer_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RelayError::Spool(e.to_string())),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| RelayError::Spool(e.to_string()))? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(seq_str) = name.strip_suffix(".chunk") else {
                continue;
            };
            let Ok(sequence) = seq_str.parse::<u32>() else {
                continue;
            };

            let mut file = tokio::fs::File::open(entry.path())
                .await
                .map_err(|e| RelayError::Spool(e.to_string()))?;
            let mut framed = Vec::new();
            file.read_to_end(&mut framed)
                .await
                .map_err(|e| RelayError::Spool(e.to_string()))?;
            if framed.len() < DISK_CHUNK_PREFIX {
                return Err(RelayError::Spool(format!("truncated spool entry for sequence {sequence}")));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&framed[..32]);
            let stored_at = u64::from_le_bytes(framed[32..DISK_CHUNK_PREFIX].try_into().unwrap());
            let bytes = framed[DISK_CHUNK_PREFIX..].to_vec();

            chunks.push(SpooledChunk {
                sequence,
                bytes,
                hash,
                stored_at,
            });
        }

        chunks.sort_by_key(|c| c.sequence);
        Ok(chunks)
    }

    async fn delete_all(&self, transfer_id: &TransferId) -> Result<(), RelayError> {
        let dir = self.transfer_dir(transfer_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RelayError::Spool(e.to_string())),
        }
    }

    async fn put_meta(
        &self,
        transfer_id: &TransferId,
        manifest: Manifest,
        bitmap: &ChunkBitmap,
    ) -> Result<(), RelayError> {
        let dir = self.transfer_dir(transfer_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RelayError::Spool(e.to_string()))?;
        let meta = DiskMeta {
            manifest,
            bitmap_snapshot: bitmap_snapshot(bitmap),
        };
        let json = serde_json::to_vec(&meta)?;
        tokio::fs::write(self.meta_path(transfer_id), json)
            .await
            .map_err(|e| RelayError::Spool(e.to_string()))
    }

    async fn update_meta(
        &self,
        transfer_id: &TransferId,
        bitmap: &ChunkBitmap,
    ) -> Result<(), RelayError> {
        let path = self.meta_path(transfer_id);
        let existing = tokio::fs::read(&path).await.map_err(|e| RelayError::Spool(e.to_string()))?;
        let mut meta: DiskMeta = serde_json::from_slice(&existing)?;
        meta.bitmap_snapshot = bitmap_snapshot(bitmap);
        let json = serde_json::to_vec(&meta)?;
        tokio::fs::write(&path, json).await.map_err(|e| RelayError::Spool(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::DeviceClass;

    fn sample_manifest() -> Manifest {
        Manifest::new(
            "t1".into(),
            "file.bin".into(),
            1024,
            "application/octet-stream".into(),
            "a".repeat(64),
            DeviceClass::Desktop,
            32 * 1024,
            1,
            0,
        )
    }

    #[tokio::test]
    async fn in_memory_put_and_get_all_orders_by_sequence() {
        let spool = InMemorySpool::new();
        let tid: TransferId = "t1".into();
        spool.put(&tid, 2, vec![2, 2], [2u8; 32], 100).await.unwrap();
        spool.put(&tid, 0, vec![0, 0], [0u8; 32], 101).await.unwrap();
        spool.put(&tid, 1, vec![1, 1], [1u8; 32], 102).await.unwrap();

        let all = spool.get_all(&tid).await.unwrap();
        let sequences: Vec<u32> = all.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn in_memory_put_overwrites_same_key() {
        let spool = InMemorySpool::new();
        let tid: TransferId = "t1".into();
        spool.put(&tid, 0, vec![1], [0u8; 32], 100).await.unwrap();
        spool.put(&tid, 0, vec![2], [0u8; 32], 200).await.unwrap();

        let all = spool.get_all(&tid).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].bytes, vec![2]);
        assert_eq!(all[0].stored_at, 200);
    }

    #[tokio::test]
    async fn in_memory_stored_at_is_recorded() {
        let spool = InMemorySpool::new();
        let tid: TransferId = "t1".into();
        spool.put(&tid, 0, vec![1], [0u8; 32], 1_700_000_000_000).await.unwrap();

        let all = spool.get_all(&tid).await.unwrap();
        assert_eq!(all[0].stored_at, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn in_memory_delete_all_clears_chunks_and_meta() {
        let spool = InMemorySpool::new();
        let tid: TransferId = "t1".into();
        spool.put(&tid, 0, vec![1], [0u8; 32], 100).await.unwrap();
        spool
            .put_meta(&tid, sample_manifest(), &ChunkBitmap::new(1))
            .await
            .unwrap();

        spool.delete_all(&tid).await.unwrap();
        assert!(spool.get_all(&tid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disk_spool_put_and_get_all_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let spool = DiskSpool::new(dir.path());
        let tid: TransferId = "t1".into();

        spool.put(&tid, 0, vec![10, 20, 30], [5u8; 32], 111).await.unwrap();
        spool.put(&tid, 1, vec![40, 50], [6u8; 32], 222).await.unwrap();

        let all = spool.get_all(&tid).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].sequence, 0);
        assert_eq!(all[0].bytes, vec![10, 20, 30]);
        assert_eq!(all[0].hash, [5u8; 32]);
        assert_eq!(all[0].stored_at, 111);
        assert_eq!(all[1].bytes, vec![40, 50]);
        assert_eq!(all[1].stored_at, 222);
    }

    #[tokio::test]
    async fn disk_spool_overwrite_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let spool = DiskSpool::new(dir.path());
        let tid: TransferId = "t1".into();

        spool.put(&tid, 0, vec![1], [0u8; 32], 100).await.unwrap();
        spool.put(&tid, 0, vec![2, 2], [0u8; 32], 200).await.unwrap();

        let all = spool.get_all(&tid).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].bytes, vec![2, 2]);
        assert_eq!(all[0].stored_at, 200);
    }

    #[tokio::test]
    async fn disk_spool_delete_all_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let spool = DiskSpool::new(dir.path());
        let tid: TransferId = "t1".into();

        spool.put(&tid, 0, vec![1], [0u8; 32], 100).await.unwrap();
        spool.delete_all(&tid).await.unwrap();

        assert!(spool.get_all(&tid).await.unwrap().is_empty());
        assert!(!dir.path().join("t1").exists());
    }

    #[tokio::test]
    async fn disk_spool_meta_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let spool = DiskSpool::new(dir.path());
        let tid: TransferId = "t1".into();

        let mut bitmap = ChunkBitmap::new(4);
        bitmap.mark_received(0, 10);
        spool.put_meta(&tid, sample_manifest(), &bitmap).await.unwrap();

        bitmap.mark_received(1, 10);
        spool.update_meta(&tid, &bitmap).await.unwrap();

        let raw = tokio::fs::read(dir.path().join("t1").join("meta.json")).await.unwrap();
        let meta: DiskMeta = serde_json::from_slice(&raw).unwrap();
        assert_eq!(meta.bitmap_snapshot, vec![0, 1]);
    }
}
