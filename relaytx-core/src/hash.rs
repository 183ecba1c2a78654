//! SHA-256 hashing over chunk payloads and whole files (§4.2).
//!
//! Hex encoding is always lowercase, unpadded, 64 characters; comparisons
//! are case-insensitive per §4.2 / §6 "Identifiers".

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

use crate::error::RelayError;
use crate::frame::ChunkFrame;

/// Raw 32-byte SHA-256 digest.
pub type Digest32 = [u8; 32];

/// Progress reported while hashing a whole file: bytes processed so far
/// and the file's total size, from which percentage can be derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashProgress {
    pub bytes_processed: u64,
    pub total_bytes: u64,
}

impl HashProgress {
    /// Percentage complete, `0.0..=100.0`. Returns `100.0` for a
    /// zero-length file (trivially complete).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_processed as f64 / self.total_bytes as f64) * 100.0
    }
}

/// Size of the sub-range read at a time while hashing a whole file.
const HASH_STREAM_WINDOW: usize = 64 * 1024;

/// Hash a single contiguous byte range, returning the raw digest.
pub fn hash_bytes(data: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase, unpadded, 64-character hex encoding of a digest.
pub fn to_hex(digest: &Digest32) -> String {
    hex::encode(digest)
}

/// Case-insensitive comparison of two hex-encoded digests.
pub fn hex_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Hash a whole file as a lazy sequence of sub-ranges, invoking
/// `on_progress` after each window is processed. Returns the final
/// digest over the entire file contents.
pub fn hash_file_with_progress(
    path: &Path,
    mut on_progress: impl FnMut(HashProgress),
) -> Result<Digest32, RelayError> {
    let mut file = std::fs::File::open(path)?;
    let total_bytes = file.metadata()?.len();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_STREAM_WINDOW];
    let mut bytes_processed: u64 = 0;

    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        bytes_processed += read as u64;
        on_progress(HashProgress {
            bytes_processed,
            total_bytes,
        });
    }

    Ok(hasher.finalize().into())
}

/// Verify a frame by recomputing the payload hash and comparing it to
/// the header's declared hash.
///
/// Returns `Ok(())` on a match, or [`RelayError::HashMismatchChunk`]
/// naming the frame's sequence on mismatch.
pub fn verify_frame(frame: &ChunkFrame) -> Result<(), RelayError> {
    let computed = hash_bytes(frame.payload());
    if computed == frame.header().hash {
        Ok(())
    } else {
        Err(RelayError::HashMismatchChunk {
            sequence: frame.header().sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ChunkHeader;
    use std::io::Write;

    #[test]
    fn hex_is_lowercase_and_64_chars() {
        let digest = hash_bytes(b"hello world");
        let hex = to_hex(&digest);
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, hex.to_lowercase());
    }

    #[test]
    fn hex_eq_is_case_insensitive() {
        let digest = hash_bytes(b"abc");
        let hex = to_hex(&digest);
        assert!(hex_eq(&hex, &hex.to_uppercase()));
    }

    #[test]
    fn known_vector() {
        let digest = hash_bytes(b"");
        let hex = to_hex(&digest);
        assert_eq!(
            hex,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn verify_frame_accepts_matching_hash() {
        let payload = b"chunk payload".to_vec();
        let hash = hash_bytes(&payload);
        let header = ChunkHeader::new(0, 0, payload.len() as u32, hash);
        let frame = ChunkFrame::new(header, payload);
        assert!(verify_frame(&frame).is_ok());
    }

    #[test]
    fn verify_frame_rejects_tampered_payload() {
        let payload = b"chunk payload".to_vec();
        let hash = hash_bytes(&payload);
        let header = ChunkHeader::new(2, 0, payload.len() as u32, hash);
        let frame = ChunkFrame::new(header, b"tampered!!!!!".to_vec());
        let err = verify_frame(&frame).unwrap_err();
        match err {
            RelayError::HashMismatchChunk { sequence } => assert_eq!(sequence, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn hash_file_with_progress_matches_hash_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let content = vec![0x42u8; 200_000];
        file.write_all(&content).unwrap();
        file.flush().unwrap();

        let mut last_progress = None;
        let digest = hash_file_with_progress(file.path(), |p| last_progress = Some(p)).unwrap();

        assert_eq!(digest, hash_bytes(&content));
        let progress = last_progress.unwrap();
        assert_eq!(progress.bytes_processed, 200_000);
        assert_eq!(progress.percentage(), 100.0);
    }
}
