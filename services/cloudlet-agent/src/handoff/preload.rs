//! Chunk hash dictionaries built from base hash-index artifacts.
//!
//! A hash index is a flat sequence of 48-byte records:
//! `offset: u64 LE | length: u64 LE | sha256: [u8; 32]`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::HandoffError;

/// Size of one hash-index record.
pub const HASH_RECORD_LEN: usize = 48;

/// Hex sha256 of a chunk to its offset in the base artifact.
pub type ChunkHashDict = BTreeMap<String, u64>;

/// Parse a hash-index file.
///
/// Runs on the blocking pool; base hash indexes can be large.
pub async fn preload_hash_index(path: &Path) -> Result<ChunkHashDict, HandoffError> {
    let path: PathBuf = path.to_path_buf();
    let task_path = path.clone();
    tokio::task::spawn_blocking(move || {
        let bytes = std::fs::read(&task_path).map_err(|e| HandoffError::Preload {
            path: task_path.clone(),
            reason: e.to_string(),
        })?;
        parse_records(&bytes).map_err(|reason| HandoffError::Preload {
            path: task_path,
            reason,
        })
    })
    .await
    .map_err(|e| HandoffError::Preload {
        path,
        reason: e.to_string(),
    })?
}

fn parse_records(bytes: &[u8]) -> Result<ChunkHashDict, String> {
    if bytes.len() % HASH_RECORD_LEN != 0 {
        return Err(format!(
            "length {} is not a multiple of {HASH_RECORD_LEN}",
            bytes.len()
        ));
    }

    let mut dict = ChunkHashDict::new();
    for record in bytes.chunks_exact(HASH_RECORD_LEN) {
        let (offset, rest) = record.split_at(8);
        let (_length, digest) = rest.split_at(8);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(offset);
        // First occurrence wins; later duplicates point at identical content.
        dict.entry(hex::encode(digest))
            .or_insert(u64::from_le_bytes(raw));
    }
    Ok(dict)
}
