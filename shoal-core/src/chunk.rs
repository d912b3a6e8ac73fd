//! Chunking: split a file into fixed-size chunks, reassemble restored chunks.

use std::collections::{BTreeMap, BTreeSet};

use crate::identity::FileId;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 64_000;

/// Byte range of one chunk within its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub chunk_no: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkSpan {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Number of chunks a file of `total_len` bytes is sent as.
/// Always one more than the number of full chunks: the last chunk is short, or empty
/// when the size is an exact multiple, so the receiver can tell where the file ends.
pub fn chunk_count(total_len: u64, chunk_size: u64) -> u32 {
    let size = effective_size(chunk_size);
    (total_len / size + 1) as u32
}

/// Split a file into chunk spans, including the zero-length terminator when
/// `total_len` is a multiple of the chunk size.
pub fn split_into_chunks(total_len: u64, chunk_size: u64) -> Vec<ChunkSpan> {
    let size = effective_size(chunk_size);
    (0..chunk_count(total_len, size))
        .map(|no| {
            let start = no as u64 * size;
            ChunkSpan {
                chunk_no: no,
                start,
                end: (start + size).min(total_len),
            }
        })
        .collect()
}

fn effective_size(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// In-progress restore: chunk payloads keyed by chunk number, in any arrival order.
#[derive(Debug)]
pub struct RestoreBuffer {
    pub file_id: FileId,
    pub name: String,
    expected: BTreeSet<u32>,
    received: BTreeMap<u32, Vec<u8>>,
}

impl RestoreBuffer {
    pub fn new(file_id: FileId, name: String, expected: impl IntoIterator<Item = u32>) -> Self {
        Self {
            file_id,
            name,
            expected: expected.into_iter().collect(),
            received: BTreeMap::new(),
        }
    }

    /// Store a chunk payload. Duplicates and unexpected chunk numbers are ignored.
    /// Returns true if the payload was new.
    pub fn insert(&mut self, chunk_no: u32, payload: Vec<u8>) -> bool {
        if !self.expected.contains(&chunk_no) || self.received.contains_key(&chunk_no) {
            return false;
        }
        self.received.insert(chunk_no, payload);
        true
    }

    pub fn has_chunk(&self, chunk_no: u32) -> bool {
        self.received.contains_key(&chunk_no)
    }

    pub fn is_complete(&self) -> bool {
        self.expected.iter().all(|no| self.received.contains_key(no))
    }

    /// Expected chunks not received yet, in ascending order.
    pub fn missing(&self) -> Vec<u32> {
        self.expected
            .iter()
            .filter(|no| !self.received.contains_key(no))
            .copied()
            .collect()
    }

    /// Concatenate chunks in chunk-number order. Call only when `is_complete()`.
    pub fn reassemble(&self) -> Vec<u8> {
        let total: usize = self.received.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for payload in self.received.values() {
            out.extend_from_slice(payload);
        }
        out
    }
}
