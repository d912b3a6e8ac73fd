//! Node state: owned files, stored chunks, pending purges and the storage budget.
//!
//! Every collection is a concurrent map so inbound handlers, retry chains and public
//! operations can touch it at the same time. First-seen records go through the map's
//! `entry` API and size counters are atomics.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::identity::FileId;
use crate::protocol::ChunkKey;
use crate::replication::ChunkRecord;

/// `max_size` value meaning no ceiling.
pub const UNLIMITED: i64 = -1;

/// A file this node originated.
#[derive(Debug)]
pub struct LocalFile {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub desired: u32,
    pub total_chunks: u32,
    chunks: DashMap<u32, Arc<ChunkRecord>>,
    completed: AtomicU32,
    started: Instant,
}

impl LocalFile {
    pub fn new(file_id: FileId, name: String, size: u64, desired: u32, total_chunks: u32) -> Self {
        Self {
            file_id,
            name,
            size,
            desired,
            total_chunks,
            chunks: DashMap::new(),
            completed: AtomicU32::new(0),
            started: Instant::now(),
        }
    }

    /// Rebuild from persisted records. Chains are not resumed, so the file counts as done.
    pub fn from_records(
        file_id: FileId,
        name: String,
        size: u64,
        desired: u32,
        total_chunks: u32,
        chunks: impl IntoIterator<Item = ChunkRecord>,
    ) -> Self {
        let file = Self::new(file_id, name, size, desired, total_chunks);
        for record in chunks {
            file.chunks.insert(record.chunk_no, Arc::new(record));
        }
        file.completed.store(total_chunks, Ordering::Relaxed);
        file
    }

    pub fn chunk(&self, chunk_no: u32) -> Option<Arc<ChunkRecord>> {
        self.chunks.get(&chunk_no).map(|r| Arc::clone(r.value()))
    }

    /// Record a chunk as in flight. An existing record for the same number is kept.
    pub fn insert_chunk(&self, record: ChunkRecord) -> Arc<ChunkRecord> {
        Arc::clone(
            self.chunks
                .entry(record.chunk_no)
                .or_insert_with(|| Arc::new(record))
                .value(),
        )
    }

    /// Chunk records sorted by chunk number.
    pub fn chunks(&self) -> Vec<Arc<ChunkRecord>> {
        let mut out: Vec<Arc<ChunkRecord>> =
            self.chunks.iter().map(|r| Arc::clone(r.value())).collect();
        out.sort_by_key(|c| c.chunk_no);
        out
    }

    pub fn chunk_numbers(&self) -> Vec<u32> {
        self.chunks().iter().map(|c| c.chunk_no).collect()
    }

    /// Count one resolved backup chain; returns the new total.
    pub fn mark_resolved(&self) -> u32 {
        self.completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Chunks stored on behalf of another node.
#[derive(Debug)]
pub struct RemoteFile {
    pub file_id: FileId,
    chunks: DashMap<u32, Arc<ChunkRecord>>,
}

impl RemoteFile {
    pub fn new(file_id: FileId) -> Self {
        Self {
            file_id,
            chunks: DashMap::new(),
        }
    }

    pub fn chunk(&self, chunk_no: u32) -> Option<Arc<ChunkRecord>> {
        self.chunks.get(&chunk_no).map(|r| Arc::clone(r.value()))
    }

    pub fn chunks(&self) -> Vec<Arc<ChunkRecord>> {
        let mut out: Vec<Arc<ChunkRecord>> =
            self.chunks.iter().map(|r| Arc::clone(r.value())).collect();
        out.sort_by_key(|c| c.chunk_no);
        out
    }

    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|r| r.value().size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Result of offering a chunk for storage.
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    /// New chunk recorded; its bytes are reserved in the budget.
    Stored(Arc<ChunkRecord>),
    /// Already held; nothing changed.
    Duplicate(Arc<ChunkRecord>),
    /// Would exceed `max_size`; not stored.
    OverBudget,
}

/// Everything a node knows, shared by all tasks.
#[derive(Debug)]
pub struct NodeState {
    local: DashMap<FileId, Arc<LocalFile>>,
    remote: DashMap<FileId, Arc<RemoteFile>>,
    purging: DashMap<FileId, Arc<LocalFile>>,
    current_size: AtomicU64,
    max_size: AtomicI64,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeState {
    pub fn new() -> Self {
        Self {
            local: DashMap::new(),
            remote: DashMap::new(),
            purging: DashMap::new(),
            current_size: AtomicU64::new(0),
            max_size: AtomicI64::new(UNLIMITED),
        }
    }

    // --- owned files ---

    pub fn local_file(&self, file_id: &FileId) -> Option<Arc<LocalFile>> {
        self.local.get(file_id).map(|r| Arc::clone(r.value()))
    }

    pub fn local_by_name(&self, name: &str) -> Option<Arc<LocalFile>> {
        self.local
            .iter()
            .find(|r| r.value().name == name)
            .map(|r| Arc::clone(r.value()))
    }

    /// Insert-if-absent. Returns false if the file id is already active.
    pub fn insert_local(&self, file: Arc<LocalFile>) -> bool {
        match self.local.entry(file.file_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(file);
                true
            }
        }
    }

    pub fn remove_local(&self, file_id: &FileId) -> Option<Arc<LocalFile>> {
        self.local.remove(file_id).map(|(_, f)| f)
    }

    /// Sorted snapshot of active owned files.
    pub fn local_files(&self) -> Vec<Arc<LocalFile>> {
        let mut out: Vec<Arc<LocalFile>> =
            self.local.iter().map(|r| Arc::clone(r.value())).collect();
        out.sort_by_key(|f| f.file_id);
        out
    }

    // --- pending purges ---

    /// Move an active file into the purge set. Returns the file if it was active.
    pub fn begin_purge(&self, file_id: &FileId) -> Option<Arc<LocalFile>> {
        let file = self.remove_local(file_id)?;
        self.purging.insert(*file_id, Arc::clone(&file));
        Some(file)
    }

    /// Record a purge found on disk at startup.
    pub fn insert_purging(&self, file: Arc<LocalFile>) {
        self.purging.insert(file.file_id, file);
    }

    pub fn end_purge(&self, file_id: &FileId) -> Option<Arc<LocalFile>> {
        self.purging.remove(file_id).map(|(_, f)| f)
    }

    pub fn is_purging(&self, file_id: &FileId) -> bool {
        self.purging.contains_key(file_id)
    }

    pub fn purging_ids(&self) -> Vec<FileId> {
        let mut out: Vec<FileId> = self.purging.iter().map(|r| *r.key()).collect();
        out.sort();
        out
    }

    /// Whether this node originated the file, active or purging.
    pub fn owns(&self, file_id: &FileId) -> bool {
        self.local.contains_key(file_id) || self.purging.contains_key(file_id)
    }

    // --- stored chunks ---

    pub fn remote_file(&self, file_id: &FileId) -> Option<Arc<RemoteFile>> {
        self.remote.get(file_id).map(|r| Arc::clone(r.value()))
    }

    pub fn remote_chunk(&self, key: &ChunkKey) -> Option<Arc<ChunkRecord>> {
        self.remote_file(&key.file_id)?.chunk(key.chunk_no)
    }

    /// Insert-if-absent a chunk offered by PUTCHUNK, reserving its bytes in the budget.
    pub fn store_remote_chunk(&self, key: ChunkKey, desired: u32, size: u64) -> StoreOutcome {
        if let Some(existing) = self.remote_chunk(&key) {
            return StoreOutcome::Duplicate(existing);
        }
        if !self.reserve(size) {
            return StoreOutcome::OverBudget;
        }
        let file = Arc::clone(
            self.remote
                .entry(key.file_id)
                .or_insert_with(|| Arc::new(RemoteFile::new(key.file_id)))
                .value(),
        );
        let outcome = match file.chunks.entry(key.chunk_no) {
            Entry::Occupied(slot) => StoreOutcome::Duplicate(Arc::clone(slot.get())),
            Entry::Vacant(slot) => {
                let record = Arc::new(ChunkRecord::new(key.chunk_no, desired, size));
                slot.insert(Arc::clone(&record));
                StoreOutcome::Stored(record)
            }
        };
        if matches!(outcome, StoreOutcome::Duplicate(_)) {
            self.release(size);
        }
        outcome
    }

    /// Record a chunk found on disk at startup. Counts toward the size, ignores the ceiling.
    pub fn insert_loaded_remote(&self, file_id: FileId, record: ChunkRecord) {
        let file = Arc::clone(
            self.remote
                .entry(file_id)
                .or_insert_with(|| Arc::new(RemoteFile::new(file_id)))
                .value(),
        );
        let size = record.size;
        if file.chunks.insert(record.chunk_no, Arc::new(record)).is_none() {
            self.current_size.fetch_add(size, Ordering::AcqRel);
        }
    }

    /// Drop one stored chunk and release its bytes.
    pub fn remove_remote_chunk(&self, key: &ChunkKey) -> Option<Arc<ChunkRecord>> {
        let file = self.remote_file(&key.file_id)?;
        let (_, record) = file.chunks.remove(&key.chunk_no)?;
        self.release(record.size);
        self.remote.remove_if(&key.file_id, |_, f| f.is_empty());
        Some(record)
    }

    /// Drop every stored chunk of a file and release their bytes.
    pub fn remove_remote_file(&self, file_id: &FileId) -> Option<Arc<RemoteFile>> {
        let (_, file) = self.remote.remove(file_id)?;
        self.release(file.total_size());
        Some(file)
    }

    /// Snapshot of every stored chunk.
    pub fn remote_chunks(&self) -> Vec<(ChunkKey, Arc<ChunkRecord>)> {
        let mut out = Vec::new();
        for file in self.remote.iter() {
            for chunk in file.value().chunks() {
                out.push((ChunkKey::new(*file.key(), chunk.chunk_no), chunk));
            }
        }
        out.sort_by_key(|(key, _)| *key);
        out
    }

    pub fn remote_files(&self) -> Vec<Arc<RemoteFile>> {
        let mut out: Vec<Arc<RemoteFile>> =
            self.remote.iter().map(|r| Arc::clone(r.value())).collect();
        out.sort_by_key(|f| f.file_id);
        out
    }

    // --- budget ---

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }

    pub fn max_size(&self) -> i64 {
        self.max_size.load(Ordering::Acquire)
    }

    /// Set the ceiling. Negative values mean unlimited.
    pub fn set_max_size(&self, max: i64) {
        self.max_size.store(max.max(UNLIMITED), Ordering::Release);
    }

    pub fn is_over_budget(&self) -> bool {
        let max = self.max_size();
        max >= 0 && self.current_size() > max as u64
    }

    fn reserve(&self, size: u64) -> bool {
        let max = self.max_size();
        self.current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(size)?;
                if max >= 0 && next > max as u64 {
                    None
                } else {
                    Some(next)
                }
            })
            .is_ok()
    }

    fn release(&self, size: u64) {
        let _ = self
            .current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            });
    }

    /// Human-readable dump; files sorted by id, chunks by number.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "max size: {}", self.max_size());
        let _ = writeln!(out, "current size: {}", self.current_size());
        let _ = writeln!(out, "owned files:");
        for file in self.local_files() {
            let _ = writeln!(
                out,
                "  {} id={} desired={} size={}",
                file.name, file.file_id, file.desired, file.size
            );
            for chunk in file.chunks() {
                let _ = writeln!(
                    out,
                    "    chunk {} observed={}",
                    chunk.chunk_no,
                    chunk.observed()
                );
            }
        }
        let purging = self.purging_ids();
        if !purging.is_empty() {
            let _ = writeln!(out, "pending purge:");
            for id in purging {
                let _ = writeln!(out, "  {}", id);
            }
        }
        let _ = writeln!(out, "stored files:");
        for file in self.remote_files() {
            let _ = writeln!(out, "  id={}", file.file_id);
            for chunk in file.chunks() {
                let _ = writeln!(
                    out,
                    "    chunk {} desired={} observed={} size={}",
                    chunk.chunk_no,
                    chunk.desired,
                    chunk.effective(true),
                    chunk.size
                );
            }
        }
        out
    }
}
