//! Host-driven API: NodeCore receives messages and operation requests from the host,
//! updates shared state, and returns actions for the host to perform.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::chunk::{self, ChunkSpan, RestoreBuffer, DEFAULT_CHUNK_SIZE};
use crate::identity::{FileId, NodeId};
use crate::protocol::{ChunkKey, Message, MessageType, Version};
use crate::reclaim::{self, EvictionCandidate};
use crate::replication::{ChunkRecord, Removal};
use crate::state::{LocalFile, NodeState, StoreOutcome};

/// Log backup progress every this many resolved chunks.
const PROGRESS_EVERY: u32 = 5;

/// Action for the host to perform, in order.
#[derive(Debug)]
pub enum Action {
    /// Send on the message type's channel now.
    Send(Message),
    /// Send after a random reply delay.
    SendJittered(Message),
    /// Write a stored chunk's payload.
    WriteChunk { key: ChunkKey, body: Vec<u8> },
    /// Persist the stored chunk's record from current state.
    PersistRemoteChunk(ChunkKey),
    /// Persist an owned chunk's record from current state.
    PersistLocalChunk(ChunkKey),
    /// Persist an owned file's record.
    PersistLocalFile(FileId),
    /// Delete a stored chunk's payload and record.
    RemoveRemoteChunk(ChunkKey),
    /// Delete every stored chunk of a file.
    RemoveRemoteFile(FileId),
    /// Delete an owned file's metadata tree.
    RemoveLocalTree(FileId),
    /// Write the purge marker.
    MarkPurging(FileId),
    /// Remove the purge marker.
    ClearPurgeMarker(FileId),
    /// Run the DELETE broadcast chain.
    BroadcastDelete(FileId),
    /// After the delete chain and grace period, call `finish_purge`.
    SchedulePurge(FileId),
    /// After a random delay, if `take_pending_reply` still agrees, send the chunk on MDR.
    ServeChunk(ChunkKey),
    /// After a random delay, if `take_rebackup` still agrees, re-issue PUTCHUNK.
    Rebackup(ChunkKey),
    /// All chunks of a restore arrived, in chunk order.
    RestoreComplete {
        file_id: FileId,
        name: String,
        data: Vec<u8>,
    },
}

/// Why Backup did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BackupRefusal {
    #[error("invalid replication degree")]
    InvalidDegree,
    #[error("already backed up")]
    AlreadyBackedUp,
}

/// Where a re-backup takes its payload from.
#[derive(Debug, Clone)]
pub enum RebackupSource {
    /// Chunk of a file this node originated: re-read the original.
    Local(Arc<LocalFile>),
    /// Chunk stored here on behalf of another node.
    Remote,
}

/// An approved re-backup.
#[derive(Debug, Clone)]
pub struct RebackupPlan {
    pub key: ChunkKey,
    pub desired: u32,
    pub source: RebackupSource,
}

/// Progress after a backup chain resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupProgress {
    pub completed: u32,
    pub total: u32,
}

impl BackupProgress {
    pub fn is_finished(&self) -> bool {
        self.completed >= self.total
    }
}

/// Protocol coordinator for one node. Shared by every task; all methods take `&self`.
#[derive(Debug)]
pub struct NodeCore {
    node_id: NodeId,
    version: Version,
    chunk_size: u64,
    state: NodeState,
    /// GETCHUNKs answered after a delay unless a CHUNK shows up first.
    pending_replies: DashSet<ChunkKey>,
    /// Re-backups waiting out their delay unless a PUTCHUNK shows up first.
    pending_rebackups: DashSet<ChunkKey>,
    restoring: DashMap<FileId, RestoreBuffer>,
}

impl NodeCore {
    pub fn new(node_id: NodeId, version: Version) -> Self {
        Self::with_state(node_id, version, DEFAULT_CHUNK_SIZE, NodeState::new())
    }

    pub fn with_state(node_id: NodeId, version: Version, chunk_size: u64, state: NodeState) -> Self {
        Self {
            node_id,
            version,
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
            state,
            pending_replies: DashSet::new(),
            pending_rebackups: DashSet::new(),
            restoring: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// AWAKE announcement, sent by 1.1 nodes at startup.
    pub fn awake(&self) -> Option<Message> {
        self.version
            .defers_purge()
            .then(|| Message::awake(self.version, self.node_id))
    }

    // --- inbound ---

    /// Apply one inbound message. Messages this node sent itself are dropped untouched.
    pub fn on_message(&self, msg: Message) -> Vec<Action> {
        if msg.sender == self.node_id {
            tracing::trace!("dropping own {} echo", msg.kind);
            return Vec::new();
        }
        match msg.kind {
            MessageType::Putchunk => self.on_putchunk(msg),
            MessageType::Stored => self.on_stored(&msg),
            MessageType::Getchunk => self.on_getchunk(&msg),
            MessageType::Chunk => self.on_chunk(msg),
            MessageType::Delete => self.on_delete(&msg),
            MessageType::Removed => self.on_removed(&msg),
            MessageType::Awake => self.on_awake(&msg),
        }
    }

    fn on_putchunk(&self, msg: Message) -> Vec<Action> {
        let Some(key) = msg.chunk_key() else {
            return Vec::new();
        };
        if self.pending_rebackups.remove(&key).is_some() {
            tracing::debug!("re-backup of {} suppressed by peer {}", key, msg.sender);
        }
        if self.state.owns(&key.file_id) {
            return Vec::new();
        }
        let desired = msg.replication_degree.unwrap_or(1);
        let stored = Action::SendJittered(Message::stored(self.version, self.node_id, key));
        match self
            .state
            .store_remote_chunk(key, desired, msg.body.len() as u64)
        {
            StoreOutcome::Stored(_) => {
                tracing::debug!("storing {} ({} bytes) for {}", key, msg.body.len(), msg.sender);
                vec![
                    Action::WriteChunk {
                        key,
                        body: msg.body,
                    },
                    Action::PersistRemoteChunk(key),
                    stored,
                ]
            }
            StoreOutcome::Duplicate(_) => vec![stored],
            StoreOutcome::OverBudget => {
                tracing::debug!(
                    "refusing {} ({} bytes): storage ceiling {} reached",
                    key,
                    msg.body.len(),
                    self.state.max_size()
                );
                Vec::new()
            }
        }
    }

    fn on_stored(&self, msg: &Message) -> Vec<Action> {
        let Some(key) = msg.chunk_key() else {
            return Vec::new();
        };
        if let Some(file) = self.state.local_file(&key.file_id) {
            return match file.chunk(key.chunk_no) {
                Some(record) if record.record_stored(msg.sender) => {
                    vec![Action::PersistLocalChunk(key)]
                }
                _ => Vec::new(),
            };
        }
        if self.state.is_purging(&key.file_id) {
            tracing::debug!("late STORED for purging {} from {}", key, msg.sender);
            return vec![Action::Send(Message::delete(
                self.version,
                self.node_id,
                key.file_id,
            ))];
        }
        match self.state.remote_chunk(&key) {
            Some(record) if record.record_stored(msg.sender) => {
                vec![Action::PersistRemoteChunk(key)]
            }
            _ => Vec::new(),
        }
    }

    fn on_getchunk(&self, msg: &Message) -> Vec<Action> {
        let Some(key) = msg.chunk_key() else {
            return Vec::new();
        };
        if self.state.remote_chunk(&key).is_none() || !self.pending_replies.insert(key) {
            return Vec::new();
        }
        vec![Action::ServeChunk(key)]
    }

    fn on_chunk(&self, msg: Message) -> Vec<Action> {
        let Some(key) = msg.chunk_key() else {
            return Vec::new();
        };
        if self.pending_replies.remove(&key).is_some() {
            tracing::debug!("reply for {} suppressed by peer {}", key, msg.sender);
        }
        let complete = match self.restoring.get_mut(&key.file_id) {
            Some(mut buffer) => {
                buffer.insert(key.chunk_no, msg.body);
                buffer.is_complete()
            }
            None => return Vec::new(),
        };
        if !complete {
            return Vec::new();
        }
        match self.restoring.remove(&key.file_id) {
            Some((file_id, buffer)) => vec![Action::RestoreComplete {
                file_id,
                data: buffer.reassemble(),
                name: buffer.name,
            }],
            None => Vec::new(),
        }
    }

    fn on_delete(&self, msg: &Message) -> Vec<Action> {
        let Some(file_id) = msg.file_id else {
            return Vec::new();
        };
        match self.state.remove_remote_file(&file_id) {
            Some(_) => {
                tracing::info!("deleted stored file {} on request of {}", file_id, msg.sender);
                vec![Action::RemoveRemoteFile(file_id)]
            }
            None => Vec::new(),
        }
    }

    fn on_removed(&self, msg: &Message) -> Vec<Action> {
        let Some(key) = msg.chunk_key() else {
            return Vec::new();
        };
        let (record, held_locally, persist) = match self.state.local_file(&key.file_id) {
            Some(file) => match file.chunk(key.chunk_no) {
                Some(record) => (record, false, Action::PersistLocalChunk(key)),
                None => return Vec::new(),
            },
            None => match self.state.remote_chunk(&key) {
                Some(record) => (record, true, Action::PersistRemoteChunk(key)),
                None => return Vec::new(),
            },
        };
        match record.record_removed(msg.sender, held_locally) {
            Removal::Unchanged => Vec::new(),
            Removal::Satisfied => vec![persist],
            Removal::UnderReplicated => {
                tracing::debug!(
                    "{} under-replicated after REMOVED from {} ({}/{})",
                    key,
                    msg.sender,
                    record.effective(held_locally),
                    record.desired
                );
                let mut actions = vec![persist];
                if self.pending_rebackups.insert(key) {
                    actions.push(Action::Rebackup(key));
                }
                actions
            }
        }
    }

    fn on_awake(&self, msg: &Message) -> Vec<Action> {
        let purging = self.state.purging_ids();
        if !purging.is_empty() {
            tracing::debug!(
                "peer {} awake, re-announcing {} pending deletes",
                msg.sender,
                purging.len()
            );
        }
        purging
            .into_iter()
            .map(|file_id| Action::Send(Message::delete(self.version, self.node_id, file_id)))
            .collect()
    }

    // --- backup ---

    /// Register a new owned file. The caller streams chunks with `register_chunk`.
    pub fn begin_backup(
        &self,
        file_id: FileId,
        name: &str,
        size: u64,
        desired: u32,
    ) -> Result<(Arc<LocalFile>, Vec<Action>), BackupRefusal> {
        if desired == 0 {
            return Err(BackupRefusal::InvalidDegree);
        }
        if self.state.local_file(&file_id).is_some() {
            return Err(BackupRefusal::AlreadyBackedUp);
        }
        let mut actions = Vec::new();
        if let Some(previous) = self.state.local_by_name(name) {
            tracing::info!(
                "{} changed since its last backup, deleting old version {}",
                name,
                previous.file_id
            );
            actions.extend(self.delete_file(&previous.file_id));
        }
        if self.state.end_purge(&file_id).is_some() {
            actions.push(Action::ClearPurgeMarker(file_id));
        }
        let total = chunk::chunk_count(size, self.chunk_size);
        let file = Arc::new(LocalFile::new(file_id, name.to_string(), size, desired, total));
        if !self.state.insert_local(Arc::clone(&file)) {
            return Err(BackupRefusal::AlreadyBackedUp);
        }
        actions.push(Action::PersistLocalFile(file_id));
        Ok((file, actions))
    }

    /// Spans the file is streamed as.
    pub fn spans(&self, file: &LocalFile) -> Vec<ChunkSpan> {
        chunk::split_into_chunks(file.size, self.chunk_size)
    }

    /// Record a chunk as in flight before its first PUTCHUNK. None if the file is no
    /// longer active (deleted mid-stream).
    pub fn register_chunk(&self, file_id: &FileId, span: &ChunkSpan) -> Option<Arc<ChunkRecord>> {
        let file = self.state.local_file(file_id)?;
        Some(file.insert_chunk(ChunkRecord::new(span.chunk_no, file.desired, span.len())))
    }

    /// PUTCHUNK for one chunk of an owned file.
    pub fn putchunk(&self, key: ChunkKey, desired: u32, body: Vec<u8>) -> Message {
        Message::putchunk(self.version, self.node_id, key, desired, body)
    }

    /// Backup chain predicate, read from live state. A chunk that is gone counts as done.
    pub fn is_chunk_satisfied(&self, key: &ChunkKey) -> bool {
        if let Some(file) = self.state.local_file(&key.file_id) {
            return file
                .chunk(key.chunk_no)
                .map_or(true, |record| record.is_satisfied(false));
        }
        self.state
            .remote_chunk(key)
            .map_or(true, |record| record.is_satisfied(true))
    }

    /// A backup chain resolved (satisfied or gave up). Logs progress.
    pub fn resolve_backup_chunk(&self, file_id: &FileId) -> Option<BackupProgress> {
        let file = self.state.local_file(file_id)?;
        let progress = BackupProgress {
            completed: file.mark_resolved(),
            total: file.total_chunks,
        };
        if progress.is_finished() {
            tracing::info!(
                "backup of {} complete: {} chunks in {:.2?}",
                file.name,
                progress.total,
                file.elapsed()
            );
        } else if progress.completed % PROGRESS_EVERY == 0 {
            tracing::info!(
                "backup of {}: {}/{} chunks",
                file.name,
                progress.completed,
                progress.total
            );
        }
        Some(progress)
    }

    // --- re-backup ---

    /// Called when a re-backup delay fires. Returns a plan only if no peer re-sent the
    /// chunk meanwhile and it is still under-replicated.
    pub fn take_rebackup(&self, key: &ChunkKey) -> Option<RebackupPlan> {
        self.pending_rebackups.remove(key)?;
        if let Some(file) = self.state.local_file(&key.file_id) {
            let record = file.chunk(key.chunk_no)?;
            if record.is_satisfied(false) {
                return None;
            }
            return Some(RebackupPlan {
                key: *key,
                desired: record.desired,
                source: RebackupSource::Local(file),
            });
        }
        let record = self.state.remote_chunk(key)?;
        if record.is_satisfied(true) {
            return None;
        }
        Some(RebackupPlan {
            key: *key,
            desired: record.desired,
            source: RebackupSource::Remote,
        })
    }

    // --- restore ---

    /// Start reassembling an owned file. Returns the chunk keys to request.
    pub fn begin_restore(&self, name: &str) -> Option<Vec<ChunkKey>> {
        let file = self.state.local_by_name(name)?;
        let numbers = if file.chunk_numbers().is_empty() {
            (0..file.total_chunks).collect()
        } else {
            file.chunk_numbers()
        };
        let buffer = RestoreBuffer::new(file.file_id, file.name.clone(), numbers.iter().copied());
        self.restoring.insert(file.file_id, buffer);
        Some(
            numbers
                .into_iter()
                .map(|no| ChunkKey::new(file.file_id, no))
                .collect(),
        )
    }

    pub fn getchunk(&self, key: ChunkKey) -> Message {
        Message::getchunk(self.version, self.node_id, key)
    }

    /// Restore chain predicate: chunk received, or the restore is no longer running.
    pub fn is_chunk_restored(&self, key: &ChunkKey) -> bool {
        self.restoring
            .get(&key.file_id)
            .map_or(true, |buffer| buffer.has_chunk(key.chunk_no))
    }

    /// Stop waiting for a restore after its chains gave up. Returns the chunks that
    /// never arrived, or None if the restore already completed.
    pub fn abandon_restore(&self, file_id: &FileId) -> Option<Vec<u32>> {
        self.restoring
            .remove(file_id)
            .map(|(_, buffer)| buffer.missing())
    }

    /// Called when a CHUNK reply delay fires. False if a peer already answered.
    pub fn take_pending_reply(&self, key: &ChunkKey) -> bool {
        self.pending_replies.remove(key).is_some()
    }

    pub fn chunk_reply(&self, key: ChunkKey, body: Vec<u8>) -> Message {
        Message::chunk(self.version, self.node_id, key, body)
    }

    // --- delete ---

    /// Delete an owned file by name. None if no active file has that name.
    pub fn delete(&self, name: &str) -> Option<Vec<Action>> {
        let file = self.state.local_by_name(name)?;
        Some(self.delete_file(&file.file_id))
    }

    fn delete_file(&self, file_id: &FileId) -> Vec<Action> {
        if self.version.defers_purge() {
            if self.state.begin_purge(file_id).is_none() {
                return Vec::new();
            }
            vec![
                Action::MarkPurging(*file_id),
                Action::BroadcastDelete(*file_id),
                Action::SchedulePurge(*file_id),
            ]
        } else {
            if self.state.remove_local(file_id).is_none() {
                return Vec::new();
            }
            vec![
                Action::BroadcastDelete(*file_id),
                Action::RemoveLocalTree(*file_id),
            ]
        }
    }

    pub fn delete_message(&self, file_id: FileId) -> Message {
        Message::delete(self.version, self.node_id, file_id)
    }

    /// Deletes left pending by a previous run: broadcast again, then purge.
    pub fn resume_purges(&self) -> Vec<Action> {
        let pending = self.state.purging_ids();
        if !pending.is_empty() {
            tracing::info!("{} deletes pending from before restart", pending.len());
        }
        pending
            .into_iter()
            .flat_map(|file_id| [Action::BroadcastDelete(file_id), Action::SchedulePurge(file_id)])
            .collect()
    }

    /// Grace period over. True if the file is still purging and its tree can go.
    pub fn finish_purge(&self, file_id: &FileId) -> bool {
        self.state.end_purge(file_id).is_some()
    }

    // --- reclaim ---

    /// Set the storage ceiling and evict stored chunks until under it.
    pub fn reclaim(&self, max_bytes: i64) -> Vec<Action> {
        self.state.set_max_size(max_bytes);
        let needed = reclaim::bytes_over(self.state.current_size(), self.state.max_size());
        if needed == 0 {
            return Vec::new();
        }
        let candidates = self
            .state
            .remote_chunks()
            .into_iter()
            .map(|(key, record)| EvictionCandidate {
                key,
                slack: record.slack(),
                size: record.size,
            })
            .collect();
        let ordered = reclaim::order_for_eviction(candidates);
        // Chunks stored during the pass can keep the node over budget past the prefix.
        let chosen = reclaim::select(&ordered, needed).len();
        let mut actions = Vec::new();
        let mut evicted = 0usize;
        for (i, candidate) in ordered.iter().enumerate() {
            if i >= chosen && !self.state.is_over_budget() {
                break;
            }
            if self.state.remove_remote_chunk(&candidate.key).is_none() {
                continue;
            }
            evicted += 1;
            actions.push(Action::RemoveRemoteChunk(candidate.key));
            actions.push(Action::Send(Message::removed(
                self.version,
                self.node_id,
                candidate.key,
            )));
        }
        tracing::info!(
            "reclaim to {} bytes: evicted {} chunks, {} bytes held",
            max_bytes,
            evicted,
            self.state.current_size()
        );
        actions
    }

    /// Formatted state dump.
    pub fn render_state(&self) -> String {
        self.state.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: NodeId = NodeId(1);
    const B: NodeId = NodeId(2);
    const C: NodeId = NodeId(3);

    fn fid(name: &str) -> FileId {
        FileId::derive(name, 130_001, 42)
    }

    /// Back up a file and register every chunk, as the host would while streaming.
    fn backed_up(core: &NodeCore, name: &str, size: u64, desired: u32) -> Arc<LocalFile> {
        let (file, _) = core
            .begin_backup(FileId::derive(name, size, 42), name, size, desired)
            .unwrap();
        for span in core.spans(&file) {
            core.register_chunk(&file.file_id, &span).unwrap();
        }
        file
    }

    fn putchunk(from: NodeId, key: ChunkKey, desired: u32, body: &[u8]) -> Message {
        Message::putchunk(Version::V1_0, from, key, desired, body.to_vec())
    }

    #[test]
    fn own_messages_are_never_applied() {
        let core = NodeCore::new(ME, Version::V1_0);
        let key = ChunkKey::new(fid("x"), 0);
        assert!(core.on_message(putchunk(ME, key, 1, b"abc")).is_empty());
        assert!(core.state().remote_chunk(&key).is_none());
        assert_eq!(core.state().current_size(), 0);
    }

    #[test]
    fn backup_registers_three_chunks() {
        let core = NodeCore::new(ME, Version::V1_0);
        let file = backed_up(&core, "a.txt", 130_001, 3);
        let sizes: Vec<u64> = file.chunks().iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![64_000, 64_000, 2_001]);
        assert_eq!(file.total_chunks, 3);
    }

    #[test]
    fn backup_refusals() {
        let core = NodeCore::new(ME, Version::V1_0);
        let id = fid("a.txt");
        assert_eq!(
            core.begin_backup(id, "a.txt", 10, 0).unwrap_err(),
            BackupRefusal::InvalidDegree
        );
        core.begin_backup(id, "a.txt", 10, 1).unwrap();
        assert_eq!(
            core.begin_backup(id, "a.txt", 10, 1).unwrap_err(),
            BackupRefusal::AlreadyBackedUp
        );
    }

    #[test]
    fn backup_of_modified_file_deletes_old_version() {
        let core = NodeCore::new(ME, Version::V1_0);
        let old = backed_up(&core, "a.txt", 10, 1);
        let new_id = FileId::derive("a.txt", 11, 43);
        let (_, actions) = core.begin_backup(new_id, "a.txt", 11, 1).unwrap();
        assert!(matches!(&actions[0], Action::BroadcastDelete(id) if *id == old.file_id));
        assert!(core.state().local_file(&old.file_id).is_none());
        assert_eq!(core.state().local_by_name("a.txt").unwrap().file_id, new_id);
    }

    #[test]
    fn two_stored_replies_satisfy_chunk() {
        let core = NodeCore::new(ME, Version::V1_0);
        let file = backed_up(&core, "a.txt", 100, 2);
        let key = ChunkKey::new(file.file_id, 0);
        assert!(!core.is_chunk_satisfied(&key));
        let actions = core.on_message(Message::stored(Version::V1_0, B, key));
        assert!(matches!(actions[..], [Action::PersistLocalChunk(_)]));
        core.on_message(Message::stored(Version::V1_0, C, key));
        assert_eq!(file.chunk(0).unwrap().observed(), 2);
        assert!(core.is_chunk_satisfied(&key));
    }

    #[test]
    fn duplicate_stored_and_removed_are_noops() {
        let core = NodeCore::new(ME, Version::V1_0);
        let file = backed_up(&core, "a.txt", 100, 1);
        let key = ChunkKey::new(file.file_id, 0);
        core.on_message(Message::stored(Version::V1_0, B, key));
        assert!(core
            .on_message(Message::stored(Version::V1_0, B, key))
            .is_empty());
        assert_eq!(file.chunk(0).unwrap().peers(), vec![B]);
        core.on_message(Message::removed(Version::V1_0, B, key));
        assert!(core
            .on_message(Message::removed(Version::V1_0, B, key))
            .is_empty());
        assert_eq!(file.chunk(0).unwrap().observed(), 0);
    }

    #[test]
    fn putchunk_stores_and_acks_duplicates() {
        let core = NodeCore::new(B, Version::V1_0);
        let key = ChunkKey::new(fid("a.txt"), 0);
        let actions = core.on_message(putchunk(ME, key, 2, b"data"));
        assert!(matches!(
            actions[..],
            [
                Action::WriteChunk { .. },
                Action::PersistRemoteChunk(_),
                Action::SendJittered(_)
            ]
        ));
        let again = core.on_message(putchunk(ME, key, 2, b"data"));
        assert!(matches!(&again[..], [Action::SendJittered(m)] if m.kind == MessageType::Stored));
        assert_eq!(core.state().current_size(), 4);
    }

    #[test]
    fn putchunk_over_budget_is_not_acknowledged() {
        let core = NodeCore::new(B, Version::V1_0);
        core.state().set_max_size(3);
        let key = ChunkKey::new(fid("a.txt"), 0);
        assert!(core.on_message(putchunk(ME, key, 1, b"data")).is_empty());
        assert!(core.state().remote_chunk(&key).is_none());
    }

    #[test]
    fn putchunk_for_own_file_is_ignored() {
        let core = NodeCore::new(ME, Version::V1_0);
        let file = backed_up(&core, "a.txt", 10, 1);
        let key = ChunkKey::new(file.file_id, 0);
        assert!(core.on_message(putchunk(B, key, 1, b"x")).is_empty());
        assert!(core.state().remote_chunk(&key).is_none());
    }

    #[test]
    fn removed_below_target_schedules_rebackup() {
        let core = NodeCore::new(B, Version::V1_0);
        let key = ChunkKey::new(fid("f"), 0);
        core.on_message(putchunk(ME, key, 2, b"chunk"));
        core.on_message(Message::stored(Version::V1_0, C, key));
        assert_eq!(core.state().remote_chunk(&key).unwrap().observed(), 1);

        let actions = core.on_message(Message::removed(Version::V1_0, C, key));
        assert!(matches!(
            actions[..],
            [Action::PersistRemoteChunk(_), Action::Rebackup(_)]
        ));
        assert_eq!(core.state().remote_chunk(&key).unwrap().observed(), 0);
        let plan = core.take_rebackup(&key).unwrap();
        assert!(matches!(plan.source, RebackupSource::Remote));
        assert_eq!(plan.desired, 2);
        assert!(core.take_rebackup(&key).is_none());
    }

    #[test]
    fn peer_putchunk_suppresses_rebackup() {
        let core = NodeCore::new(B, Version::V1_0);
        let key = ChunkKey::new(fid("f"), 0);
        core.on_message(putchunk(ME, key, 2, b"chunk"));
        core.on_message(Message::stored(Version::V1_0, C, key));
        core.on_message(Message::removed(Version::V1_0, C, key));
        core.on_message(putchunk(NodeId(9), key, 2, b"chunk"));
        assert!(core.take_rebackup(&key).is_none());
    }

    #[test]
    fn getchunk_reply_suppressed_by_peer_chunk() {
        let core = NodeCore::new(B, Version::V1_0);
        let key = ChunkKey::new(fid("f"), 0);
        core.on_message(putchunk(ME, key, 1, b"chunk"));
        let actions = core.on_message(Message::getchunk(Version::V1_0, ME, key));
        assert!(matches!(actions[..], [Action::ServeChunk(_)]));
        core.on_message(Message::chunk(Version::V1_0, C, key, b"chunk".to_vec()));
        assert!(!core.take_pending_reply(&key));
    }

    #[test]
    fn getchunk_for_unknown_chunk_is_ignored() {
        let core = NodeCore::new(B, Version::V1_0);
        let key = ChunkKey::new(fid("f"), 0);
        assert!(core
            .on_message(Message::getchunk(Version::V1_0, ME, key))
            .is_empty());
    }

    #[test]
    fn restore_reassembles_out_of_order() {
        let core = NodeCore::with_state(ME, Version::V1_0, 2, NodeState::new());
        let file = backed_up(&core, "r.txt", 5, 1);
        let keys = core.begin_restore("r.txt").unwrap();
        assert_eq!(keys.len(), 3);
        assert!(!core.is_chunk_restored(&keys[1]));
        assert!(core
            .on_message(Message::chunk(Version::V1_0, B, keys[2], b"e".to_vec()))
            .is_empty());
        core.on_message(Message::chunk(Version::V1_0, C, keys[0], b"ab".to_vec()));
        assert!(core.is_chunk_restored(&keys[0]));
        let actions = core.on_message(Message::chunk(Version::V1_0, B, keys[1], b"cd".to_vec()));
        match &actions[..] {
            [Action::RestoreComplete {
                file_id,
                name,
                data,
            }] => {
                assert_eq!(*file_id, file.file_id);
                assert_eq!(name, "r.txt");
                assert_eq!(data, b"abcde");
            }
            other => panic!("unexpected actions {:?}", other),
        }
        assert!(core.is_chunk_restored(&keys[1]));
        assert!(core.begin_restore("missing").is_none());
    }

    #[test]
    fn abandoned_restore_reports_missing_chunks() {
        let core = NodeCore::with_state(ME, Version::V1_0, 2, NodeState::new());
        backed_up(&core, "r.txt", 5, 1);
        let keys = core.begin_restore("r.txt").unwrap();
        core.on_message(Message::chunk(Version::V1_0, B, keys[1], b"cd".to_vec()));
        assert_eq!(core.abandon_restore(&keys[0].file_id), Some(vec![0, 2]));
        assert!(core.is_chunk_restored(&keys[0]));
        assert_eq!(core.abandon_restore(&keys[0].file_id), None);
    }

    #[test]
    fn delete_receiver_drops_stored_file() {
        let core = NodeCore::new(B, Version::V1_1);
        let key = ChunkKey::new(fid("f"), 0);
        core.on_message(putchunk(ME, key, 1, b"12345"));
        let actions = core.on_message(Message::delete(Version::V1_0, ME, key.file_id));
        assert!(matches!(actions[..], [Action::RemoveRemoteFile(_)]));
        assert_eq!(core.state().current_size(), 0);
        assert!(core
            .on_message(Message::delete(Version::V1_0, ME, key.file_id))
            .is_empty());
    }

    #[test]
    fn immediate_delete() {
        let core = NodeCore::new(ME, Version::V1_0);
        let file = backed_up(&core, "a.txt", 10, 1);
        let actions = core.delete("a.txt").unwrap();
        assert!(matches!(
            actions[..],
            [Action::BroadcastDelete(_), Action::RemoveLocalTree(_)]
        ));
        assert!(core.state().local_file(&file.file_id).is_none());
        assert!(!core.state().is_purging(&file.file_id));
        assert!(core.delete("a.txt").is_none());
    }

    #[test]
    fn deferred_delete_absorbs_late_stored() {
        let core = NodeCore::new(ME, Version::V1_1);
        let file = backed_up(&core, "a.txt", 10, 1);
        let actions = core.delete("a.txt").unwrap();
        assert!(matches!(
            actions[..],
            [
                Action::MarkPurging(_),
                Action::BroadcastDelete(_),
                Action::SchedulePurge(_)
            ]
        ));
        assert!(core.state().local_by_name("a.txt").is_none());

        let key = ChunkKey::new(file.file_id, 0);
        let late = core.on_message(Message::stored(Version::V1_1, B, key));
        assert!(matches!(&late[..], [Action::Send(m)] if m.kind == MessageType::Delete));
        assert!(core.state().local_by_name("a.txt").is_none());
        assert!(core.state().is_purging(&file.file_id));

        assert!(core.finish_purge(&file.file_id));
        assert!(!core.finish_purge(&file.file_id));
    }

    #[test]
    fn rebackup_clears_purge() {
        let core = NodeCore::new(ME, Version::V1_1);
        let file = backed_up(&core, "a.txt", 10, 1);
        core.delete("a.txt").unwrap();
        let (_, actions) = core.begin_backup(file.file_id, "a.txt", 10, 1).unwrap();
        assert!(matches!(
            actions[..],
            [Action::ClearPurgeMarker(_), Action::PersistLocalFile(_)]
        ));
        assert!(!core.finish_purge(&file.file_id));
        assert!(core.state().local_file(&file.file_id).is_some());
    }

    #[test]
    fn restart_resumes_pending_purges() {
        let state = NodeState::new();
        let id = fid("gone.txt");
        state.insert_purging(Arc::new(LocalFile::new(id, "gone.txt".into(), 10, 1, 1)));
        let core = NodeCore::with_state(ME, Version::V1_1, 64_000, state);
        let actions = core.resume_purges();
        assert!(matches!(
            actions[..],
            [Action::BroadcastDelete(a), Action::SchedulePurge(b)] if a == id && b == id
        ));
        assert!(core.finish_purge(&id));
        assert!(core.resume_purges().is_empty());
    }

    #[test]
    fn awake_rebroadcasts_pending_deletes() {
        let core = NodeCore::new(ME, Version::V1_1);
        backed_up(&core, "a.txt", 10, 1);
        backed_up(&core, "b.txt", 10, 1);
        core.delete("a.txt").unwrap();
        core.delete("b.txt").unwrap();
        let actions = core.on_message(Message::awake(Version::V1_1, B));
        assert_eq!(actions.len(), 2);
        assert!(core.awake().is_some());
        assert!(NodeCore::new(ME, Version::V1_0).awake().is_none());
    }

    #[test]
    fn reclaim_evicts_over_replicated_first() {
        let core = NodeCore::new(B, Version::V1_0);
        let spare = ChunkKey::new(fid("f"), 0);
        let scarce = ChunkKey::new(fid("f"), 1);
        core.on_message(putchunk(ME, spare, 1, &[0; 10]));
        core.on_message(putchunk(ME, scarce, 3, &[0; 10]));
        core.on_message(Message::stored(Version::V1_0, C, spare));
        core.on_message(Message::stored(Version::V1_0, NodeId(4), spare));

        let actions = core.reclaim(15);
        assert!(matches!(&actions[..], [Action::RemoveRemoteChunk(k), Action::Send(_)] if *k == spare));
        assert_eq!(core.state().current_size(), 10);
        assert!(core.state().remote_chunk(&scarce).is_some());
    }

    #[test]
    fn reclaim_zero_evicts_everything() {
        let core = NodeCore::new(B, Version::V1_0);
        for no in 0..4 {
            core.on_message(putchunk(ME, ChunkKey::new(fid("f"), no), 1, &[1; 8]));
        }
        let actions = core.reclaim(0);
        assert_eq!(actions.len(), 8);
        assert_eq!(core.state().current_size(), 0);
        assert!(core.reclaim(0).is_empty());
    }

    #[test]
    fn resolve_counts_progress() {
        let core = NodeCore::new(ME, Version::V1_0);
        let file = backed_up(&core, "a.txt", 130_001, 1);
        let mut last = None;
        for _ in 0..3 {
            last = core.resolve_backup_chunk(&file.file_id);
        }
        assert!(last.unwrap().is_finished());
    }
}
