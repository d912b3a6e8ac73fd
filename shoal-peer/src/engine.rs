//! Protocol engine: public operations, action execution, and retry chains on tokio timers.

use std::io::{self, SeekFrom};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use shoal_core::chunk::ChunkSpan;
use shoal_core::scheduler::{self, RetryChain, RetryPolicy, Step};
use shoal_core::state::LocalFile;
use shoal_core::{Action, ChunkKey, FileId, Message, NodeCore, RebackupSource};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::channel::Outbound;
use crate::store::{MetadataStore, StoreError};

/// One running node. Shared as `Arc<Peer>` by channel handlers, chains and the
/// control socket.
pub struct Peer {
    core: NodeCore,
    store: MetadataStore,
    out: Outbound,
    retry_base: Duration,
    purge_grace: Duration,
}

impl Peer {
    pub fn new(
        core: NodeCore,
        store: MetadataStore,
        out: Outbound,
        retry_base: Duration,
        purge_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            store,
            out,
            retry_base,
            purge_grace,
        })
    }

    #[cfg(test)]
    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    /// Announce a (re)start on 1.1 so owners re-send pending deletes.
    pub fn announce(&self) {
        if let Some(awake) = self.core.awake() {
            self.out.send(&awake);
        }
    }

    /// Pick up deletes that were pending when the node last stopped: broadcast again,
    /// then purge after the usual grace period.
    pub async fn resume_purges(self: &Arc<Self>) {
        let actions = self.core.resume_purges();
        self.execute(actions).await;
    }

    /// Inbound datagram handler.
    pub async fn handle(self: Arc<Self>, msg: Message) {
        tracing::trace!("{} from {}", msg.kind, msg.sender);
        let actions = self.core.on_message(msg);
        self.execute(actions).await;
    }

    // --- public operations ---

    /// Back up the file at `path` with the given replication degree.
    pub async fn backup(self: &Arc<Self>, path: &str, desired: u32) -> String {
        if desired == 0 {
            return "invalid replication degree".to_string();
        }
        let (file_id, size) = match identify(path).await {
            Ok(found) => found,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return "file not found".to_string(),
            Err(e) => {
                tracing::warn!("cannot stat {}: {}", path, e);
                return "error opening file".to_string();
            }
        };
        let handle = match fs::File::open(path).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("cannot open {}: {}", path, e);
                return "error opening file".to_string();
            }
        };
        let (file, actions) = match self.core.begin_backup(file_id, path, size, desired) {
            Ok(started) => started,
            Err(refusal) => return refusal.to_string(),
        };
        self.execute(actions).await;
        tracing::info!(
            "backing up {} as {} ({} bytes, {} chunks, degree {})",
            path,
            file_id,
            size,
            file.total_chunks,
            desired
        );
        tokio::spawn(Arc::clone(self).stream(file, handle));
        "sent".to_string()
    }

    /// Request every chunk of an owned file. The file lands in `restored/` once all arrive.
    pub async fn restore(self: &Arc<Self>, path: &str) -> bool {
        let Some(keys) = self.core.begin_restore(path) else {
            return false;
        };
        tracing::info!("restoring {} ({} chunks)", path, keys.len());
        let remaining = Arc::new(AtomicUsize::new(keys.len()));
        for key in keys {
            let peer = Arc::clone(self);
            let remaining = Arc::clone(&remaining);
            tokio::spawn(async move {
                tokio::time::sleep(scheduler::reply_delay()).await;
                let request = peer.core.getchunk(key);
                let policy = RetryPolicy::restore(peer.retry_base);
                let step = peer
                    .drive(policy, &request, || peer.core.is_chunk_restored(&key))
                    .await;
                if step == Step::GiveUp {
                    tracing::info!("no CHUNK for {}, giving up", key);
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                if let Some(missing) = peer.core.abandon_restore(&key.file_id) {
                    tracing::info!(
                        "restore of {} incomplete, missing chunks {:?}",
                        key.file_id,
                        missing
                    );
                }
            });
        }
        true
    }

    /// Delete an owned file everywhere.
    pub async fn delete(self: &Arc<Self>, path: &str) -> bool {
        match self.core.delete(path) {
            Some(actions) => {
                tracing::info!("deleting {}", path);
                self.execute(actions).await;
                true
            }
            None => false,
        }
    }

    /// Set the storage ceiling, evicting stored chunks as needed.
    pub async fn reclaim(self: &Arc<Self>, max_bytes: i64) {
        let actions = self.core.reclaim(max_bytes);
        self.execute(actions).await;
    }

    pub fn state(&self) -> String {
        self.core.render_state()
    }

    // --- backup streaming ---

    async fn stream(self: Arc<Self>, file: Arc<LocalFile>, mut handle: fs::File) {
        for span in self.core.spans(&file) {
            let mut body = Vec::with_capacity(span.len() as usize);
            if let Err(e) = (&mut handle).take(span.len()).read_to_end(&mut body).await {
                tracing::warn!("reading {} failed at chunk {}: {}", file.name, span.chunk_no, e);
                break;
            }
            let short = (body.len() as u64) < span.len();
            let span = ChunkSpan {
                end: span.start + body.len() as u64,
                ..span
            };
            let Some(record) = self.core.register_chunk(&file.file_id, &span) else {
                tracing::debug!("{} deleted while streaming", file.name);
                break;
            };
            if let Err(e) = self.store.write_local_chunk(&file.file_id, &record).await {
                tracing::warn!("{}", e);
            }
            let key = ChunkKey::new(file.file_id, span.chunk_no);
            let msg = self.core.putchunk(key, file.desired, body);
            tokio::spawn(Arc::clone(&self).backup_chain(msg, key, true));
            if short {
                tracing::warn!("{} shrank while streaming, stopped at chunk {}", file.name, span.chunk_no);
                break;
            }
            tokio::time::sleep(scheduler::pacing_delay()).await;
        }
    }

    async fn backup_chain(self: Arc<Self>, msg: Message, key: ChunkKey, count_progress: bool) {
        let policy = RetryPolicy::backup(self.retry_base);
        let step = self
            .drive(policy, &msg, || self.core.is_chunk_satisfied(&key))
            .await;
        if step == Step::GiveUp {
            tracing::info!("{} still under-replicated, giving up", key);
        }
        if count_progress {
            self.core.resolve_backup_chunk(&key.file_id);
        }
    }

    /// Send, wait, re-check against live state; repeat until the chain resolves.
    async fn drive(&self, policy: RetryPolicy, msg: &Message, satisfied: impl Fn() -> bool) -> Step {
        let mut chain = RetryChain::new(policy);
        loop {
            self.out.send(msg);
            chain.record_send();
            tokio::time::sleep(chain.delay()).await;
            match chain.advance(satisfied()) {
                Step::Resend => continue,
                step => return step,
            }
        }
    }

    // --- action execution ---

    async fn execute(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            if let Err(e) = self.apply(action).await {
                tracing::warn!("{}", e);
            }
        }
    }

    async fn apply(self: &Arc<Self>, action: Action) -> Result<(), StoreError> {
        let state = self.core.state();
        match action {
            Action::Send(msg) => self.out.send(&msg),
            Action::SendJittered(msg) => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(scheduler::reply_delay()).await;
                    out.send(&msg);
                });
            }
            Action::WriteChunk { key, body } => {
                if state.remote_chunk(&key).is_none() {
                    return Ok(());
                }
                self.store.write_remote_chunk(&key, &body).await?;
                // A DELETE or eviction may have landed while the payload was written.
                if state.remote_chunk(&key).is_none() {
                    self.store.remove_remote_chunk(&key).await?;
                }
            }
            Action::PersistRemoteChunk(key) => {
                if let Some(record) = state.remote_chunk(&key) {
                    self.store.write_remote_meta(&key, &record).await?;
                }
            }
            Action::PersistLocalChunk(key) => {
                if let Some(record) = state
                    .local_file(&key.file_id)
                    .and_then(|f| f.chunk(key.chunk_no))
                {
                    self.store.write_local_chunk(&key.file_id, &record).await?;
                }
            }
            Action::PersistLocalFile(file_id) => {
                if let Some(file) = state.local_file(&file_id) {
                    self.store.write_local_file(&file).await?;
                }
            }
            Action::RemoveRemoteChunk(key) => self.store.remove_remote_chunk(&key).await?,
            Action::RemoveRemoteFile(file_id) => self.store.remove_remote_file(&file_id).await?,
            Action::RemoveLocalTree(file_id) => self.store.remove_local_tree(&file_id).await?,
            Action::MarkPurging(file_id) => self.store.mark_purging(&file_id).await?,
            Action::ClearPurgeMarker(file_id) => self.store.clear_purging(&file_id).await?,
            Action::BroadcastDelete(file_id) => {
                let peer = Arc::clone(self);
                tokio::spawn(async move {
                    let msg = peer.core.delete_message(file_id);
                    let step = peer
                        .drive(RetryPolicy::delete(), &msg, || {
                            peer.core.state().local_file(&file_id).is_some()
                        })
                        .await;
                    if step == Step::Done {
                        tracing::debug!("{} backed up again, DELETE broadcast stopped", file_id);
                    }
                });
            }
            Action::SchedulePurge(file_id) => {
                let peer = Arc::clone(self);
                let wait = delete_chain_bound() + self.purge_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    if peer.core.finish_purge(&file_id) {
                        tracing::info!("purged local records of {}", file_id);
                        if let Err(e) = peer.store.remove_local_tree(&file_id).await {
                            tracing::warn!("{}", e);
                        }
                    }
                });
            }
            Action::ServeChunk(key) => {
                tokio::spawn(Arc::clone(self).serve_chunk(key));
            }
            Action::Rebackup(key) => {
                tokio::spawn(Arc::clone(self).rebackup(key));
            }
            Action::RestoreComplete {
                file_id,
                name,
                data,
            } => {
                let path = self.store.write_restored(&name, &data).await?;
                tracing::info!(
                    "restored {} ({}, {} bytes) to {}",
                    name,
                    file_id,
                    data.len(),
                    path.display()
                );
            }
        }
        Ok(())
    }

    async fn serve_chunk(self: Arc<Self>, key: ChunkKey) {
        tokio::time::sleep(scheduler::reply_delay()).await;
        if !self.core.take_pending_reply(&key) {
            return;
        }
        match self.store.read_remote_chunk(&key).await {
            Ok(body) => self.out.send(&self.core.chunk_reply(key, body)),
            Err(e) => tracing::warn!("cannot serve {}: {}", key, e),
        }
    }

    async fn rebackup(self: Arc<Self>, key: ChunkKey) {
        tokio::time::sleep(scheduler::reply_delay()).await;
        let Some(plan) = self.core.take_rebackup(&key) else {
            return;
        };
        let body = match &plan.source {
            RebackupSource::Remote => self
                .store
                .read_remote_chunk(&key)
                .await
                .map_err(RebackupError::from),
            RebackupSource::Local(file) => self.read_original(file, key.chunk_no).await,
        };
        match body {
            Ok(body) => {
                tracing::debug!("re-backing up {}", key);
                let msg = self.core.putchunk(key, plan.desired, body);
                self.backup_chain(msg, key, false).await;
            }
            Err(reason) => tracing::info!("skipping re-backup of {}: {}", key, reason),
        }
    }

    /// Re-read one chunk of an owned file from its original path, if unchanged.
    async fn read_original(
        &self,
        file: &LocalFile,
        chunk_no: u32,
    ) -> Result<Vec<u8>, RebackupError> {
        let unreadable = |source| RebackupError::Original {
            path: file.name.clone(),
            source,
        };
        let (file_id, _) = identify(&file.name).await.map_err(unreadable)?;
        if file_id != file.file_id {
            return Err(RebackupError::Changed(file.name.clone()));
        }
        let chunk_size = self.core.chunk_size();
        let mut handle = fs::File::open(&file.name).await.map_err(unreadable)?;
        handle
            .seek(SeekFrom::Start(u64::from(chunk_no) * chunk_size))
            .await
            .map_err(unreadable)?;
        let mut body = Vec::new();
        handle
            .take(chunk_size)
            .read_to_end(&mut body)
            .await
            .map_err(unreadable)?;
        Ok(body)
    }
}

/// Why a re-backup found no payload to send.
#[derive(Debug, thiserror::Error)]
enum RebackupError {
    #[error("{0} changed since backup")]
    Changed(String),
    #[error("reading {path}: {source}")]
    Original { path: String, source: io::Error },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Longest a delete chain can run.
fn delete_chain_bound() -> Duration {
    let policy = RetryPolicy::delete();
    Duration::from_millis(u64::from(policy.max_sends) * policy.jitter_max_ms)
}

/// File id and size of a regular file: hash of path, size and mtime.
async fn identify(path: &str) -> io::Result<(FileId, u64)> {
    let meta = fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
    }
    let modified = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    Ok((FileId::derive(path, meta.len(), modified), meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Captured;
    use shoal_core::state::NodeState;
    use shoal_core::{wire, MessageType, NodeId, Version};
    use std::path::PathBuf;

    const A: NodeId = NodeId(1);
    const B: NodeId = NodeId(2);
    const C: NodeId = NodeId(3);

    struct Node {
        peer: Arc<Peer>,
        cap: Captured,
        root: PathBuf,
    }

    async fn node(dir: &tempfile::TempDir, id: NodeId, version: Version, chunk_size: u64) -> Node {
        let root = dir.path().join(id.to_string());
        let store = MetadataStore::open(&root).await.unwrap();
        let core = NodeCore::with_state(id, version, chunk_size, NodeState::new());
        let (out, cap) = Captured::new();
        let peer = Peer::new(
            core,
            store,
            out,
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        Node { peer, cap, root }
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, len: usize) -> String {
        let path = dir.path().join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path.to_string_lossy().into_owned()
    }

    async fn next(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) -> Message {
        wire::decode(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn backup_reports_input_errors() {
        let dir = tempfile::tempdir().unwrap();
        let a = node(&dir, A, Version::V1_0, 64_000).await;
        let path = write_file(&dir, "a.txt", 10);
        assert_eq!(a.peer.backup(&path, 0).await, "invalid replication degree");
        assert_eq!(a.peer.backup("/no/such/file", 1).await, "file not found");
        assert_eq!(a.peer.backup(&path, 1).await, "sent");
        assert_eq!(a.peer.backup(&path, 1).await, "already backed up");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_backup_sends_five_times_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = node(&dir, A, Version::V1_0, 64_000).await;
        let path = write_file(&dir, "big.bin", 130_001);
        assert_eq!(a.peer.backup(&path, 3).await, "sent");
        tokio::time::sleep(Duration::from_secs(120)).await;

        let sent = a.cap.backup();
        assert_eq!(sent.len(), 15);
        for no in 0..3 {
            let bodies: Vec<usize> = sent
                .iter()
                .filter(|m| m.chunk_no == Some(no))
                .map(|m| m.body.len())
                .collect();
            assert_eq!(bodies.len(), 5);
            assert_eq!(bodies[0], if no < 2 { 64_000 } else { 2_001 });
        }
        let file = a.peer.core().state().local_by_name(&path).unwrap();
        assert_eq!(file.completed(), 3);
        assert!(a
            .root
            .join("local")
            .join(file.file_id.to_string())
            .join("2")
            .exists());
    }

    #[tokio::test(start_paused = true)]
    async fn stored_replies_stop_retries() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = node(&dir, A, Version::V1_0, 64_000).await;
        let path = write_file(&dir, "a.txt", 100);
        a.peer.backup(&path, 2).await;
        let put = next(&mut a.cap.mdb).await;
        let key = put.chunk_key().unwrap();
        for from in [B, C] {
            Arc::clone(&a.peer)
                .handle(Message::stored(Version::V1_0, from, key))
                .await;
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(a.cap.backup().is_empty());
        let file = a.peer.core().state().local_by_name(&path).unwrap();
        assert_eq!(file.chunk(0).unwrap().observed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backup_then_restore_between_two_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = node(&dir, A, Version::V1_0, 4).await;
        let mut b = node(&dir, B, Version::V1_0, 4).await;
        let path = write_file(&dir, "r.txt", 10);
        let original = std::fs::read(&path).unwrap();

        a.peer.backup(&path, 1).await;
        for _ in 0..3 {
            let put = next(&mut a.cap.mdb).await;
            assert_eq!(put.kind, MessageType::Putchunk);
            Arc::clone(&b.peer).handle(put).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        for stored in b.cap.control() {
            Arc::clone(&a.peer).handle(stored).await;
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
        a.cap.backup();

        assert!(a.peer.restore(&path).await);
        for _ in 0..3 {
            let get = next(&mut a.cap.mc).await;
            assert_eq!(get.kind, MessageType::Getchunk);
            Arc::clone(&b.peer).handle(get).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        for chunk in b.cap.restore() {
            Arc::clone(&a.peer).handle(chunk).await;
        }
        let restored = std::fs::read(a.root.join("restored/r.txt")).unwrap();
        assert_eq!(restored, original);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_triggers_rebackup_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = node(&dir, B, Version::V1_0, 64_000).await;
        let key = ChunkKey::new(FileId::derive("f", 1, 1), 0);
        let peer = || Arc::clone(&b.peer);
        peer()
            .handle(Message::putchunk(Version::V1_0, A, key, 2, b"payload".to_vec()))
            .await;
        peer().handle(Message::stored(Version::V1_0, C, key)).await;
        peer().handle(Message::removed(Version::V1_0, C, key)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let put = next(&mut b.cap.mdb).await;
        assert_eq!(put.chunk_key(), Some(key));
        assert_eq!(put.body, b"payload");
        assert_eq!(put.replication_degree, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_reply_suppressed_when_peer_answers() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = node(&dir, B, Version::V1_0, 64_000).await;
        let key = ChunkKey::new(FileId::derive("f", 1, 1), 0);
        Arc::clone(&b.peer)
            .handle(Message::putchunk(Version::V1_0, A, key, 1, b"x".to_vec()))
            .await;
        Arc::clone(&b.peer)
            .handle(Message::getchunk(Version::V1_0, A, key))
            .await;
        Arc::clone(&b.peer)
            .handle(Message::chunk(Version::V1_0, C, key, b"x".to_vec()))
            .await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(b.cap.restore().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_delete_purges_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = node(&dir, A, Version::V1_1, 64_000).await;
        let path = write_file(&dir, "a.txt", 10);
        a.peer.backup(&path, 1).await;
        next(&mut a.cap.mdb).await;
        let file_id = a.peer.core().state().local_by_name(&path).unwrap().file_id;
        let tree = a.root.join("local").join(file_id.to_string());

        assert!(a.peer.delete(&path).await);
        assert!(tree.join("PURGING").exists());
        assert!(a.peer.core().state().local_by_name(&path).is_none());

        Arc::clone(&a.peer)
            .handle(Message::stored(Version::V1_1, B, ChunkKey::new(file_id, 0)))
            .await;
        assert!(a.peer.core().state().local_by_name(&path).is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let deletes = a
            .cap
            .control()
            .into_iter()
            .filter(|m| m.kind == MessageType::Delete)
            .count();
        assert_eq!(deletes, 6);
        assert!(!tree.exists());
        assert!(!a.peer.core().state().is_purging(&file_id));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_delete_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = node(&dir, A, Version::V1_0, 64_000).await;
        let path = write_file(&dir, "a.txt", 10);
        a.peer.backup(&path, 1).await;
        next(&mut a.cap.mdb).await;
        let file_id = a.peer.core().state().local_by_name(&path).unwrap().file_id;
        assert!(a.peer.delete(&path).await);
        assert!(!a.root.join("local").join(file_id.to_string()).exists());
        assert!(!a.peer.delete(&path).await);
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_evicts_and_announces() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = node(&dir, B, Version::V1_0, 64_000).await;
        let file_id = FileId::derive("f", 1, 1);
        for no in 0..2 {
            Arc::clone(&b.peer)
                .handle(Message::putchunk(
                    Version::V1_0,
                    A,
                    ChunkKey::new(file_id, no),
                    1,
                    vec![7; 10],
                ))
                .await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        b.cap.control();

        b.peer.reclaim(0).await;
        let removed = b.cap.control();
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|m| m.kind == MessageType::Removed));
        assert_eq!(b.peer.core().state().current_size(), 0);
        assert!(!b.root.join("remote").join(file_id.to_string()).join("0").exists());
        assert!(b.peer.state().contains("max size: 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn backup_again_stops_delete_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = node(&dir, A, Version::V1_1, 64_000).await;
        let path = write_file(&dir, "a.txt", 10);
        a.peer.backup(&path, 1).await;
        next(&mut a.cap.mdb).await;
        let file_id = a.peer.core().state().local_by_name(&path).unwrap().file_id;

        assert!(a.peer.delete(&path).await);
        let first = next(&mut a.cap.mc).await;
        assert_eq!(first.kind, MessageType::Delete);
        assert_eq!(a.peer.backup(&path, 1).await, "sent");
        a.cap.control();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let deletes = a
            .cap
            .control()
            .into_iter()
            .filter(|m| m.kind == MessageType::Delete)
            .count();
        assert_eq!(deletes, 0);
        assert!(a.peer.core().state().local_file(&file_id).is_some());
        assert!(a
            .root
            .join("local")
            .join(file_id.to_string())
            .join("FILE")
            .exists());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_finishes_pending_delete() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("1");
        let store = MetadataStore::open(&root).await.unwrap();
        let file_id = FileId::derive("gone.txt", 10, 1);
        store
            .write_local_file(&LocalFile::new(file_id, "gone.txt".into(), 10, 1, 1))
            .await
            .unwrap();
        store.mark_purging(&file_id).await.unwrap();

        let state = store.load(64_000).await.unwrap();
        let core = NodeCore::with_state(A, Version::V1_1, 64_000, state);
        let (out, mut cap) = Captured::new();
        let peer = Peer::new(core, store, out, Duration::from_secs(1), Duration::from_secs(2));
        peer.resume_purges().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        let deletes: Vec<Message> = cap.control();
        assert_eq!(deletes.len(), 5);
        assert!(deletes.iter().all(|m| m.file_id == Some(file_id)));
        assert!(!peer.core().state().is_purging(&file_id));
        assert!(!root.join("local").join(file_id.to_string()).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn payload_of_deleted_chunk_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let b = node(&dir, B, Version::V1_0, 64_000).await;
        let key = ChunkKey::new(FileId::derive("f", 1, 1), 0);
        b.peer
            .apply(Action::WriteChunk {
                key,
                body: b"late".to_vec(),
            })
            .await
            .unwrap();
        let payload = b.root.join("remote").join(key.file_id.to_string()).join("0");
        assert!(!payload.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_putchunks_store_once() {
        let dir = tempfile::tempdir().unwrap();
        let b = node(&dir, B, Version::V1_0, 64_000).await;
        let key = ChunkKey::new(FileId::derive("f", 1, 1), 0);
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let msg = Message::putchunk(Version::V1_0, A, key, 2, vec![3; 100]);
            tasks.push(tokio::spawn(Arc::clone(&b.peer).handle(msg)));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let state = b.peer.core().state();
        assert_eq!(state.remote_chunks().len(), 1);
        assert_eq!(state.current_size(), 100);
        let payload = b.root.join("remote").join(key.file_id.to_string()).join("0");
        assert_eq!(std::fs::read(payload).unwrap(), vec![3; 100]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stored_replies_persist_every_peer() {
        let dir = tempfile::tempdir().unwrap();
        let b = node(&dir, B, Version::V1_0, 64_000).await;
        for round in 0..20u32 {
            let key = ChunkKey::new(FileId::derive("f", 1, 1), round);
            Arc::clone(&b.peer)
                .handle(Message::putchunk(Version::V1_0, A, key, 2, vec![1; 8]))
                .await;
            let mut tasks = Vec::new();
            for peer_id in 10..18 {
                let msg = Message::stored(Version::V1_0, NodeId(peer_id), key);
                tasks.push(tokio::spawn(Arc::clone(&b.peer).handle(msg)));
            }
            for task in tasks {
                task.await.unwrap();
            }
            let meta = b
                .root
                .join("remote")
                .join(key.file_id.to_string())
                .join(format!("{}.meta", round));
            let expected: Vec<String> = (10..18).map(|p: u32| p.to_string()).collect();
            assert_eq!(
                std::fs::read_to_string(meta).unwrap(),
                format!("8;2;8;{}", expected.join(","))
            );
        }
        let file_dir = b
            .root
            .join("remote")
            .join(FileId::derive("f", 1, 1).to_string());
        let leftovers = std::fs::read_dir(file_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rebackup_refuses_changed_original() {
        let dir = tempfile::tempdir().unwrap();
        let a = node(&dir, A, Version::V1_0, 4).await;
        let path = write_file(&dir, "a.txt", 10);
        a.peer.backup(&path, 1).await;
        let file = a.peer.core().state().local_by_name(&path).unwrap();
        assert_eq!(a.peer.read_original(&file, 1).await.unwrap(), vec![4, 5, 6, 7]);

        std::fs::write(&path, b"something longer than before").unwrap();
        assert!(matches!(
            a.peer.read_original(&file, 1).await,
            Err(RebackupError::Changed(_))
        ));
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            a.peer.read_original(&file, 1).await,
            Err(RebackupError::Original { .. })
        ));
    }
}
