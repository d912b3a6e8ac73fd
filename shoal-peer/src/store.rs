//! On-disk metadata and chunk store, rooted at `<root_dir>/<node_id>/`.
//!
//! ```text
//! local/<fileId>/FILE            name;desired;size
//! local/<fileId>/<chunkNo>       desired;size;peer,peer
//! local/<fileId>/PURGING         purge marker, empty
//! remote/<fileId>/<chunkNo>      chunk payload
//! remote/<fileId>/<chunkNo>.meta observed;desired;size;peer,peer
//! restored/<basename>            restored files
//! ```
//!
//! Every write goes to a uniquely named `<path>.<n>.tmp` and is renamed into place.
//! Writers of the same record take turns and render it only once they hold the turn,
//! so the record left on disk reflects the newest state.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shoal_core::chunk;
use shoal_core::replication::ChunkRecord;
use shoal_core::state::{LocalFile, NodeState};
use shoal_core::{ChunkKey, FileId, NodeId};
use dashmap::DashMap;
use tokio::fs;
use tokio::sync::Mutex;

const LOCAL_DIR: &str = "local";
const REMOTE_DIR: &str = "remote";
const RESTORED_DIR: &str = "restored";
const FILE_RECORD: &str = "FILE";
const PURGE_MARKER: &str = "PURGING";
const META_SUFFIX: &str = ".meta";
const TMP_SUFFIX: &str = ".tmp";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("malformed record {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

fn io_err(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { op, path, source }
}

/// Handle on one node's directory tree. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
    /// One turn lock per record currently being written.
    writing: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl MetadataStore {
    /// Create the directory skeleton if missing.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [LOCAL_DIR, REMOTE_DIR, RESTORED_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(io_err("create", &path))?;
        }
        Ok(Self {
            root,
            writing: Arc::new(DashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn local_dir(&self, file_id: &FileId) -> PathBuf {
        self.root.join(LOCAL_DIR).join(file_id.to_string())
    }

    fn remote_dir(&self, file_id: &FileId) -> PathBuf {
        self.root.join(REMOTE_DIR).join(file_id.to_string())
    }

    fn remote_payload(&self, key: &ChunkKey) -> PathBuf {
        self.remote_dir(&key.file_id).join(key.chunk_no.to_string())
    }

    fn remote_meta(&self, key: &ChunkKey) -> PathBuf {
        self.remote_dir(&key.file_id)
            .join(format!("{}{}", key.chunk_no, META_SUFFIX))
    }

    // --- owned files ---

    pub async fn write_local_file(&self, file: &LocalFile) -> Result<(), StoreError> {
        let path = self.local_dir(&file.file_id).join(FILE_RECORD);
        self.write_atomic(&path, || format_file_record(file)).await
    }

    pub async fn write_local_chunk(
        &self,
        file_id: &FileId,
        record: &ChunkRecord,
    ) -> Result<(), StoreError> {
        let path = self.local_dir(file_id).join(record.chunk_no.to_string());
        self.write_atomic(&path, || format_local_chunk(record)).await
    }

    pub async fn remove_local_tree(&self, file_id: &FileId) -> Result<(), StoreError> {
        remove_dir(&self.local_dir(file_id)).await
    }

    pub async fn mark_purging(&self, file_id: &FileId) -> Result<(), StoreError> {
        let path = self.local_dir(file_id).join(PURGE_MARKER);
        self.write_atomic(&path, || b"").await
    }

    pub async fn clear_purging(&self, file_id: &FileId) -> Result<(), StoreError> {
        remove_file(&self.local_dir(file_id).join(PURGE_MARKER)).await
    }

    // --- stored chunks ---

    pub async fn write_remote_chunk(&self, key: &ChunkKey, body: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(&self.remote_payload(key), || body).await
    }

    pub async fn write_remote_meta(
        &self,
        key: &ChunkKey,
        record: &ChunkRecord,
    ) -> Result<(), StoreError> {
        self.write_atomic(&self.remote_meta(key), || format_remote_meta(record))
            .await
    }

    pub async fn read_remote_chunk(&self, key: &ChunkKey) -> Result<Vec<u8>, StoreError> {
        let path = self.remote_payload(key);
        fs::read(&path).await.map_err(io_err("read", &path))
    }

    pub async fn remove_remote_chunk(&self, key: &ChunkKey) -> Result<(), StoreError> {
        remove_file(&self.remote_payload(key)).await?;
        remove_file(&self.remote_meta(key)).await
    }

    pub async fn remove_remote_file(&self, file_id: &FileId) -> Result<(), StoreError> {
        remove_dir(&self.remote_dir(file_id)).await
    }

    /// Write a restored file under `restored/`, named after the path's last component.
    pub async fn write_restored(&self, name: &str, data: &[u8]) -> Result<PathBuf, StoreError> {
        let base = Path::new(name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from(name));
        let path = self.root.join(RESTORED_DIR).join(base);
        self.write_atomic(&path, || data).await?;
        Ok(path)
    }

    /// Write one record atomically. `render` runs while this writer holds the record's
    /// turn, after every earlier writer of the same path has renamed its copy.
    async fn write_atomic<B: AsRef<[u8]>>(
        &self,
        path: &Path,
        render: impl FnOnce() -> B,
    ) -> Result<(), StoreError> {
        let turn = Arc::clone(self.writing.entry(path.to_path_buf()).or_default().value());
        let result = {
            let _held = turn.lock().await;
            write_renamed(path, render().as_ref()).await
        };
        drop(turn);
        self.writing
            .remove_if(path, |_, turn| Arc::strong_count(turn) == 1);
        result
    }

    // --- startup ---

    /// Rebuild node state from disk. Malformed entries are skipped with a warning.
    pub async fn load(&self, chunk_size: u64) -> Result<NodeState, StoreError> {
        let state = NodeState::new();
        self.load_local(&state, chunk_size).await?;
        self.load_remote(&state).await?;
        tracing::info!(
            "loaded {} owned, {} purging, {} stored chunks ({} bytes)",
            state.local_files().len(),
            state.purging_ids().len(),
            state.remote_chunks().len(),
            state.current_size()
        );
        Ok(state)
    }

    async fn load_local(&self, state: &NodeState, chunk_size: u64) -> Result<(), StoreError> {
        for (file_id, dir) in list_file_dirs(&self.root.join(LOCAL_DIR)).await? {
            match read_local_file(file_id, &dir, chunk_size).await {
                Ok((file, purging)) => {
                    if purging {
                        state.insert_purging(Arc::new(file));
                    } else {
                        state.insert_local(Arc::new(file));
                    }
                }
                Err(e) => tracing::warn!("skipping owned file: {}", e),
            }
        }
        Ok(())
    }

    async fn load_remote(&self, state: &NodeState) -> Result<(), StoreError> {
        for (file_id, dir) in list_file_dirs(&self.root.join(REMOTE_DIR)).await? {
            let mut entries = fs::read_dir(&dir).await.map_err(io_err("list", &dir))?;
            while let Some(entry) = entries.next_entry().await.map_err(io_err("list", &dir))? {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(stem) = name.strip_suffix(META_SUFFIX) else {
                    continue;
                };
                match read_remote_chunk_meta(stem, &path).await {
                    Ok(record) => state.insert_loaded_remote(file_id, record),
                    Err(e) => tracing::warn!("skipping stored chunk: {}", e),
                }
            }
        }
        Ok(())
    }
}

async fn read_local_file(
    file_id: FileId,
    dir: &Path,
    chunk_size: u64,
) -> Result<(LocalFile, bool), StoreError> {
    let record_path = dir.join(FILE_RECORD);
    let text = fs::read_to_string(&record_path)
        .await
        .map_err(io_err("read", &record_path))?;
    let (name, desired, size) = parse_file_record(&text).ok_or_else(|| StoreError::Malformed {
        path: record_path.clone(),
        reason: "expected name;desired;size".into(),
    })?;

    let mut chunks = Vec::new();
    let mut purging = false;
    let mut entries = fs::read_dir(dir).await.map_err(io_err("list", dir))?;
    while let Some(entry) = entries.next_entry().await.map_err(io_err("list", dir))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == FILE_RECORD || name.ends_with(TMP_SUFFIX) {
            continue;
        }
        if name == PURGE_MARKER {
            purging = true;
            continue;
        }
        let path = entry.path();
        let Ok(chunk_no) = name.parse::<u32>() else {
            tracing::warn!("skipping unexpected file {}", path.display());
            continue;
        };
        let parsed = match fs::read_to_string(&path).await {
            Ok(text) => parse_local_chunk(chunk_no, &text),
            Err(e) => {
                tracing::warn!("skipping {}: {}", path.display(), e);
                continue;
            }
        };
        match parsed {
            Some(record) => chunks.push(record),
            None => tracing::warn!("skipping malformed chunk record {}", path.display()),
        }
    }
    let total = chunk::chunk_count(size, chunk_size);
    Ok((
        LocalFile::from_records(file_id, name, size, desired, total, chunks),
        purging,
    ))
}

async fn read_remote_chunk_meta(stem: &str, meta_path: &Path) -> Result<ChunkRecord, StoreError> {
    let malformed = |reason: &str| StoreError::Malformed {
        path: meta_path.to_path_buf(),
        reason: reason.to_string(),
    };
    let chunk_no: u32 = stem.parse().map_err(|_| malformed("chunk number"))?;
    let text = fs::read_to_string(meta_path)
        .await
        .map_err(io_err("read", meta_path))?;
    let record = parse_remote_meta(chunk_no, &text)
        .ok_or_else(|| malformed("expected observed;desired;size;peers"))?;
    let payload = meta_path.with_file_name(stem);
    if fs::metadata(&payload).await.is_err() {
        return Err(malformed("payload missing"));
    }
    Ok(record)
}

/// Subdirectories whose names are valid file ids. Others are skipped with a warning.
async fn list_file_dirs(parent: &Path) -> Result<Vec<(FileId, PathBuf)>, StoreError> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(parent).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(io_err("list", parent)(e)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(io_err("list", parent))? {
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        match entry.file_name().to_string_lossy().parse::<FileId>() {
            Ok(file_id) => out.push((file_id, path)),
            Err(_) => tracing::warn!("skipping {}: not a file id", path.display()),
        }
    }
    Ok(out)
}

async fn write_renamed(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(io_err("create", parent))?;
    }
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(format!(".{}{}", TMP_SEQ.fetch_add(1, Ordering::Relaxed), TMP_SUFFIX));
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).await.map_err(io_err("write", &tmp))?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(io_err("rename", path)(e));
    }
    Ok(())
}

async fn remove_file(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_err("remove", path)(e)),
        _ => Ok(()),
    }
}

async fn remove_dir(path: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_err("remove", path)(e)),
        _ => Ok(()),
    }
}

// --- record formats ---

fn format_peers(peers: &[NodeId]) -> String {
    peers
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_peers(raw: &str) -> Option<Vec<NodeId>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(Vec::new());
    }
    raw.split(',').map(|p| p.trim().parse().ok()).collect()
}

fn format_file_record(file: &LocalFile) -> String {
    format!("{};{};{}", file.name, file.desired, file.size)
}

/// `name;desired;size`. The name may itself contain `;`.
fn parse_file_record(text: &str) -> Option<(String, u32, u64)> {
    let mut fields = text.trim_end_matches(['\r', '\n']).rsplitn(3, ';');
    let size = fields.next()?.trim().parse().ok()?;
    let desired = fields.next()?.trim().parse().ok()?;
    let name = fields.next()?;
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), desired, size))
}

fn format_local_chunk(record: &ChunkRecord) -> String {
    format!(
        "{};{};{}",
        record.desired,
        record.size,
        format_peers(&record.peers())
    )
}

fn parse_local_chunk(chunk_no: u32, text: &str) -> Option<ChunkRecord> {
    let fields: Vec<&str> = text.trim().split(';').collect();
    if fields.len() != 3 {
        return None;
    }
    let desired = fields[0].trim().parse().ok()?;
    let size = fields[1].trim().parse().ok()?;
    let peers = parse_peers(fields[2])?;
    Some(ChunkRecord::with_peers(chunk_no, desired, size, peers))
}

fn format_remote_meta(record: &ChunkRecord) -> String {
    format!(
        "{};{};{};{}",
        record.observed(),
        record.desired,
        record.size,
        format_peers(&record.peers())
    )
}

/// `observed;desired;size;peers`, or the older `observed;desired;size` without a peer
/// list. The observed count is informational; the peer list is authoritative.
fn parse_remote_meta(chunk_no: u32, text: &str) -> Option<ChunkRecord> {
    let fields: Vec<&str> = text.trim().split(';').collect();
    if fields.len() != 3 && fields.len() != 4 {
        return None;
    }
    let _observed: u32 = fields[0].trim().parse().ok()?;
    let desired = fields[1].trim().parse().ok()?;
    let size = fields[2].trim().parse().ok()?;
    let peers = match fields.get(3) {
        Some(raw) => parse_peers(raw)?,
        None => Vec::new(),
    };
    Some(ChunkRecord::with_peers(chunk_no, desired, size, peers))
}
