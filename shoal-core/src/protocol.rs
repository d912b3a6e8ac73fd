//! Shoal wire protocol: message types, versions, and the channel each type travels on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::{FileId, NodeId};

/// Protocol version. Selects the delete variant and whether AWAKE is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Version {
    /// Immediate delete: owner removes its metadata right away.
    #[serde(rename = "1.0")]
    V1_0,
    /// Deferred delete: owner keeps a purge marker and announces restarts with AWAKE.
    #[serde(rename = "1.1")]
    V1_1,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V1_0 => "1.0",
            Version::V1_1 => "1.1",
        }
    }

    /// Whether Delete keeps a purge marker instead of removing metadata immediately.
    pub fn defers_purge(&self) -> bool {
        matches!(self, Version::V1_1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Version {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(Version::V1_0),
            "1.1" => Ok(Version::V1_1),
            _ => Err(()),
        }
    }
}

/// All message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Offer a chunk for storage. Carries the payload.
    Putchunk,
    /// Ack: sender now holds the chunk.
    Stored,
    /// Request a chunk's content.
    Getchunk,
    /// Reply with a chunk's content. Carries the payload.
    Chunk,
    /// Remove every chunk of a file.
    Delete,
    /// Ack: sender evicted the chunk.
    Removed,
    /// Sender (re)started; owners re-announce pending deletes.
    Awake,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Putchunk => "PUTCHUNK",
            MessageType::Stored => "STORED",
            MessageType::Getchunk => "GETCHUNK",
            MessageType::Chunk => "CHUNK",
            MessageType::Delete => "DELETE",
            MessageType::Removed => "REMOVED",
            MessageType::Awake => "AWAKE",
        }
    }

    /// Number of header fields (version and type included).
    pub fn field_count(&self) -> usize {
        match self {
            MessageType::Putchunk => 6,
            MessageType::Stored
            | MessageType::Getchunk
            | MessageType::Chunk
            | MessageType::Removed => 5,
            MessageType::Delete => 4,
            MessageType::Awake => 3,
        }
    }

    pub fn has_body(&self) -> bool {
        matches!(self, MessageType::Putchunk | MessageType::Chunk)
    }

    /// Channel this message type is sent on.
    pub fn channel(&self) -> Channel {
        match self {
            MessageType::Putchunk => Channel::Backup,
            MessageType::Chunk => Channel::Restore,
            _ => Channel::Control,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUTCHUNK" => Ok(MessageType::Putchunk),
            "STORED" => Ok(MessageType::Stored),
            "GETCHUNK" => Ok(MessageType::Getchunk),
            "CHUNK" => Ok(MessageType::Chunk),
            "DELETE" => Ok(MessageType::Delete),
            "REMOVED" => Ok(MessageType::Removed),
            "AWAKE" => Ok(MessageType::Awake),
            _ => Err(()),
        }
    }
}

/// The three multicast groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// MC: GETCHUNK, STORED, DELETE, REMOVED, AWAKE.
    Control,
    /// MDB: PUTCHUNK.
    Backup,
    /// MDR: CHUNK.
    Restore,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Control => "MC",
            Channel::Backup => "MDB",
            Channel::Restore => "MDR",
        })
    }
}

/// A chunk's identity: file plus chunk number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ChunkKey {
    pub file_id: FileId,
    pub chunk_no: u32,
}

impl ChunkKey {
    pub fn new(file_id: FileId, chunk_no: u32) -> Self {
        Self { file_id, chunk_no }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file_id, self.chunk_no)
    }
}

/// A decoded message. Fields a type does not carry are `None`/empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: Version,
    pub kind: MessageType,
    pub sender: NodeId,
    pub file_id: Option<FileId>,
    pub chunk_no: Option<u32>,
    pub replication_degree: Option<u32>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn putchunk(
        version: Version,
        sender: NodeId,
        key: ChunkKey,
        replication_degree: u32,
        body: Vec<u8>,
    ) -> Self {
        Self {
            version,
            kind: MessageType::Putchunk,
            sender,
            file_id: Some(key.file_id),
            chunk_no: Some(key.chunk_no),
            replication_degree: Some(replication_degree),
            body,
        }
    }

    pub fn stored(version: Version, sender: NodeId, key: ChunkKey) -> Self {
        Self::chunk_ack(version, MessageType::Stored, sender, key)
    }

    pub fn getchunk(version: Version, sender: NodeId, key: ChunkKey) -> Self {
        Self::chunk_ack(version, MessageType::Getchunk, sender, key)
    }

    pub fn removed(version: Version, sender: NodeId, key: ChunkKey) -> Self {
        Self::chunk_ack(version, MessageType::Removed, sender, key)
    }

    pub fn chunk(version: Version, sender: NodeId, key: ChunkKey, body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::chunk_ack(version, MessageType::Chunk, sender, key)
        }
    }

    pub fn delete(version: Version, sender: NodeId, file_id: FileId) -> Self {
        Self {
            version,
            kind: MessageType::Delete,
            sender,
            file_id: Some(file_id),
            chunk_no: None,
            replication_degree: None,
            body: Vec::new(),
        }
    }

    pub fn awake(version: Version, sender: NodeId) -> Self {
        Self {
            version,
            kind: MessageType::Awake,
            sender,
            file_id: None,
            chunk_no: None,
            replication_degree: None,
            body: Vec::new(),
        }
    }

    fn chunk_ack(version: Version, kind: MessageType, sender: NodeId, key: ChunkKey) -> Self {
        Self {
            version,
            kind,
            sender,
            file_id: Some(key.file_id),
            chunk_no: Some(key.chunk_no),
            replication_degree: None,
            body: Vec::new(),
        }
    }

    /// Chunk key, for types that address a single chunk.
    pub fn chunk_key(&self) -> Option<ChunkKey> {
        Some(ChunkKey::new(self.file_id?, self.chunk_no?))
    }

    pub fn channel(&self) -> Channel {
        self.kind.channel()
    }
}
