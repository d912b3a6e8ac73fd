//! Node and file identities: numeric node IDs, hash-derived file IDs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Node ID: configured per node, carried as the sender field of every message.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(NodeId)
    }
}

/// File ID: SHA-256 over the file's identity metadata. Rendered as 64 lowercase hex chars.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FileId([u8; 32]);

impl FileId {
    /// Length of the hex form on the wire and on disk.
    pub const HEX_LEN: usize = 64;

    /// Derive the ID of a file from its path, byte size and modification time.
    /// Same unmodified file gives the same ID across calls and restarts.
    pub fn derive(path: &str, size: u64, modified_millis: u128) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(size.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(modified_millis.to_string().as_bytes());
        FileId(hasher.finalize().into())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self)
    }
}

/// Error parsing a file ID from its hex form.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FileIdError {
    #[error("expected {} hex characters, got {0}", FileId::HEX_LEN)]
    Length(usize),
    #[error("invalid file id: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl FromStr for FileId {
    type Err = FileIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != FileId::HEX_LEN {
            return Err(FileIdError::Length(s.len()));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(FileId(out))
    }
}
