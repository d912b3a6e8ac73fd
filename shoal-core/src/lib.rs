//! Shoal replicated chunk-store protocol.
//! Host-driven: no I/O; host passes messages and operation requests, receives actions.

pub mod identity;
pub mod protocol;
pub mod wire;

pub use identity::{FileId, NodeId};
pub use protocol::{Channel, ChunkKey, Message, MessageType, Version};
pub use wire::{decode, encode, DecodeError};
pub use core::{Action, BackupRefusal, NodeCore, RebackupPlan, RebackupSource};

pub mod chunk;
pub mod replication;
pub mod state;
pub mod scheduler;
pub mod reclaim;
pub mod core;
