//! Object index interface.
//!
//! The index maps an object hash to the pack and byte range holding its
//! payload. The engine only requires consistency after each pack commit;
//! durable index storage belongs to the repository layer.

use std::collections::HashMap;

use crate::object::{ObjectHash, ObjectInfo, PackId};

/// Location of one object's payload on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub info: ObjectInfo,
    /// Absolute byte offset of the payload (not the header) in its pack
    pub offset: u32,
    /// On-disk size, possibly compressed
    pub packed_size: u32,
    pub packid: PackId,
}

/// Consumed by the pack layer; upserts must be idempotent.
pub trait Index {
    fn update_entry(&mut self, hash: ObjectHash, entry: IndexEntry);
    fn lookup(&self, hash: &ObjectHash) -> Option<IndexEntry>;
}

/// In-memory index, used by tests and small deployments.
#[derive(Debug, Default)]
pub struct MemIndex {
    entries: HashMap<ObjectHash, IndexEntry>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectHash, &IndexEntry)> {
        self.entries.iter()
    }
}

impl Index for MemIndex {
    fn update_entry(&mut self, hash: ObjectHash, entry: IndexEntry) {
        self.entries.insert(hash, entry);
    }

    fn lookup(&self, hash: &ObjectHash) -> Option<IndexEntry> {
        self.entries.get(hash).copied()
    }
}
