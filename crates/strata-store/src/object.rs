//! Object identifiers and per-object metadata.
//!
//! Every stored object is named by the BLAKE3 digest of its payload.
//! `ObjectInfo` is the fixed-width record describing an object inside a
//! pack header; `IndexEntry` locates its payload on disk.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Width of an object hash in bytes
pub const HASH_SIZE: usize = 32;

/// Serialized width of an [`ObjectInfo`] record:
/// 32-byte hash + u32 kind + u32 flags + u64 payload size.
pub const INFO_SIZE: usize = HASH_SIZE + 4 + 4 + 8;

/// Numeric identity of a pack container
pub type PackId = u32;

/// Object payload is stored zlib-compressed
pub const FLAG_COMPRESSED: u32 = 1 << 0;

/// Fixed-width content digest identifying an object.
///
/// The all-zero value is distinguished and means "no object".
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ObjectHash(pub [u8; HASH_SIZE]);

impl ObjectHash {
    /// The distinguished empty hash
    pub const EMPTY: ObjectHash = ObjectHash([0u8; HASH_SIZE]);

    /// Compute the content hash of the given bytes.
    pub fn compute(data: &[u8]) -> ObjectHash {
        ObjectHash(*blake3::hash(data).as_bytes())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Hex string representation.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse a hex string into a hash.
    pub fn from_hex(hex: &str) -> Option<ObjectHash> {
        if hex.len() != HASH_SIZE * 2 {
            return None;
        }
        let mut hash = [0u8; HASH_SIZE];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            hash[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(ObjectHash(hash))
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", &self.to_hex()[..8])
    }
}

/// What an object's payload decodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ObjectKind {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    LargeBlob = 4,
    /// Tombstone left behind by purge
    Purged = 5,
}

impl ObjectKind {
    pub fn from_u32(v: u32) -> Result<ObjectKind> {
        match v {
            1 => Ok(ObjectKind::Commit),
            2 => Ok(ObjectKind::Tree),
            3 => Ok(ObjectKind::Blob),
            4 => Ok(ObjectKind::LargeBlob),
            5 => Ok(ObjectKind::Purged),
            other => Err(StoreError::UnknownKind(other)),
        }
    }
}

/// Fixed-width record describing one stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub hash: ObjectHash,
    pub kind: ObjectKind,
    pub flags: u32,
    /// Uncompressed payload size in bytes
    pub payload_size: u64,
}

impl ObjectInfo {
    pub fn new(hash: ObjectHash, kind: ObjectKind, payload_size: u64) -> Self {
        Self {
            hash,
            kind,
            flags: 0,
            payload_size,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn set_compressed(&mut self) {
        self.flags |= FLAG_COMPRESSED;
    }

    /// Serialize to the fixed `INFO_SIZE` wire form (little-endian).
    pub fn to_bytes(&self) -> [u8; INFO_SIZE] {
        let mut buf = [0u8; INFO_SIZE];
        buf[..HASH_SIZE].copy_from_slice(&self.hash.0);
        buf[HASH_SIZE..HASH_SIZE + 4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[HASH_SIZE + 4..HASH_SIZE + 8].copy_from_slice(&self.flags.to_le_bytes());
        buf[HASH_SIZE + 8..].copy_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; INFO_SIZE]) -> Result<ObjectInfo> {
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&buf[..HASH_SIZE]);
        let kind = u32::from_le_bytes(buf[HASH_SIZE..HASH_SIZE + 4].try_into().unwrap());
        let flags = u32::from_le_bytes(buf[HASH_SIZE + 4..HASH_SIZE + 8].try_into().unwrap());
        let payload_size = u64::from_le_bytes(buf[HASH_SIZE + 8..].try_into().unwrap());
        Ok(ObjectInfo {
            hash: ObjectHash(hash),
            kind: ObjectKind::from_u32(kind)?,
            flags,
            payload_size,
        })
    }
}
