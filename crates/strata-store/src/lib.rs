//! # strata-store
//!
//! Storage engine for a content-addressed, versioning filesystem
//! repository. Immutable, hash-identified objects live in append-only
//! pack containers; per-object reference counts live in a recoverable
//! append-only log.
//!
//! ## Pack File Format
//!
//! A pack is a sequence of *groups*, one per committed transaction:
//!
//! ```text
//! +------------------+
//! | u32 num_objects  |
//! +------------------+
//! | num × headers    |  (48-byte info, u32 packed_size, u32 offset)
//! +------------------+
//! | payloads         |  concatenated in header order
//! +------------------+
//! ```
//!
//! All integers little-endian. Offsets are absolute from file start and
//! point at payloads, not headers.

pub mod error;
pub mod index;
pub mod manager;
pub mod mdlog;
pub mod object;
pub mod pack;
pub mod stream;

pub use error::{Result, StoreError};
pub use index::{Index, IndexEntry, MemIndex};
pub use manager::PackfileManager;
pub use mdlog::{MdTransaction, MetadataLog, Refcount};
pub use object::{ObjectHash, ObjectInfo, ObjectKind, PackId, HASH_SIZE, INFO_SIZE};
pub use pack::{PackTransaction, Packfile, ENTRY_SIZE};
