//! # strata-mount
//!
//! Staged-mutation layer for a mounted repository view.
//!
//! A live mount accumulates filesystem changes in a [`TreeDiff`] against
//! the head tree, serves lookups through a small family of caches, and
//! atomically folds the diff into a new commit. The heavy lifting of
//! object storage lives in `strata-store`; this crate owns the tree
//! model, the diff semantics, and the per-mount cache coherence.

pub mod diff;
pub mod error;
pub mod mount;
pub mod repo;
pub mod testing;
pub mod tree;

pub use diff::{DiffKind, TreeDiff, TreeDiffEntry};
pub use error::{MountError, Result};
pub use mount::{ExtendedTreeEntry, Mount, StagingDir};
pub use repo::{ObjectSink, Repository};
pub use tree::{Attrs, Commit, FlatTree, LargeBlob, Tree, TreeEntry, TreeEntryKind};
