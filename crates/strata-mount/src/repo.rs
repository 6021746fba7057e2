//! Collaborator interfaces consumed by the staged-mutation core.
//!
//! The repository owns durable object storage (packs + index + refcount
//! log); the mount layer only drives it through this seam.

use std::path::Path;
use std::sync::Mutex;

use tempfile::TempDir;

use strata_store::{MetadataLog, ObjectHash, ObjectInfo, ObjectKind};

use crate::error::Result;
use crate::tree::Commit;

/// Somewhere new objects can be written during diff application.
///
/// The staging directory implements this; so does the in-memory test
/// repository. `put_object` is idempotent per hash.
pub trait ObjectSink {
    fn put_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectHash>;
}

/// The higher-level repository the mount collaborates with.
pub trait Repository: Send + Sync {
    /// Current head commit hash; empty when the repository has none.
    fn get_head(&self) -> Result<ObjectHash>;

    fn get_commit(&self, hash: &ObjectHash) -> Result<Commit>;

    fn get_payload(&self, hash: &ObjectHash) -> Result<Vec<u8>>;

    fn get_object_info(&self, hash: &ObjectHash) -> Result<ObjectInfo>;

    fn has_object(&self, hash: &ObjectHash) -> Result<bool>;

    /// Move the repository head pointer.
    fn update_head(&self, hash: &ObjectHash) -> Result<()>;

    /// Assemble a commit from the staged objects in `staging`, persist
    /// everything through a temp pack, and return the commit hash.
    fn commit_from_objects(
        &self,
        tree: &ObjectHash,
        staging: &Path,
        commit: Commit,
        author: &str,
    ) -> Result<ObjectHash>;

    /// The repository's refcount/metadata log.
    fn metadata(&self) -> &Mutex<MetadataLog>;

    /// A fresh staging directory under the repository's tmp area.
    fn new_temp_dir(&self) -> Result<TempDir>;

    /// Flush pending repository state to disk.
    fn sync(&self) -> Result<()>;
}
