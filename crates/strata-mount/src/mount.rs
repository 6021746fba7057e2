//! Per-mount staged-mutation state.
//!
//! A [`Mount`] observes the head tree through a family of caches,
//! records mutations in a [`TreeDiff`], and folds them into new commits.
//! Head state and the current diff live behind one read-write lock;
//! the opened-file table has its own lock; each cache sits behind a
//! mutex of its own. The context is explicit: every entry point takes
//! `&self`, nothing is process-global.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use tempfile::TempDir;
use tracing::{debug, info};

use strata_store::{ObjectHash, ObjectInfo, ObjectKind};

use crate::diff::{DiffKind, TreeDiff, TreeDiffEntry};
use crate::error::{MountError, Result};
use crate::repo::{ObjectSink, Repository};
use crate::tree::{Commit, LargeBlob, Tree, TreeEntry, TreeEntryKind};

const TREE_CACHE_CAPACITY: usize = 64;
const LB_CACHE_CAPACITY: usize = 32;
const OBJ_INFO_CACHE_CAPACITY: usize = 256;
const TE_CACHE_CAPACITY: usize = 256;
const ETE_CACHE_CAPACITY: usize = 256;
const NLINK_CACHE_CAPACITY: usize = 256;

/// The head-tree entry for a path merged with the latest staged diff
/// entry for it.
#[derive(Debug, Clone, Default)]
pub struct ExtendedTreeEntry {
    pub te: TreeEntry,
    pub tde: Option<TreeDiffEntry>,
    /// A staged payload file shadows the committed contents
    pub changed_data: bool,
}

/// Staging area for payloads and freshly built objects, destroyed with
/// the commit that consumes it (unless files are still open).
pub struct StagingDir {
    dir: TempDir,
}

impl StagingDir {
    pub fn new(dir: TempDir) -> StagingDir {
        StagingDir { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Where a staged payload named by a diff entry lives.
    pub fn payload_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl ObjectSink for StagingDir {
    fn put_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectHash> {
        let hash = ObjectHash::compute(payload);
        let ext = match kind {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::LargeBlob => "lblob",
            ObjectKind::Purged => "purged",
        };
        let path = self.dir.path().join(format!("{}.{}", hash.to_hex(), ext));
        if !path.exists() {
            std::fs::write(&path, payload)?;
        }
        Ok(hash)
    }
}

/// Open-file table guarded by its own lock (`lock_tempfiles`).
#[derive(Default)]
struct OpenFiles {
    counts: HashMap<String, u32>,
}

impl OpenFiles {
    fn open(&mut self, path: &str) {
        *self.counts.entry(path.to_string()).or_insert(0) += 1;
    }

    fn release(&mut self, path: &str) {
        if let Some(count) = self.counts.get_mut(path) {
            *count = count.saturating_sub(1);
        }
    }

    fn any_open(&self) -> bool {
        self.counts.values().any(|&c| c > 0)
    }

    fn remove_unused(&mut self) {
        self.counts.retain(|_, &mut c| c > 0);
    }
}

struct MountHead {
    head: Option<Commit>,
    head_hash: ObjectHash,
    head_tree: Tree,
    diff: Option<TreeDiff>,
    staging: Option<StagingDir>,
}

/// Per-mount context: repository handle, head state, staged diff, and
/// the cache family.
pub struct Mount {
    repo: Arc<dyn Repository>,
    state: RwLock<MountHead>,
    open_files: RwLock<OpenFiles>,
    tree_cache: Mutex<LruCache<ObjectHash, Tree>>,
    lb_cache: Mutex<LruCache<ObjectHash, Arc<LargeBlob>>>,
    obj_info_cache: Mutex<LruCache<ObjectHash, ObjectInfo>>,
    te_cache: Mutex<LruCache<String, TreeEntry>>,
    ete_cache: Mutex<LruCache<String, ExtendedTreeEntry>>,
    nlink_cache: Mutex<LruCache<String, u32>>,
}

fn cache<K: std::hash::Hash + Eq, V>(capacity: usize) -> Mutex<LruCache<K, V>> {
    Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap()))
}

impl Mount {
    /// Open a mount view over `repo`, loading the current head.
    pub fn new(repo: Arc<dyn Repository>) -> Result<Mount> {
        let mount = Mount {
            repo,
            state: RwLock::new(MountHead {
                head: None,
                head_hash: ObjectHash::EMPTY,
                head_tree: Tree::new(),
                diff: None,
                staging: None,
            }),
            open_files: RwLock::new(OpenFiles::default()),
            tree_cache: cache(TREE_CACHE_CAPACITY),
            lb_cache: cache(LB_CACHE_CAPACITY),
            obj_info_cache: cache(OBJ_INFO_CACHE_CAPACITY),
            te_cache: cache(TE_CACHE_CAPACITY),
            ete_cache: cache(ETE_CACHE_CAPACITY),
            nlink_cache: cache(NLINK_CACHE_CAPACITY),
        };

        {
            let mut st = mount.state.write().unwrap();
            mount.reset_head_locked(&mut st, None)?;
        }
        Ok(mount)
    }

    pub fn head_hash(&self) -> ObjectHash {
        self.state.read().unwrap().head_hash
    }

    pub fn has_pending_changes(&self) -> bool {
        self.state
            .read()
            .unwrap()
            .diff
            .as_ref()
            .map(|d| !d.is_empty())
            .unwrap_or(false)
    }

    /// Reload head commit and head tree from the repository. `None`
    /// means "whatever the repository head currently is".
    pub fn reset_head(&self, chash: Option<ObjectHash>) -> Result<()> {
        let mut st = self.state.write().unwrap();
        self.reset_head_locked(&mut st, chash)
    }

    fn reset_head_locked(&self, st: &mut MountHead, chash: Option<ObjectHash>) -> Result<()> {
        let head_hash = match chash {
            Some(h) => h,
            None => self.repo.get_head()?,
        };

        if head_hash.is_empty() {
            st.head = None;
            st.head_hash = ObjectHash::EMPTY;
            st.head_tree = Tree::new();
            return Ok(());
        }

        let commit = self.repo.get_commit(&head_hash)?;
        st.head_tree = if commit.tree.is_empty() {
            Tree::new()
        } else {
            Tree::from_payload(&self.repo.get_payload(&commit.tree)?)?
        };
        st.head = Some(commit);
        st.head_hash = head_hash;
        Ok(())
    }

    // ========== Cache-through object reads ==========

    pub fn get_tree(&self, hash: &ObjectHash) -> Result<Tree> {
        if let Some(tree) = self.tree_cache.lock().unwrap().get(hash) {
            return Ok(tree.clone());
        }
        let tree = Tree::from_payload(&self.repo.get_payload(hash)?)?;
        self.tree_cache.lock().unwrap().put(*hash, tree.clone());
        Ok(tree)
    }

    pub fn get_large_blob(&self, hash: &ObjectHash) -> Result<Arc<LargeBlob>> {
        if let Some(lb) = self.lb_cache.lock().unwrap().get(hash) {
            return Ok(Arc::clone(lb));
        }
        let lb = Arc::new(LargeBlob::from_payload(&self.repo.get_payload(hash)?)?);
        self.lb_cache.lock().unwrap().put(*hash, Arc::clone(&lb));
        Ok(lb)
    }

    pub fn get_object_info(&self, hash: &ObjectHash) -> Result<ObjectInfo> {
        if let Some(info) = self.obj_info_cache.lock().unwrap().get(hash) {
            return Ok(*info);
        }
        let info = self.repo.get_object_info(hash)?;
        self.obj_info_cache.lock().unwrap().put(*hash, info);
        Ok(info)
    }

    // ========== Path resolution ==========

    /// Head-tree entry for `path`, ignoring the staged diff.
    pub fn get_tree_entry(&self, path: &str) -> Result<Option<TreeEntry>> {
        let st = self.state.read().unwrap();
        self.tree_entry_locked(&st, path)
    }

    fn tree_entry_locked(&self, st: &MountHead, path: &str) -> Result<Option<TreeEntry>> {
        if let Some(te) = self.te_cache.lock().unwrap().get(path) {
            return Ok(Some(te.clone()));
        }

        if st.head_tree.entries.is_empty() {
            return Ok(None);
        }

        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return Ok(None);
        }

        let mut current: Option<Tree> = None;
        let mut found = TreeEntry::default();
        for (i, comp) in components.iter().enumerate() {
            let tree = current.as_ref().unwrap_or(&st.head_tree);
            let entry = match tree.entries.get(*comp) {
                Some(e) => e.clone(),
                None => return Ok(None),
            };

            if i + 1 < components.len() {
                if !entry.is_tree() {
                    // Path continues past a leaf
                    return Ok(None);
                }
                current = Some(if entry.hash.is_empty() {
                    Tree::new()
                } else {
                    self.get_tree(&entry.hash)?
                });
            }
            found = entry;
        }

        self.te_cache
            .lock()
            .unwrap()
            .put(path.to_string(), found.clone());
        Ok(Some(found))
    }

    /// Resolve `path` against the head tree merged with the staged diff.
    ///
    /// `Ok(None)` means not found (including paths shadowed by a staged
    /// deletion).
    pub fn get_ete(&self, path: &str) -> Result<Option<ExtendedTreeEntry>> {
        if let Some(ete) = self.ete_cache.lock().unwrap().get(path) {
            return Ok(Some(ete.clone()));
        }

        let st = self.state.read().unwrap();
        self.ete_locked(&st, path)
    }

    fn ete_locked(&self, st: &MountHead, path: &str) -> Result<Option<ExtendedTreeEntry>> {
        let te = self.tree_entry_locked(st, path)?;
        let tde = st
            .diff
            .as_ref()
            .and_then(|d| d.latest_entry(path))
            .cloned();

        if te.is_none() && tde.is_none() {
            return Ok(None);
        }
        if let Some(tde) = &tde {
            if tde.is_delete() {
                return Ok(None);
            }
            if tde.kind == DiffKind::Renamed {
                return Err(MountError::NotImplemented("renamed diff entries"));
            }
        }

        let mut ete = ExtendedTreeEntry {
            te: te.unwrap_or_default(),
            tde: None,
            changed_data: false,
        };
        if let Some(tde) = tde {
            if tde.new_filename.is_some() {
                ete.changed_data = true;
            }
            if tde.kind == DiffKind::NewDir {
                ete.te.kind = TreeEntryKind::Tree;
            }
            ete.te.attrs.merge_from(&tde.new_attrs);
            ete.tde = Some(tde);
        }

        if !ete.te.attrs.has_basic() {
            return Err(MountError::MissingAttrs(path.to_string()));
        }

        self.ete_cache
            .lock()
            .unwrap()
            .put(path.to_string(), ete.clone());
        Ok(Some(ete))
    }

    /// Link count for a directory: 2 plus its surviving subdirectories,
    /// including staged ones.
    pub fn compute_nlink(&self, path: &str) -> Result<u32> {
        if let Some(&n) = self.nlink_cache.lock().unwrap().get(path) {
            return Ok(n);
        }

        let st = self.state.read().unwrap();
        let tree = if path == "/" {
            st.head_tree.clone()
        } else {
            let ete = self
                .ete_locked(&st, path)?
                .ok_or_else(|| MountError::NotFound(path.to_string()))?;
            if !ete.te.is_tree() {
                return Err(MountError::NotDirectory(path.to_string()));
            }
            if ete.te.hash.is_empty() {
                Tree::new()
            } else {
                self.get_tree(&ete.te.hash)?
            }
        };

        let ext_path = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        let mut total: u32 = 2;
        for (name, entry) in &tree.entries {
            let full = format!("{}{}", ext_path, name);
            if let Some(diff) = &st.diff {
                if diff.latest_entry(&full).map(|e| e.is_delete()).unwrap_or(false) {
                    continue;
                }
            }
            if entry.is_tree() {
                total += 1;
            }
        }

        // Staged directories directly under this path.
        if let Some(diff) = &st.diff {
            for entry in diff.latest_entries() {
                if entry.kind != DiffKind::NewDir {
                    continue;
                }
                let Some(name) = entry.filepath.strip_prefix(&ext_path) else {
                    continue;
                };
                if name.is_empty() || name.contains('/') || tree.entries.contains_key(name) {
                    continue;
                }
                total += 1;
            }
        }

        self.nlink_cache
            .lock()
            .unwrap()
            .put(path.to_string(), total);
        Ok(total)
    }

    // ========== Staged mutation ==========

    /// Lazily create the current diff and staging directory.
    pub fn start_write(&self) -> Result<()> {
        let mut st = self.state.write().unwrap();
        if st.diff.is_none() {
            st.diff = Some(TreeDiff::new());
        }
        if st.staging.is_none() {
            st.staging = Some(StagingDir::new(self.repo.new_temp_dir()?));
        }
        Ok(())
    }

    /// Write a payload file into the staging area; the returned path
    /// goes into a diff entry's `new_filename`.
    pub fn stage_payload(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        let st = self.state.read().unwrap();
        let staging = st.staging.as_ref().ok_or(MountError::NoWriteInProgress)?;
        let path = staging.payload_path(name);
        std::fs::write(&path, data)?;
        Ok(path)
    }

    /// Merge a staged mutation, invalidating the affected cache
    /// entries. When the merge grows a layer, the pending diff is
    /// committed immediately; returns whether that happened.
    pub fn merge_and_commit(&self, entry: TreeDiffEntry) -> Result<bool> {
        let mut st = self.state.write().unwrap();
        if st.diff.is_none() || st.staging.is_none() {
            return Err(MountError::NoWriteInProgress);
        }

        {
            let mut nlink = self.nlink_cache.lock().unwrap();
            nlink.pop(&entry.filepath);
            if let Some(parent) = parent_path(&entry.filepath) {
                nlink.pop(parent);
            }
        }
        self.ete_cache.lock().unwrap().pop(&entry.filepath);

        let grew = st.diff.as_mut().unwrap().merge(entry);
        if grew {
            info!("staged diff grew a layer, committing");
            self.fuse_commit_locked(&mut st)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Fold the staged diff into a new commit and reset head to it.
    /// Returns the new commit hash, or `None` when nothing is staged.
    pub fn fuse_commit(&self) -> Result<Option<ObjectHash>> {
        let mut st = self.state.write().unwrap();
        self.fuse_commit_locked(&mut st)
    }

    fn fuse_commit_locked(&self, st: &mut MountHead) -> Result<Option<ObjectHash>> {
        if st.diff.is_none() {
            debug!("nothing to commit");
            return Ok(None);
        }
        if st.staging.is_none() {
            return Err(MountError::NoWriteInProgress);
        }

        let flat = st.head_tree.flatten(&mut |h| self.get_tree(h))?;
        let diff = st.diff.take().unwrap();
        let staging = st.staging.as_mut().unwrap();

        let (_new_tree, tree_hash) = diff.apply_to(flat, staging)?;

        let parents = if st.head_hash.is_empty() {
            Vec::new()
        } else {
            vec![st.head_hash]
        };
        let commit = Commit::new(tree_hash, parents, "Commit from FUSE.");
        let commit_hash =
            self.repo
                .commit_from_objects(&tree_hash, staging.path(), commit, "fuse")?;

        info!(commit = %commit_hash, "committed staged changes");
        self.reset_head_locked(st, Some(commit_hash))?;
        debug_assert!(self.repo.has_object(&commit_hash).unwrap_or(false));

        let mut files = self.open_files.write().unwrap();
        if !files.any_open() {
            st.staging = None;
        }
        files.remove_unused();
        drop(files);

        self.ete_cache.lock().unwrap().clear();
        self.te_cache.lock().unwrap().clear();

        Ok(Some(commit_hash))
    }

    /// Commit staged changes, sync the repository, and mark the head
    /// permanent by stamping `("status", "normal")` metadata and moving
    /// the repository head pointer.
    pub fn commit_perm(&self) -> Result<Option<ObjectHash>> {
        let mut st = self.state.write().unwrap();
        self.fuse_commit_locked(&mut st)?;

        self.repo.sync()?;

        let has_tree = st
            .head
            .as_ref()
            .map(|c| !c.tree.is_empty())
            .unwrap_or(false);
        if !has_tree {
            debug!("nothing to commit permanently");
            return Ok(None);
        }

        let head_hash = st.head_hash;
        info!(commit = %head_hash, "making commit permanent");
        {
            let mut md = self.repo.metadata().lock().unwrap();
            let mut tr = md.begin();
            tr.set_meta(head_hash, "status", "normal");
            tr.commit()?;
        }
        self.repo.update_head(&head_hash)?;

        Ok(Some(head_hash))
    }

    // ========== Opened-file tracking ==========

    pub fn file_opened(&self, path: &str) {
        self.open_files.write().unwrap().open(path);
    }

    pub fn file_released(&self, path: &str) {
        self.open_files.write().unwrap().release(path);
    }
}

fn parent_path(path: &str) -> Option<&str> {
    let ix = path.rfind('/')?;
    if ix == 0 {
        if path.len() > 1 {
            Some("/")
        } else {
            None
        }
    } else {
        Some(&path[..ix])
    }
}
