//! Pending filesystem mutations against a head tree.
//!
//! A [`TreeDiff`] is an ordered entry list plus an auxiliary map from
//! path to the latest entry for that path. Merging folds a new entry
//! into the latest one for the same path; the handful of combinations
//! that cannot be represented in one layer (a deleted file shadowed by
//! a new directory, and friends) report *grow-layer* and the caller
//! must commit before continuing.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use strata_store::{ObjectHash, ObjectKind};

use crate::error::Result;
use crate::repo::ObjectSink;
use crate::tree::{Attrs, FlatTree, Tree, TreeEntry, TreeEntryKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffKind {
    /// Placeholder left behind when entries cancel out
    #[default]
    Noop,
    NewFile,
    NewDir,
    DeletedFile,
    DeletedDir,
    Modified,
    Renamed,
}

/// One staged mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeDiffEntry {
    pub kind: DiffKind,
    /// Repo-absolute path with leading `/`
    pub filepath: String,
    /// Staged payload file holding the new contents, if any
    pub new_filename: Option<PathBuf>,
    /// Textual delta, carried for tooling; not consulted when applying
    pub diff: Option<Vec<u8>>,
    /// New content hash when the payload already lives in the store
    pub new_hash: Option<ObjectHash>,
    pub new_attrs: Attrs,
}

impl TreeDiffEntry {
    pub fn new(kind: DiffKind, filepath: &str) -> TreeDiffEntry {
        TreeDiffEntry {
            kind,
            filepath: filepath.to_string(),
            ..Default::default()
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, DiffKind::DeletedFile | DiffKind::DeletedDir)
    }
}

/// Ordered sequence of staged mutations with per-path latest tracking.
#[derive(Debug, Default)]
pub struct TreeDiff {
    entries: Vec<TreeDiffEntry>,
    latest: HashMap<String, usize>,
}

impl TreeDiff {
    pub fn new() -> TreeDiff {
        TreeDiff::default()
    }

    pub fn entries(&self) -> &[TreeDiffEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Push an entry without merge folding. Callers should prefer
    /// [`merge`](TreeDiff::merge).
    pub fn append(&mut self, entry: TreeDiffEntry) {
        self.latest.insert(entry.filepath.clone(), self.entries.len());
        self.entries.push(entry);
    }

    /// Latest non-Noop entry for `path`.
    pub fn latest_entry(&self, path: &str) -> Option<&TreeDiffEntry> {
        let &ix = self.latest.get(path)?;
        let entry = &self.entries[ix];
        if entry.kind == DiffKind::Noop {
            return None;
        }
        Some(entry)
    }

    /// Latest non-Noop entries across all touched paths.
    pub fn latest_entries(&self) -> impl Iterator<Item = &TreeDiffEntry> {
        self.latest
            .values()
            .map(|&ix| &self.entries[ix])
            .filter(|e| e.kind != DiffKind::Noop)
    }

    /// Fold `new_entry` into the latest entry for the same path.
    ///
    /// Returns `true` when the combination grows a layer (the entry is
    /// still recorded) and the caller must commit before continuing.
    pub fn merge(&mut self, new_entry: TreeDiffEntry) -> bool {
        use DiffKind::*;

        debug_assert!(
            new_entry.filepath.starts_with('/'),
            "diff paths are repo-absolute"
        );

        if new_entry.kind == Noop {
            return false;
        }

        let ix = match self.latest.get(&new_entry.filepath) {
            Some(&ix) if self.entries[ix].kind != Noop => ix,
            _ => {
                self.append(new_entry);
                return false;
            }
        };

        match (self.entries[ix].kind, new_entry.kind) {
            // Recreating or touching something this diff created.
            (NewFile, NewFile) => {
                self.replace_payload(ix, new_entry);
                false
            }
            (NewFile, Modified) | (Modified, NewFile) | (Modified, Modified) => {
                self.fold_payload(ix, new_entry);
                false
            }
            (NewDir, NewDir) => {
                self.entries[ix] = new_entry;
                false
            }

            // Creations cancelled by deletion before ever committing.
            (NewFile, DeletedFile) | (NewFile, DeletedDir) | (NewDir, DeletedFile)
            | (NewDir, DeletedDir) => {
                self.collapse(ix);
                false
            }

            // A modified entry deleted afterwards is just a deletion.
            (Modified, DeletedFile) | (Modified, DeletedDir) => {
                self.entries[ix] = new_entry;
                false
            }

            // Deleting twice is idempotent.
            (DeletedFile, DeletedFile) | (DeletedFile, DeletedDir)
            | (DeletedDir, DeletedFile) | (DeletedDir, DeletedDir) => false,

            // A file deleted and recreated as a file collapses to the
            // recreation.
            (DeletedFile, NewFile) => {
                self.entries[ix] = new_entry;
                false
            }

            // Type flips at one path cannot live in a single layer.
            (NewFile, NewDir) | (NewDir, NewFile) | (DeletedFile, NewDir)
            | (DeletedDir, NewFile) | (DeletedDir, NewDir) => {
                debug!(path = %new_entry.filepath, "diff grew a layer");
                self.append(new_entry);
                true
            }

            (latest, new) => {
                debug_assert!(false, "unsupported diff merge {:?} + {:?}", latest, new);
                self.append(new_entry);
                false
            }
        }
    }

    /// Replace the payload of the entry at `ix`, keeping its kind.
    fn replace_payload(&mut self, ix: usize, new_entry: TreeDiffEntry) {
        let entry = &mut self.entries[ix];
        entry.new_filename = new_entry.new_filename;
        entry.new_hash = new_entry.new_hash;
        entry.diff = new_entry.diff;
        entry.new_attrs.merge_from(&new_entry.new_attrs);
    }

    /// Fold set payload fields of `new_entry` into the entry at `ix`.
    fn fold_payload(&mut self, ix: usize, new_entry: TreeDiffEntry) {
        let entry = &mut self.entries[ix];
        if new_entry.new_filename.is_some() {
            entry.new_filename = new_entry.new_filename;
        }
        if new_entry.new_hash.is_some() {
            entry.new_hash = new_entry.new_hash;
        }
        if new_entry.diff.is_some() {
            entry.diff = new_entry.diff;
        }
        entry.new_attrs.merge_from(&new_entry.new_attrs);
    }

    fn collapse(&mut self, ix: usize) {
        let path = self.entries[ix].filepath.clone();
        let entry = &mut self.entries[ix];
        entry.kind = DiffKind::Noop;
        entry.new_filename = None;
        entry.new_hash = None;
        entry.diff = None;
        self.latest.remove(&path);
    }

    /// Minimal entry list turning `t1` into `t2`.
    pub fn diff_trees(t1: &FlatTree, t2: &FlatTree) -> TreeDiff {
        let mut diff = TreeDiff::new();

        for (path, e1) in t1 {
            match t2.get(path) {
                None => diff.append(deletion_of(path, e1)),
                Some(e2) => {
                    if e1.is_tree() != e2.is_tree() {
                        diff.append(deletion_of(path, e1));
                        diff.append(creation_of(path, e2));
                    } else if !e1.is_tree() && e1.hash != e2.hash {
                        let mut entry = TreeDiffEntry::new(DiffKind::Modified, path);
                        entry.new_hash = Some(e2.hash);
                        entry.new_attrs = e2.attrs.clone();
                        diff.append(entry);
                    }
                }
            }
        }

        for (path, e2) in t2 {
            if !t1.contains_key(path) {
                diff.append(creation_of(path, e2));
            }
        }

        diff
    }

    /// Apply the staged entries to a flattened head tree and synthesize
    /// the new tree, writing fresh objects through `sink`.
    ///
    /// Deletions settle first, additions next, modifications last, so
    /// type changes at one path resolve deterministically.
    pub fn apply_to(&self, mut flat: FlatTree, sink: &mut dyn ObjectSink) -> Result<(Tree, ObjectHash)> {
        for entry in &self.entries {
            match entry.kind {
                DiffKind::DeletedFile => {
                    flat.remove(&entry.filepath);
                }
                DiffKind::DeletedDir => {
                    flat.remove(&entry.filepath);
                    let prefix = format!("{}/", entry.filepath);
                    flat.retain(|path, _| !path.starts_with(&prefix));
                }
                _ => {}
            }
        }

        for entry in &self.entries {
            match entry.kind {
                DiffKind::NewFile => {
                    let te = file_entry_for(entry, sink)?;
                    flat.insert(entry.filepath.clone(), te);
                }
                DiffKind::NewDir => {
                    let mut attrs = entry.new_attrs.clone();
                    if attrs.size.is_none() {
                        attrs.size = Some(0);
                    }
                    flat.insert(
                        entry.filepath.clone(),
                        TreeEntry {
                            kind: TreeEntryKind::Tree,
                            hash: ObjectHash::EMPTY,
                            attrs,
                        },
                    );
                }
                _ => {}
            }
        }

        for entry in &self.entries {
            if entry.kind != DiffKind::Modified {
                continue;
            }
            match flat.get_mut(&entry.filepath) {
                Some(te) => {
                    if entry.new_filename.is_some() || entry.new_hash.is_some() {
                        let fresh = file_entry_for(entry, sink)?;
                        te.hash = fresh.hash;
                        te.attrs.size = fresh.attrs.size;
                    }
                    te.attrs.merge_from(&entry.new_attrs);
                }
                None => {
                    debug_assert!(false, "modified entry for absent path {}", entry.filepath);
                    let te = file_entry_for(entry, sink)?;
                    flat.insert(entry.filepath.clone(), te);
                }
            }
        }

        build_tree(&flat, "", sink)
    }
}

fn deletion_of(path: &str, entry: &TreeEntry) -> TreeDiffEntry {
    let kind = if entry.is_tree() {
        DiffKind::DeletedDir
    } else {
        DiffKind::DeletedFile
    };
    TreeDiffEntry::new(kind, path)
}

fn creation_of(path: &str, entry: &TreeEntry) -> TreeDiffEntry {
    let mut out = if entry.is_tree() {
        TreeDiffEntry::new(DiffKind::NewDir, path)
    } else {
        let mut e = TreeDiffEntry::new(DiffKind::NewFile, path);
        e.new_hash = Some(entry.hash);
        e
    };
    out.new_attrs = entry.attrs.clone();
    out
}

fn file_entry_for(entry: &TreeDiffEntry, sink: &mut dyn ObjectSink) -> Result<TreeEntry> {
    let (hash, size) = if let Some(path) = &entry.new_filename {
        let data = std::fs::read(path)?;
        let size = data.len() as u64;
        (sink.put_object(ObjectKind::Blob, &data)?, size)
    } else if let Some(hash) = entry.new_hash {
        (hash, entry.new_attrs.size.unwrap_or(0))
    } else {
        (sink.put_object(ObjectKind::Blob, b"")?, 0)
    };

    let mut attrs = entry.new_attrs.clone();
    attrs.size = Some(size);
    Ok(TreeEntry {
        kind: TreeEntryKind::File,
        hash,
        attrs,
    })
}

/// Rebuild the nested tree from a flat view, hashing subtrees bottom-up
/// and writing each tree object through `sink`.
fn build_tree(flat: &FlatTree, prefix: &str, sink: &mut dyn ObjectSink) -> Result<(Tree, ObjectHash)> {
    let start = format!("{}/", prefix);
    let mut tree = Tree::new();

    for (path, entry) in flat.range(start.clone()..) {
        if !path.starts_with(&start) {
            break;
        }
        let name = &path[start.len()..];
        if name.is_empty() || name.contains('/') {
            continue;
        }

        let mut entry = entry.clone();
        if entry.is_tree() {
            let (_, sub_hash) = build_tree(flat, path, sink)?;
            entry.hash = sub_hash;
        }
        tree.entries.insert(name.to_string(), entry);
    }

    let payload = tree.to_payload()?;
    let hash = sink.put_object(ObjectKind::Tree, &payload)?;
    Ok((tree, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    /// Sink collecting objects in memory.
    #[derive(Default)]
    struct MemSink {
        objects: StdHashMap<ObjectHash, (ObjectKind, Vec<u8>)>,
    }

    impl ObjectSink for MemSink {
        fn put_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectHash> {
            let hash = ObjectHash::compute(payload);
            self.objects.insert(hash, (kind, payload.to_vec()));
            Ok(hash)
        }
    }

    fn file_te(data: &[u8]) -> TreeEntry {
        TreeEntry {
            kind: TreeEntryKind::File,
            hash: ObjectHash::compute(data),
            attrs: Attrs::basic(0o644, data.len() as u64, 1),
        }
    }

    fn dir_te() -> TreeEntry {
        TreeEntry {
            kind: TreeEntryKind::Tree,
            hash: ObjectHash::EMPTY,
            attrs: Attrs::basic(0o755, 0, 1),
        }
    }

    fn new_file(path: &str, data: &[u8]) -> TreeDiffEntry {
        let mut e = TreeDiffEntry::new(DiffKind::NewFile, path);
        e.new_hash = Some(ObjectHash::compute(data));
        e.new_attrs = Attrs::basic(0o644, data.len() as u64, 1);
        e
    }

    #[test]
    fn test_append_tracks_latest() {
        let mut diff = TreeDiff::new();
        diff.append(new_file("/a", b"one"));
        diff.append(new_file("/b", b"two"));
        diff.append(TreeDiffEntry::new(DiffKind::Modified, "/a"));

        assert_eq!(diff.len(), 3);
        assert_eq!(diff.latest_entry("/a").unwrap().kind, DiffKind::Modified);
        assert_eq!(diff.latest_entry("/b").unwrap().kind, DiffKind::NewFile);
        assert!(diff.latest_entry("/c").is_none());
    }

    #[test]
    fn test_merge_new_file_then_delete_collapses() {
        let mut diff = TreeDiff::new();
        assert!(!diff.merge(new_file("/a", b"data")));
        assert!(!diff.merge(TreeDiffEntry::new(DiffKind::DeletedFile, "/a")));

        // Collapsed entries are invisible.
        assert!(diff.latest_entry("/a").is_none());
        assert_eq!(diff.latest_entries().count(), 0);
    }

    #[test]
    fn test_merge_deleted_file_then_new_dir_grows_layer() {
        let mut diff = TreeDiff::new();
        assert!(!diff.merge(TreeDiffEntry::new(DiffKind::DeletedFile, "/a")));
        assert!(diff.merge(TreeDiffEntry::new(DiffKind::NewDir, "/a")));

        // Both entries are recorded for the commit that must follow.
        assert_eq!(diff.len(), 2);
        assert_eq!(diff.latest_entry("/a").unwrap().kind, DiffKind::NewDir);
    }

    #[test]
    fn test_merge_deleted_dir_then_new_file_grows_layer() {
        let mut diff = TreeDiff::new();
        assert!(!diff.merge(TreeDiffEntry::new(DiffKind::DeletedDir, "/d")));
        assert!(diff.merge(new_file("/d", b"now a file")));
    }

    #[test]
    fn test_merge_delete_is_idempotent() {
        let mut diff = TreeDiff::new();
        assert!(!diff.merge(TreeDiffEntry::new(DiffKind::DeletedFile, "/a")));
        assert!(!diff.merge(TreeDiffEntry::new(DiffKind::DeletedFile, "/a")));
        assert_eq!(diff.len(), 1);
    }

    #[test]
    fn test_merge_modified_folds_into_new_file() {
        let mut diff = TreeDiff::new();
        diff.merge(new_file("/a", b"v1"));

        let mut modified = TreeDiffEntry::new(DiffKind::Modified, "/a");
        modified.new_hash = Some(ObjectHash::compute(b"v2"));
        modified.new_attrs.size = Some(2);
        assert!(!diff.merge(modified));

        let latest = diff.latest_entry("/a").unwrap();
        assert_eq!(latest.kind, DiffKind::NewFile);
        assert_eq!(latest.new_hash, Some(ObjectHash::compute(b"v2")));
        assert_eq!(diff.len(), 1);
    }

    #[test]
    fn test_merge_delete_then_recreate_file_collapses() {
        let mut diff = TreeDiff::new();
        diff.merge(TreeDiffEntry::new(DiffKind::DeletedFile, "/a"));
        assert!(!diff.merge(new_file("/a", b"reborn")));
        assert_eq!(diff.latest_entry("/a").unwrap().kind, DiffKind::NewFile);
    }

    #[test]
    fn test_merge_modified_then_delete_becomes_delete() {
        let mut diff = TreeDiff::new();
        diff.merge(TreeDiffEntry::new(DiffKind::Modified, "/a"));
        assert!(!diff.merge(TreeDiffEntry::new(DiffKind::DeletedFile, "/a")));
        assert_eq!(diff.latest_entry("/a").unwrap().kind, DiffKind::DeletedFile);
    }

    #[test]
    fn test_aux_map_points_at_latest_entry() {
        let mut diff = TreeDiff::new();
        diff.merge(new_file("/x", b"1"));
        diff.merge(TreeDiffEntry::new(DiffKind::DeletedFile, "/y"));
        diff.merge(new_file("/x", b"2"));

        for entry in diff.latest_entries() {
            let by_path = diff.latest_entry(&entry.filepath).unwrap();
            assert_eq!(by_path.filepath, entry.filepath);
        }
    }

    #[test]
    fn test_diff_trees_classifies_changes() {
        let mut t1 = FlatTree::new();
        t1.insert("/keep".into(), file_te(b"same"));
        t1.insert("/gone".into(), file_te(b"old"));
        t1.insert("/changed".into(), file_te(b"v1"));
        t1.insert("/dir".into(), dir_te());

        let mut t2 = FlatTree::new();
        t2.insert("/keep".into(), file_te(b"same"));
        t2.insert("/changed".into(), file_te(b"v2"));
        t2.insert("/fresh".into(), file_te(b"new"));
        t2.insert("/dir".into(), dir_te());

        let diff = TreeDiff::diff_trees(&t1, &t2);

        let kind_of = |p: &str| diff.latest_entry(p).map(|e| e.kind);
        assert_eq!(kind_of("/gone"), Some(DiffKind::DeletedFile));
        assert_eq!(kind_of("/changed"), Some(DiffKind::Modified));
        assert_eq!(kind_of("/fresh"), Some(DiffKind::NewFile));
        assert_eq!(kind_of("/keep"), None);
        assert_eq!(kind_of("/dir"), None);
    }

    #[test]
    fn test_diff_trees_type_change_is_delete_plus_create() {
        let mut t1 = FlatTree::new();
        t1.insert("/p".into(), file_te(b"file"));
        let mut t2 = FlatTree::new();
        t2.insert("/p".into(), dir_te());

        let diff = TreeDiff::diff_trees(&t1, &t2);
        let kinds: Vec<DiffKind> = diff.entries().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![DiffKind::DeletedFile, DiffKind::NewDir]);
    }

    #[test]
    fn test_apply_to_settles_deletions_before_additions() {
        let mut flat = FlatTree::new();
        flat.insert("/a".into(), file_te(b"old"));
        flat.insert("/sub".into(), dir_te());
        flat.insert("/sub/child".into(), file_te(b"child"));

        let mut diff = TreeDiff::new();
        diff.merge(TreeDiffEntry::new(DiffKind::DeletedDir, "/sub"));
        diff.merge(TreeDiffEntry::new(DiffKind::DeletedFile, "/a"));
        diff.merge(new_file("/a", b"fresh")); // recreate over delete

        let mut sink = MemSink::default();
        let (tree, hash) = diff.apply_to(flat, &mut sink).unwrap();

        assert!(!hash.is_empty());
        assert_eq!(tree.entries.len(), 1);
        assert!(tree.entries.contains_key("a"));
        // The root tree object itself landed in the sink.
        assert!(sink.objects.contains_key(&hash));
    }

    #[test]
    fn test_apply_to_hashes_subtrees_bottom_up() {
        let flat = FlatTree::new();

        let mut diff = TreeDiff::new();
        let mut mkdir = TreeDiffEntry::new(DiffKind::NewDir, "/d");
        mkdir.new_attrs = Attrs::basic(0o755, 0, 1);
        diff.merge(mkdir);
        diff.merge(new_file("/d/inner", b"payload"));

        let mut sink = MemSink::default();
        let (tree, _) = diff.apply_to(flat, &mut sink).unwrap();

        let d = tree.entries.get("d").unwrap();
        assert!(d.is_tree());
        assert!(!d.hash.is_empty());

        let (kind, payload) = &sink.objects[&d.hash];
        assert_eq!(*kind, ObjectKind::Tree);
        let sub = Tree::from_payload(payload).unwrap();
        assert!(sub.entries.contains_key("inner"));
    }

    #[test]
    fn test_apply_to_stages_payload_files() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged");
        std::fs::write(&staged, b"staged contents").unwrap();

        let mut entry = TreeDiffEntry::new(DiffKind::NewFile, "/f");
        entry.new_filename = Some(staged);
        entry.new_attrs = Attrs::basic(0o644, 0, 1);

        let mut diff = TreeDiff::new();
        diff.merge(entry);

        let mut sink = MemSink::default();
        let (tree, _) = diff.apply_to(FlatTree::new(), &mut sink).unwrap();

        let f = tree.entries.get("f").unwrap();
        assert_eq!(f.hash, ObjectHash::compute(b"staged contents"));
        assert_eq!(f.attrs.size, Some(15));
        assert_eq!(
            sink.objects[&f.hash].1,
            b"staged contents".to_vec()
        );
    }
}
