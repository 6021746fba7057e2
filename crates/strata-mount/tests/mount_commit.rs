//! End-to-end staged-mutation tests over the in-memory repository.

use std::sync::Arc;

use strata_mount::testing::MemRepository;
use strata_mount::{
    Attrs, DiffKind, Mount, MountError, Repository, Tree, TreeDiffEntry, TreeEntry, TreeEntryKind,
};
use strata_store::{ObjectHash, ObjectKind};

fn new_mount() -> (Arc<MemRepository>, Mount) {
    let repo = Arc::new(MemRepository::new().unwrap());
    let mount = Mount::new(repo.clone()).unwrap();
    (repo, mount)
}

fn new_file_entry(mount: &Mount, path: &str, name: &str, data: &[u8]) -> TreeDiffEntry {
    let staged = mount.stage_payload(name, data).unwrap();
    let mut entry = TreeDiffEntry::new(DiffKind::NewFile, path);
    entry.new_filename = Some(staged);
    entry.new_attrs = Attrs::basic(0o644, data.len() as u64, 42);
    entry
}

fn dir_entry(path: &str) -> TreeDiffEntry {
    let mut entry = TreeDiffEntry::new(DiffKind::NewDir, path);
    entry.new_attrs = Attrs::basic(0o755, 0, 42);
    entry
}

/// Seed the repository head with one directory `d` and one file `f`.
fn seed_head(repo: &MemRepository) {
    let sub = Tree::new();
    let sub_hash = repo.put_object(ObjectKind::Tree, &sub.to_payload().unwrap());

    let mut root = Tree::new();
    root.entries.insert(
        "d".into(),
        TreeEntry {
            kind: TreeEntryKind::Tree,
            hash: sub_hash,
            attrs: Attrs::basic(0o755, 0, 1),
        },
    );
    root.entries.insert(
        "f".into(),
        TreeEntry {
            kind: TreeEntryKind::File,
            hash: repo.put_object(ObjectKind::Blob, b"seed"),
            attrs: Attrs::basic(0o644, 4, 1),
        },
    );
    repo.commit_tree(&root).unwrap();
}

#[test]
fn test_fresh_repo_resolves_nothing() {
    let (_repo, mount) = new_mount();
    assert!(mount.head_hash().is_empty());
    assert!(mount.get_ete("/nothing").unwrap().is_none());
}

#[test]
fn test_stage_and_commit_new_file() {
    let (repo, mount) = new_mount();
    mount.start_write().unwrap();

    let entry = new_file_entry(&mount, "/hello", "payload-1", b"hello world");
    assert!(!mount.merge_and_commit(entry).unwrap());

    // Before the commit the path resolves through the diff.
    let ete = mount.get_ete("/hello").unwrap().unwrap();
    assert!(ete.changed_data);
    assert_eq!(ete.te.attrs.size, Some(11));

    let commit_hash = mount.fuse_commit().unwrap().unwrap();
    assert_eq!(mount.head_hash(), commit_hash);
    assert!(!mount.has_pending_changes());
    // The head moved for the mount view only; the repository head
    // pointer waits for commit_perm.
    assert!(repo.get_head_hash().is_empty());

    // After the commit the path resolves from the head tree.
    let ete = mount.get_ete("/hello").unwrap().unwrap();
    assert!(!ete.changed_data);
    assert!(ete.tde.is_none());
    assert_eq!(ete.te.hash, ObjectHash::compute(b"hello world"));

    let commit = mount.head_hash();
    assert!(!commit.is_empty());
    assert_eq!(
        mount.get_object_info(&ete.te.hash).unwrap().kind,
        ObjectKind::Blob
    );
}

#[test]
fn test_commit_message_and_parentage() {
    let (repo, mount) = new_mount();
    mount.start_write().unwrap();
    let entry = new_file_entry(&mount, "/a", "p1", b"one");
    mount.merge_and_commit(entry).unwrap();
    let first = mount.fuse_commit().unwrap().unwrap();

    mount.start_write().unwrap();
    let entry = new_file_entry(&mount, "/b", "p2", b"two");
    mount.merge_and_commit(entry).unwrap();
    let second = mount.fuse_commit().unwrap().unwrap();

    let commit = repo.get_commit_obj(&second);
    assert_eq!(commit.message, "Commit from FUSE.");
    assert_eq!(commit.author, "fuse");
    assert_eq!(commit.parents, vec![first]);
}

#[test]
fn test_grow_layer_forces_commit() {
    let (repo, _) = new_mount();
    seed_head(repo.as_ref());
    let mount = Mount::new(repo.clone()).unwrap();
    assert!(mount.get_ete("/f").unwrap().is_some());

    mount.start_write().unwrap();
    assert!(!mount
        .merge_and_commit(TreeDiffEntry::new(DiffKind::DeletedFile, "/f"))
        .unwrap());
    // File deleted, directory created at the same path: the diff cannot
    // hold both shapes, so the mutation commits immediately.
    assert!(mount.merge_and_commit(dir_entry("/f")).unwrap());

    assert!(!mount.has_pending_changes());
    let ete = mount.get_ete("/f").unwrap().unwrap();
    assert!(ete.te.is_tree());
}

#[test]
fn test_staged_deletion_hides_path() {
    let (repo, _) = new_mount();
    seed_head(repo.as_ref());
    let mount = Mount::new(repo.clone()).unwrap();

    assert!(mount.get_ete("/f").unwrap().is_some());

    mount.start_write().unwrap();
    mount
        .merge_and_commit(TreeDiffEntry::new(DiffKind::DeletedFile, "/f"))
        .unwrap();

    assert!(mount.get_ete("/f").unwrap().is_none());

    // The deletion lands in the next commit.
    mount.fuse_commit().unwrap().unwrap();
    assert!(mount.get_ete("/f").unwrap().is_none());
}

#[test]
fn test_nlink_tracks_staged_directories() {
    let (repo, _) = new_mount();
    seed_head(repo.as_ref());
    let mount = Mount::new(repo.clone()).unwrap();

    // Root: itself + one subdirectory.
    assert_eq!(mount.compute_nlink("/").unwrap(), 3);
    assert_eq!(mount.compute_nlink("/d").unwrap(), 2);

    mount.start_write().unwrap();
    mount
        .merge_and_commit(TreeDiffEntry::new(DiffKind::DeletedDir, "/d"))
        .unwrap();
    assert_eq!(mount.compute_nlink("/").unwrap(), 2);

    mount.merge_and_commit(dir_entry("/n")).unwrap();
    assert_eq!(mount.compute_nlink("/").unwrap(), 3);
}

#[test]
fn test_nlink_rejects_files() {
    let (repo, _) = new_mount();
    seed_head(repo.as_ref());
    let mount = Mount::new(repo.clone()).unwrap();

    let err = mount.compute_nlink("/f").unwrap_err();
    assert!(matches!(err, MountError::NotDirectory(_)));
}

#[test]
fn test_renamed_entry_is_not_implemented() {
    let (_repo, mount) = new_mount();
    mount.start_write().unwrap();
    mount
        .merge_and_commit(TreeDiffEntry::new(DiffKind::Renamed, "/r"))
        .unwrap();

    let err = mount.get_ete("/r").unwrap_err();
    assert!(matches!(err, MountError::NotImplemented(_)));
}

#[test]
fn test_missing_basic_attrs_reported() {
    let (_repo, mount) = new_mount();
    mount.start_write().unwrap();
    // NewFile with no attributes at all.
    mount
        .merge_and_commit(TreeDiffEntry::new(DiffKind::NewFile, "/bare"))
        .unwrap();

    let err = mount.get_ete("/bare").unwrap_err();
    assert!(matches!(err, MountError::MissingAttrs(_)));
}

#[test]
fn test_modify_existing_file() {
    let (_repo, mount) = new_mount();
    mount.start_write().unwrap();
    let entry = new_file_entry(&mount, "/doc", "v1", b"version one");
    mount.merge_and_commit(entry).unwrap();
    mount.fuse_commit().unwrap().unwrap();

    mount.start_write().unwrap();
    let staged = mount.stage_payload("v2", b"version two!").unwrap();
    let mut entry = TreeDiffEntry::new(DiffKind::Modified, "/doc");
    entry.new_filename = Some(staged);
    entry.new_attrs.mtime = Some(43);
    mount.merge_and_commit(entry).unwrap();
    mount.fuse_commit().unwrap().unwrap();

    let ete = mount.get_ete("/doc").unwrap().unwrap();
    assert_eq!(ete.te.hash, ObjectHash::compute(b"version two!"));
    assert_eq!(ete.te.attrs.size, Some(12));
    assert_eq!(ete.te.attrs.mtime, Some(43));
}

#[test]
fn test_commit_perm_stamps_status_and_head() {
    let (repo, mount) = new_mount();
    mount.start_write().unwrap();
    let entry = new_file_entry(&mount, "/keep", "k1", b"kept");
    mount.merge_and_commit(entry).unwrap();

    let head = mount.commit_perm().unwrap().unwrap();

    assert_eq!(repo.get_head_hash(), head);
    let md = repo.metadata().lock().unwrap();
    assert_eq!(md.meta(&head, "status"), Some("normal"));
}

#[test]
fn test_commit_perm_with_nothing_staged() {
    let (_repo, mount) = new_mount();
    assert!(mount.commit_perm().unwrap().is_none());
}

#[test]
fn test_open_files_keep_staging_alive() {
    let (_repo, mount) = new_mount();
    mount.start_write().unwrap();
    let entry = new_file_entry(&mount, "/held", "h1", b"held open");
    mount.merge_and_commit(entry).unwrap();

    mount.file_opened("/held");
    mount.fuse_commit().unwrap().unwrap();

    // The staging dir survived the commit; a new payload can be staged
    // without another start_write.
    assert!(mount.stage_payload("h2", b"more").is_ok());

    mount.file_released("/held");
}
