//! Tree, commit, and large-blob object model.
//!
//! These are the decoded forms of the payloads the repository stores.
//! Trees map entry names to [`TreeEntry`] records; a flattened tree maps
//! repo-absolute paths (leading `/`) to the same records, which is the
//! shape the diff layer works against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use strata_store::ObjectHash;

use crate::error::Result;

/// Filesystem attributes carried by a tree entry. Unset fields are
/// inherited when entries merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<u64>,
}

impl Attrs {
    pub fn basic(mode: u32, size: u64, mtime: u64) -> Attrs {
        Attrs {
            mode: Some(mode),
            uid: None,
            gid: None,
            size: Some(size),
            mtime: Some(mtime),
        }
    }

    /// Overlay `other` onto `self`: set fields in `other` win.
    pub fn merge_from(&mut self, other: &Attrs) {
        if other.mode.is_some() {
            self.mode = other.mode;
        }
        if other.uid.is_some() {
            self.uid = other.uid;
        }
        if other.gid.is_some() {
            self.gid = other.gid;
        }
        if other.size.is_some() {
            self.size = other.size;
        }
        if other.mtime.is_some() {
            self.mtime = other.mtime;
        }
    }

    /// Whether the attributes a filesystem view needs are present.
    pub fn has_basic(&self) -> bool {
        self.mode.is_some() && self.size.is_some() && self.mtime.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TreeEntryKind {
    #[default]
    File,
    LargeBlob,
    Tree,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub kind: TreeEntryKind,
    pub hash: ObjectHash,
    pub attrs: Attrs,
}

impl TreeEntry {
    pub fn is_tree(&self) -> bool {
        self.kind == TreeEntryKind::Tree
    }
}

/// One directory level: entry name → entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: BTreeMap<String, TreeEntry>,
}

/// A whole tree expanded to repo-absolute paths with leading `/`.
pub type FlatTree = BTreeMap<String, TreeEntry>;

impl Tree {
    pub fn new() -> Tree {
        Tree::default()
    }

    pub fn from_payload(data: &[u8]) -> Result<Tree> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Expand to a [`FlatTree`], fetching subtrees through `fetch`.
    /// Entries with an empty hash are treated as empty subtrees.
    pub fn flatten<F>(&self, fetch: &mut F) -> Result<FlatTree>
    where
        F: FnMut(&ObjectHash) -> Result<Tree>,
    {
        let mut flat = FlatTree::new();
        self.flatten_into("", fetch, &mut flat)?;
        Ok(flat)
    }

    fn flatten_into<F>(&self, prefix: &str, fetch: &mut F, out: &mut FlatTree) -> Result<()>
    where
        F: FnMut(&ObjectHash) -> Result<Tree>,
    {
        for (name, entry) in &self.entries {
            let path = format!("{}/{}", prefix, name);
            out.insert(path.clone(), entry.clone());
            if entry.is_tree() && !entry.hash.is_empty() {
                let subtree = fetch(&entry.hash)?;
                subtree.flatten_into(&path, fetch, out)?;
            }
        }
        Ok(())
    }
}

/// A commit object: a tree snapshot plus its ancestry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub tree: ObjectHash,
    pub parents: Vec<ObjectHash>,
    pub message: String,
    pub author: String,
    /// Seconds since the Unix epoch
    pub time: u64,
}

impl Commit {
    pub fn new(tree: ObjectHash, parents: Vec<ObjectHash>, message: &str) -> Commit {
        let time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Commit {
            tree,
            parents,
            message: message.to_string(),
            author: String::new(),
            time,
        }
    }

    pub fn from_payload(data: &[u8]) -> Result<Commit> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// A blob too large to store whole: an ordered list of chunk objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LargeBlob {
    pub chunks: Vec<(ObjectHash, u64)>,
}

impl LargeBlob {
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|(_, len)| len).sum()
    }

    pub fn from_payload(data: &[u8]) -> Result<LargeBlob> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}
