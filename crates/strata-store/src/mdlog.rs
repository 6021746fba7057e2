//! Crash-recoverable refcount log.
//!
//! An append-only journal of transactions. Each entry records the
//! *cumulative* refcount per hash as of that commit, so reopening the
//! log replays entries front to back and the last write per hash wins.
//!
//! ## Entry Format
//!
//! ```text
//! +--------------------+
//! | u32 num            |
//! +--------------------+
//! | num × (hash, u32)  |  cumulative refcounts
//! +--------------------+
//! | u32 meta_num       |  key-value records (0 when none)
//! +--------------------+
//! | meta_num × (hash,  |
//! |   u16 klen, key,   |
//! |   u16 vlen, value) |
//! +--------------------+
//! ```
//!
//! End-of-file immediately after the refcount block is the legacy entry
//! shape and loads cleanly. No commit-hash trailer is ever written.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, error};

use crate::error::{Result, StoreError};
use crate::object::{ObjectHash, HASH_SIZE};
use crate::stream::{StreamReadExt, StreamWriteExt};

pub type Refcount = u32;

/// Bytes per refcount record: hash + u32 count.
const RECORD_SIZE: u64 = HASH_SIZE as u64 + 4;

#[derive(Debug)]
pub struct MetadataLog {
    file: File,
    path: PathBuf,
    refcounts: HashMap<ObjectHash, Refcount>,
    metadata: HashMap<ObjectHash, BTreeMap<String, String>>,
}

impl MetadataLog {
    /// Open the log, replaying every entry into the in-memory maps.
    pub fn open(path: &Path) -> Result<MetadataLog> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let file_size = file.metadata()?.len();

        let mut refcounts = HashMap::new();
        let mut metadata: HashMap<ObjectHash, BTreeMap<String, String>> = HashMap::new();

        let mut raw = file.try_clone()?;
        raw.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(raw);
        let mut read_so_far: u64 = 0;
        loop {
            let num = match reader.read_u32_or_eof()? {
                Some(n) => n,
                None => break,
            };
            read_so_far += 4;

            if num as u64 * RECORD_SIZE + read_so_far > file_size {
                return Err(StoreError::CorruptLog(format!(
                    "entry declares {} records beyond end of file",
                    num
                )));
            }

            for _ in 0..num {
                let hash = reader.read_hash()?;
                let count = reader.read_u32_le()?;
                refcounts.insert(hash, count);
                read_so_far += RECORD_SIZE;
            }

            // EOF here is the legacy shape without a meta block.
            let meta_num = match reader.read_u32_or_eof()? {
                Some(n) => n,
                None => break,
            };
            read_so_far += 4;

            for _ in 0..meta_num {
                let (hash, key, value, len) = read_meta_record(&mut reader)?;
                metadata.entry(hash).or_default().insert(key, value);
                read_so_far += len;
            }
        }

        debug!(
            path = %path.display(),
            refs = refcounts.len(),
            "opened metadata log"
        );

        Ok(MetadataLog {
            file,
            path: path.to_path_buf(),
            refcounts,
            metadata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a transaction holding signed refcount deltas and key-value
    /// records.
    pub fn begin(&mut self) -> MdTransaction<'_> {
        MdTransaction {
            log: self,
            counts: BTreeMap::new(),
            meta: BTreeMap::new(),
            committed: false,
        }
    }

    /// One-shot increment for callers without an open transaction.
    pub fn add_ref(&mut self, hash: ObjectHash) -> Result<()> {
        let mut tr = self.begin();
        tr.add_ref(hash);
        tr.commit()
    }

    /// In-memory count for `hash`; absent means zero.
    pub fn get_ref_count(&self, hash: &ObjectHash) -> Refcount {
        self.refcounts.get(hash).copied().unwrap_or(0)
    }

    /// Key-value metadata recorded against `hash`.
    pub fn meta(&self, hash: &ObjectHash, key: &str) -> Option<&str> {
        self.metadata.get(hash)?.get(key).map(String::as_str)
    }

    pub fn refcounts(&self) -> &HashMap<ObjectHash, Refcount> {
        &self.refcounts
    }

    /// Compact the log to a single entry.
    ///
    /// Truncates the file and seeds one transaction with `refs`
    /// (defaulting to the current in-memory map) plus the current
    /// key-value metadata; committing it recomputes the maps.
    pub fn rewrite(&mut self, refs: Option<&HashMap<ObjectHash, Refcount>>) -> Result<()> {
        let seed: Vec<(ObjectHash, Refcount)> = refs
            .unwrap_or(&self.refcounts)
            .iter()
            .map(|(h, c)| (*h, *c))
            .collect();
        let meta_seed: Vec<(ObjectHash, String, String)> = self
            .metadata
            .iter()
            .flat_map(|(h, kvs)| kvs.iter().map(|(k, v)| (*h, k.clone(), v.clone())))
            .collect();

        self.file.set_len(0)?;
        self.refcounts.clear();
        self.metadata.clear();

        let mut tr = self.begin();
        for (hash, count) in seed {
            tr.adjust(hash, count as i64);
        }
        for (hash, key, value) in meta_seed {
            tr.set_meta(hash, &key, &value);
        }
        tr.commit()
    }
}

fn read_meta_record<R: Read>(reader: &mut R) -> Result<(ObjectHash, String, String, u64)> {
    let torn =
        |_| StoreError::CorruptLog("metadata record overruns end of file".to_string());

    let hash = reader.read_hash().map_err(torn)?;
    let klen = reader.read_u16::<LittleEndian>().map_err(torn)?;
    let mut key = vec![0u8; klen as usize];
    reader.read_exact(&mut key).map_err(torn)?;
    let vlen = reader.read_u16::<LittleEndian>().map_err(torn)?;
    let mut value = vec![0u8; vlen as usize];
    reader.read_exact(&mut value).map_err(torn)?;

    let utf8 = |_| StoreError::CorruptLog("metadata record is not UTF-8".to_string());
    let key = String::from_utf8(key).map_err(utf8)?;
    let value = String::from_utf8(value).map_err(utf8)?;
    let len = HASH_SIZE as u64 + 2 + klen as u64 + 2 + vlen as u64;
    Ok((hash, key, value, len))
}

/// Scoped refcount/metadata transaction.
///
/// Prefer explicit [`commit`](MdTransaction::commit); dropping a
/// non-empty uncommitted transaction commits it implicitly and can only
/// log a failure. An empty transaction writes nothing.
pub struct MdTransaction<'a> {
    log: &'a mut MetadataLog,
    counts: BTreeMap<ObjectHash, i64>,
    meta: BTreeMap<ObjectHash, BTreeMap<String, String>>,
    committed: bool,
}

impl MdTransaction<'_> {
    pub fn add_ref(&mut self, hash: ObjectHash) {
        self.adjust(hash, 1);
    }

    pub fn sub_ref(&mut self, hash: ObjectHash) {
        self.adjust(hash, -1);
    }

    /// Fold a signed delta into the transaction.
    pub fn adjust(&mut self, hash: ObjectHash, delta: i64) {
        *self.counts.entry(hash).or_insert(0) += delta;
    }

    /// Record a key-value pair against `hash`.
    pub fn set_meta(&mut self, hash: ObjectHash, key: &str, value: &str) {
        self.meta
            .entry(hash)
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.meta.is_empty()
    }

    /// Fold the deltas into the log's map and append one entry.
    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<()> {
        if self.is_empty() {
            self.committed = true;
            return Ok(());
        }

        // Resolve every final count before touching the map, so a bad
        // delta leaves the log untouched.
        let mut finals = Vec::with_capacity(self.counts.len());
        for (&hash, &delta) in &self.counts {
            assert!(!hash.is_empty(), "empty hash committed to metadata log");
            let current = self.log.refcounts.get(&hash).copied().unwrap_or(0) as i64;
            let final_count = current + delta;
            if final_count < 0 {
                return Err(StoreError::NegativeRefcount {
                    hash: hash.to_hex(),
                });
            }
            finals.push((hash, final_count as Refcount));
        }

        let mut buf = Vec::new();
        buf.write_u32_le(self.counts.len() as u32)?;
        for &(hash, count) in &finals {
            buf.write_hash(&hash)?;
            buf.write_u32_le(count)?;
            self.log.refcounts.insert(hash, count);
        }

        let meta_records: usize = self.meta.values().map(|kvs| kvs.len()).sum();
        buf.write_u32_le(meta_records as u32)?;
        for (hash, kvs) in &self.meta {
            assert!(!hash.is_empty(), "empty hash committed to metadata log");
            for (key, value) in kvs {
                buf.write_hash(hash)?;
                buf.write_u16::<LittleEndian>(key.len() as u16)?;
                buf.write_all(key.as_bytes())?;
                buf.write_u16::<LittleEndian>(value.len() as u16)?;
                buf.write_all(value.as_bytes())?;
                self.log
                    .metadata
                    .entry(*hash)
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
        }

        debug!(
            refs = finals.len(),
            meta = meta_records,
            "committing metadata entries"
        );
        self.log.file.write_all(&buf)?;

        self.committed = true;
        Ok(())
    }
}

impl Drop for MdTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.is_empty() {
            if let Err(e) = self.commit_inner() {
                error!(error = %e, "implicit metadata commit failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hash(n: u8) -> ObjectHash {
        ObjectHash::compute(&[n])
    }

    fn file_size(log: &MetadataLog) -> u64 {
        std::fs::metadata(log.path()).unwrap().len()
    }

    #[test]
    fn test_refcount_replay_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("md.log");
        let (h1, h2) = (hash(1), hash(2));

        {
            let mut log = MetadataLog::open(&path).unwrap();

            let mut tr = log.begin();
            tr.adjust(h1, 1);
            tr.commit().unwrap();

            let mut tr = log.begin();
            tr.adjust(h1, 2);
            tr.adjust(h2, 1);
            tr.commit().unwrap();

            let mut tr = log.begin();
            tr.adjust(h1, -2);
            tr.commit().unwrap();

            assert_eq!(log.get_ref_count(&h1), 1);
            assert_eq!(log.get_ref_count(&h2), 1);
        }

        let log = MetadataLog::open(&path).unwrap();
        assert_eq!(log.get_ref_count(&h1), 1);
        assert_eq!(log.get_ref_count(&h2), 1);
        assert_eq!(log.get_ref_count(&hash(3)), 0);
    }

    #[test]
    fn test_rewrite_compacts_to_single_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("md.log");
        let (h1, h2) = (hash(1), hash(2));

        let mut log = MetadataLog::open(&path).unwrap();
        for _ in 0..3 {
            let mut tr = log.begin();
            tr.add_ref(h1);
            tr.add_ref(h2);
            tr.commit().unwrap();
        }
        let before = log.refcounts().clone();

        log.rewrite(None).unwrap();

        // One entry: num + two records + empty meta block.
        assert_eq!(file_size(&log), 4 + 2 * RECORD_SIZE + 4);
        assert_eq!(log.refcounts(), &before);

        let reopened = MetadataLog::open(&path).unwrap();
        assert_eq!(reopened.refcounts(), &before);
    }

    #[test]
    fn test_empty_transaction_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("md.log");

        let mut log = MetadataLog::open(&path).unwrap();
        log.begin().commit().unwrap();
        drop(log.begin()); // implicit path as well

        assert_eq!(file_size(&log), 0);
    }

    #[test]
    fn test_transaction_commits_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("md.log");
        let h = hash(9);

        let mut log = MetadataLog::open(&path).unwrap();
        {
            let mut tr = log.begin();
            tr.add_ref(h);
        }
        assert_eq!(log.get_ref_count(&h), 1);
    }

    #[test]
    fn test_negative_refcount_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("md.log");
        let h = hash(1);

        let mut log = MetadataLog::open(&path).unwrap();
        log.add_ref(h).unwrap();

        let mut tr = log.begin();
        tr.adjust(h, -2);
        let err = tr.commit().unwrap_err();
        assert!(matches!(err, StoreError::NegativeRefcount { .. }));

        // The failed commit left the map untouched.
        assert_eq!(log.get_ref_count(&h), 1);
    }

    #[test]
    fn test_metadata_kv_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("md.log");
        let h = hash(4);

        {
            let mut log = MetadataLog::open(&path).unwrap();
            let mut tr = log.begin();
            tr.set_meta(h, "status", "normal");
            tr.commit().unwrap();
            assert_eq!(log.meta(&h, "status"), Some("normal"));
        }

        let log = MetadataLog::open(&path).unwrap();
        assert_eq!(log.meta(&h, "status"), Some("normal"));
        assert_eq!(log.meta(&h, "other"), None);
    }

    #[test]
    fn test_metadata_survives_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("md.log");
        let h = hash(4);

        let mut log = MetadataLog::open(&path).unwrap();
        let mut tr = log.begin();
        tr.add_ref(h);
        tr.set_meta(h, "status", "normal");
        tr.commit().unwrap();

        log.rewrite(None).unwrap();
        assert_eq!(log.meta(&h, "status"), Some("normal"));
        assert_eq!(log.get_ref_count(&h), 1);
    }

    #[test]
    fn test_legacy_entry_without_meta_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("md.log");
        let h = hash(7);

        // Hand-written legacy tail: refcount block only, no meta block.
        let mut buf = Vec::new();
        buf.write_u32_le(1).unwrap();
        buf.write_hash(&h).unwrap();
        buf.write_u32_le(5).unwrap();
        std::fs::write(&path, &buf).unwrap();

        let log = MetadataLog::open(&path).unwrap();
        assert_eq!(log.get_ref_count(&h), 5);
    }

    #[test]
    fn test_torn_tail_entry_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("md.log");

        // Entry claims five records but holds one.
        let mut buf = Vec::new();
        buf.write_u32_le(5).unwrap();
        buf.write_hash(&hash(1)).unwrap();
        buf.write_u32_le(1).unwrap();
        std::fs::write(&path, &buf).unwrap();

        let err = MetadataLog::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::CorruptLog(_)));
    }

    #[test]
    #[should_panic(expected = "empty hash")]
    fn test_empty_hash_commit_panics() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("md.log");

        let mut log = MetadataLog::open(&path).unwrap();
        let mut tr = log.begin();
        tr.add_ref(ObjectHash::EMPTY);
        let _ = tr.commit();
    }
}
