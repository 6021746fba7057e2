//! Append-only pack containers.
//!
//! A pack holds a bounded set of content-addressed objects. Writers stage
//! payloads in a [`PackTransaction`] and commit them as one group: a
//! header block followed by the payloads in header order. Reads go
//! through the collaborating index straight to a payload byte range.
//!
//! Purging rewrites the pack into a `<name>.tmp` sibling and renames it
//! over the original only after the survivors are durable, so an
//! interrupted purge leaves the original pack untouched.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use flate2::bufread::ZlibEncoder;
use flate2::Compression;
use tracing::{debug, error, warn};

use strata_config::{CompressionConfig, PackConfig};

use crate::error::{Result, StoreError};
use crate::index::{Index, IndexEntry};
use crate::object::{ObjectHash, ObjectInfo, ObjectKind, PackId, INFO_SIZE};
use crate::stream::{PayloadReader, SectionReader, StreamReadExt, StreamWriteExt};

/// Per-object header width inside a group: info + packed size + offset.
pub const ENTRY_SIZE: usize = INFO_SIZE + 4 + 4;

/// One append-only pack container on disk.
pub struct Packfile {
    file: File,
    path: PathBuf,
    packid: PackId,
    num_objects: u32,
    file_size: u64,
    limits: PackConfig,
    compression: CompressionConfig,
}

impl Packfile {
    /// Open or create the pack at `path`.
    ///
    /// Existing files are not rescanned; the collaborating index is
    /// authoritative for locating payloads, and `num_objects` counts the
    /// objects added during this session.
    pub fn open(
        path: &Path,
        packid: PackId,
        limits: PackConfig,
        compression: CompressionConfig,
    ) -> Result<Packfile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file_size = file.metadata()?.len();

        Ok(Packfile {
            file,
            path: path.to_path_buf(),
            packid,
            num_objects: 0,
            file_size,
            limits,
            compression,
        })
    }

    pub fn packid(&self) -> PackId {
        self.packid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    pub fn full(&self) -> bool {
        self.num_objects >= self.limits.max_objects || self.file_size >= self.limits.max_size
    }

    /// Start a staging batch bound to an index.
    pub fn begin<'a>(&'a mut self, index: &'a mut dyn Index) -> PackTransaction<'a> {
        PackTransaction {
            pack: self,
            index,
            infos: Vec::new(),
            payloads: Vec::new(),
            hash_to_ix: HashMap::new(),
            total_size: 0,
            committed: false,
        }
    }

    /// Byte stream over one stored payload.
    pub fn get_payload(&self, entry: &IndexEntry) -> Result<PayloadReader<'_>> {
        assert_eq!(
            entry.packid, self.packid,
            "index entry for pack {} handed to pack {}",
            entry.packid, self.packid
        );

        let stored = SectionReader::new(&self.file, entry.offset as u64, entry.packed_size as u64);
        if entry.info.is_compressed() {
            Ok(PayloadReader::Compressed {
                decoder: flate2::read::ZlibDecoder::new(stored),
                payload_size: entry.info.payload_size,
            })
        } else {
            Ok(PayloadReader::Raw(stored))
        }
    }

    /// Rewrite the pack, dropping every object whose hash is in `hset`.
    ///
    /// Streams the pack group-by-group, staging survivors into a sibling
    /// `<name>.tmp` file; once the survivors are durable, the temp file
    /// is renamed over the original and this handle adopts it. Purged
    /// hashes get `Purged` tombstones in the index.
    ///
    /// Returns `true` iff the pack is empty afterwards. An empty `hset`
    /// still rewrites and renames.
    pub fn purge(&mut self, hset: &HashSet<ObjectHash>, index: &mut dyn Index) -> Result<bool> {
        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut tmp = Packfile::open(
            &tmp_path,
            self.packid,
            self.limits.clone(),
            self.compression.clone(),
        )?;
        // A stale temp file from an interrupted purge is discarded.
        tmp.file.set_len(0)?;
        tmp.file_size = 0;

        let mut purged: Vec<ObjectHash> = Vec::new();
        let mut reader = BufReader::new(SectionReader::new(&self.file, 0, self.file_size));

        while let Some(num) = reader.read_u32_or_eof()? {
            let mut headers: Vec<(ObjectInfo, u32, bool)> = Vec::with_capacity(num as usize);
            for _ in 0..num {
                let info = reader.read_info().map_err(mid_group)?;
                let packed_size = reader.read_u32_le().map_err(mid_group_io)?;
                let _offset = reader.read_u32_le().map_err(mid_group_io)?;

                let skip = hset.contains(&info.hash);
                if skip {
                    purged.push(info.hash);
                }
                headers.push((info, packed_size, skip));
            }

            let mut tx = tmp.begin(index);
            for (info, packed_size, skip) in headers {
                let mut payload = vec![0u8; packed_size as usize];
                reader.read_exact(&mut payload).map_err(mid_group_io)?;
                if skip {
                    continue;
                }
                tx.add_stored(info, payload);
            }
            tx.commit()?;
        }

        tmp.file.sync_data()?;
        std::fs::rename(&tmp_path, &self.path)?;

        debug!(
            pack = self.packid,
            purged = purged.len(),
            kept = tmp.num_objects,
            "purged pack"
        );

        for hash in purged {
            index.update_entry(
                hash,
                IndexEntry {
                    info: ObjectInfo::new(hash, ObjectKind::Purged, 0),
                    offset: 0,
                    packed_size: 0,
                    packid: self.packid,
                },
            );
        }

        let Packfile {
            file,
            file_size,
            num_objects,
            ..
        } = tmp;
        self.file = file;
        self.file_size = file_size;
        self.num_objects = num_objects;

        Ok(self.num_objects == 0)
    }

    /// Serialize a bulk export of `objects` for replication.
    ///
    /// Writes the object-info table, then the raw stored bytes with
    /// adjacent ranges coalesced. Zero-sized objects appear in the table
    /// but occupy no range.
    pub fn transmit<W: Write>(&self, writer: &mut W, objects: &[IndexEntry]) -> Result<()> {
        let mut objects = objects.to_vec();
        objects.sort_by_key(|e| e.offset);

        // Coalesce adjacent byte ranges: offset → end of run.
        let mut blocks: BTreeMap<u32, u32> = BTreeMap::new();
        for entry in &objects {
            if entry.packed_size == 0 {
                continue;
            }
            let mut start = entry.offset;
            let mut end = entry.offset + entry.packed_size;

            if let Some((&prev_start, &prev_end)) = blocks.range(..=start).next_back() {
                if prev_end == start {
                    start = prev_start;
                }
            }
            blocks.insert(start, end);
            while let Some(&next_end) = blocks.get(&end) {
                blocks.remove(&end);
                end = next_end;
                blocks.insert(start, end);
            }
        }

        debug!(
            pack = self.packid,
            objects = objects.len(),
            blocks = blocks.len(),
            "transmitting objects"
        );

        writer.write_u32_le(objects.len() as u32)?;
        for entry in &objects {
            writer.write_info(&entry.info)?;
            writer.write_u32_le(entry.packed_size)?;
        }

        let mut buf = Vec::new();
        for (&start, &end) in &blocks {
            debug_assert!(end >= start);
            buf.resize((end - start) as usize, 0);
            self.file.read_exact_at(&mut buf, start as u64)?;
            writer.write_all(&buf)?;
        }

        Ok(())
    }

    /// Append a bulk export into this pack, updating the index.
    ///
    /// Returns `Ok(false)` iff the export holds no objects.
    pub fn receive<R: Read>(&mut self, reader: &mut R, index: &mut dyn Index) -> Result<bool> {
        let num = reader.read_u32_le()?;
        if num == 0 {
            return Ok(false);
        }

        self.file.seek(SeekFrom::End(0))?;
        let headers_size = num as usize * ENTRY_SIZE;
        let mut off = self.file_size + 4 + headers_size as u64;

        let mut headers = Vec::with_capacity(4 + headers_size);
        headers.write_u32_le(num)?;
        let mut entries = Vec::with_capacity(num as usize);
        for _ in 0..num {
            let info = reader.read_info()?;
            let packed_size = reader.read_u32_le()?;

            headers.write_info(&info)?;
            headers.write_u32_le(packed_size)?;
            headers.write_u32_le(off as u32)?;

            entries.push(IndexEntry {
                info,
                offset: off as u32,
                packed_size,
                packid: self.packid,
            });
            off += packed_size as u64;
        }

        self.file.write_all(&headers)?;
        self.file_size += headers.len() as u64;

        let mut data = Vec::new();
        for entry in &entries {
            data.resize(entry.packed_size as usize, 0);
            reader.read_exact(&mut data)?;
            self.file.write_all(&data)?;
            self.file_size += entry.packed_size as u64;
            self.num_objects += 1;
        }
        self.file.sync_data()?;

        for entry in entries {
            index.update_entry(entry.info.hash, entry);
        }

        Ok(true)
    }
}

fn mid_group(e: StoreError) -> StoreError {
    match e {
        StoreError::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            StoreError::CorruptPack("pack ends mid-group".into())
        }
        other => other,
    }
}

fn mid_group_io(e: std::io::Error) -> StoreError {
    mid_group(StoreError::Io(e))
}

/// A staging batch of payloads bound to one pack and index.
///
/// Prefer explicit [`commit`](PackTransaction::commit); dropping a
/// non-empty uncommitted transaction commits it implicitly and can only
/// log a failure.
pub struct PackTransaction<'a> {
    pack: &'a mut Packfile,
    index: &'a mut dyn Index,
    infos: Vec<ObjectInfo>,
    payloads: Vec<Vec<u8>>,
    hash_to_ix: HashMap<ObjectHash, usize>,
    total_size: u64,
    committed: bool,
}

impl<'a> PackTransaction<'a> {
    /// Stage one payload, compressing it when the admission test passes.
    ///
    /// The admission test compresses a prefix of the payload and accepts
    /// compression only when the sampled ratio clears the configured
    /// threshold; the sampled prefix is reused, not recompressed.
    pub fn add_payload(&mut self, mut info: ObjectInfo, payload: &[u8]) -> Result<()> {
        if self.hash_to_ix.contains_key(&info.hash) {
            warn!(hash = %info.hash, "duplicate payload staged in pack transaction");
        }

        let comp = &self.pack.compression;
        let mut stored: Option<Vec<u8>> = None;
        if comp.enabled && payload.len() as u64 > comp.min_size {
            let mut encoder = ZlibEncoder::new(payload, Compression::default());
            let mut probe = vec![0u8; comp.check_bytes];
            let n = read_up_to(&mut encoder, &mut probe)?;
            let consumed = encoder.total_in();

            if consumed > 0 {
                let ratio = n as f32 / consumed as f32;
                debug!(hash = %info.hash, ratio, "compression admission");
                if ratio <= comp.check_ratio {
                    probe.truncate(n);
                    let mut compressed = probe;
                    encoder.read_to_end(&mut compressed)?;
                    info.set_compressed();
                    stored = Some(compressed);
                }
            }
        }

        let stored = stored.unwrap_or_else(|| payload.to_vec());
        self.add_stored(info, stored);
        Ok(())
    }

    /// Stage bytes already in stored form (possibly compressed), keeping
    /// the info flags as-is. Used by purge when re-staging survivors.
    pub(crate) fn add_stored(&mut self, info: ObjectInfo, stored: Vec<u8>) {
        self.total_size += stored.len() as u64;
        self.hash_to_ix.insert(info.hash, self.infos.len());
        self.infos.push(info);
        self.payloads.push(stored);
    }

    /// Whether `hash` is staged in this batch.
    pub fn has(&self, hash: &ObjectHash) -> bool {
        self.hash_to_ix.contains_key(hash)
    }

    /// Whether the pending batch has reached the pack thresholds.
    pub fn full(&self) -> bool {
        self.infos.len() as u32 >= self.pack.limits.max_objects
            || self.total_size >= self.pack.limits.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Append the staged group to the pack and update the index.
    ///
    /// Headers are written before payloads; the group is synced before
    /// any index entry becomes visible. An empty batch writes nothing.
    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<()> {
        if self.infos.is_empty() {
            self.committed = true;
            return Ok(());
        }
        assert_eq!(
            self.infos.len(),
            self.payloads.len(),
            "staged infos and payloads diverged"
        );

        let pack = &mut *self.pack;
        pack.file.seek(SeekFrom::End(0))?;

        let headers_size = self.infos.len() * ENTRY_SIZE;
        let mut off = pack.file_size + 4 + headers_size as u64;

        let mut headers = Vec::with_capacity(4 + headers_size);
        headers.write_u32_le(self.infos.len() as u32)?;
        let mut offsets = Vec::with_capacity(self.infos.len());
        for (info, payload) in self.infos.iter().zip(&self.payloads) {
            headers.write_info(info)?;
            headers.write_u32_le(payload.len() as u32)?;
            headers.write_u32_le(off as u32)?;

            offsets.push(off);
            off += payload.len() as u64;
        }

        pack.file.write_all(&headers)?;
        pack.file_size += headers.len() as u64;

        for payload in &self.payloads {
            pack.file.write_all(payload)?;
            pack.file_size += payload.len() as u64;
            pack.num_objects += 1;
        }
        pack.file.sync_data()?;

        debug!(
            pack = pack.packid,
            objects = self.infos.len(),
            bytes = pack.file_size,
            "committed pack group"
        );

        for (i, info) in self.infos.iter().enumerate() {
            self.index.update_entry(
                info.hash,
                IndexEntry {
                    info: *info,
                    offset: offsets[i] as u32,
                    packed_size: self.payloads[i].len() as u32,
                    packid: pack.packid,
                },
            );
        }

        self.committed = true;
        Ok(())
    }
}

impl Drop for PackTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.infos.is_empty() {
            if let Err(e) = self.commit_inner() {
                error!(pack = self.pack.packid, error = %e, "implicit pack commit failed");
            }
        }
    }
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
