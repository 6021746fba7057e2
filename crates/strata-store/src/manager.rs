//! Pack identity allocation and open-pack caching.
//!
//! The manager owns the repository's pack directory: it hands out pack
//! ids from a persisted free list and caches open pack handles. The
//! free list is an ordered sequence of reusable ids whose tail is always
//! the next fresh id, so allocation never collides with an existing
//! pack.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::{debug, warn};

use strata_config::Config;

use crate::error::Result;
use crate::object::PackId;
use crate::pack::Packfile;
use crate::stream::{StreamReadExt, StreamWriteExt};

/// Free-list file name under the repository root
pub const FREELIST_NAME: &str = "pfmgr.freelist";

/// How many pack handles stay open at once
const OPEN_PACK_CACHE: usize = 16;

pub struct PackfileManager {
    root: PathBuf,
    config: Config,
    free_list: VecDeque<PackId>,
    cache: Mutex<LruCache<PackId, Arc<Mutex<Packfile>>>>,
}

impl PackfileManager {
    /// Open the manager for `root`, recovering the free list from the
    /// directory contents if its file is missing or unreadable.
    pub fn open(root: &Path, config: &Config) -> Result<PackfileManager> {
        let mut mgr = PackfileManager {
            root: root.to_path_buf(),
            config: config.clone(),
            free_list: VecDeque::new(),
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(OPEN_PACK_CACHE).unwrap())),
        };

        if !mgr.load_free_list()? {
            mgr.recompute_free_list()?;
            mgr.write_free_list()?;
        }

        Ok(mgr)
    }

    pub fn free_list(&self) -> impl Iterator<Item = PackId> + '_ {
        self.free_list.iter().copied()
    }

    fn pack_path(&self, id: PackId) -> PathBuf {
        self.root.join(format!("pack{}.pak", id))
    }

    fn open_pack(&self, id: PackId) -> Result<Packfile> {
        Packfile::open(
            &self.pack_path(id),
            id,
            self.config.pack.clone(),
            self.config.compression.clone(),
        )
    }

    /// Get an open handle for pack `id`, opening and caching on miss.
    pub fn get_packfile(&self, id: PackId) -> Result<Arc<Mutex<Packfile>>> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(pack) = cache.get(&id) {
            return Ok(Arc::clone(pack));
        }

        let pack = Arc::new(Mutex::new(self.open_pack(id)?));
        cache.put(id, Arc::clone(&pack));
        Ok(pack)
    }

    /// Allocate a fresh pack identity and open its file.
    pub fn new_packfile(&mut self) -> Result<(PackId, Arc<Mutex<Packfile>>)> {
        assert!(!self.free_list.is_empty(), "pack free list must not be empty");

        let id = self.free_list[0];
        // The sole remaining id is the next-fresh tail: bump it in place
        // so the list never empties.
        if self.free_list.len() == 1 {
            self.free_list[0] += 1;
        } else {
            self.free_list.pop_front();
        }

        let pack = Arc::new(Mutex::new(self.open_pack(id)?));
        self.cache.lock().unwrap().put(id, Arc::clone(&pack));

        debug!(pack = id, "allocated pack");
        Ok((id, pack))
    }

    /// Persist the free list (truncate-on-create, last writer wins).
    pub fn flush(&self) -> Result<()> {
        self.write_free_list()
    }

    fn load_free_list(&mut self) -> Result<bool> {
        let path = self.root.join(FREELIST_NAME);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => return Ok(false),
        };

        let mut reader = BufReader::new(file);
        let count = match reader.read_u32_le() {
            Ok(n) => n,
            Err(_) => return Ok(false),
        };
        if count == 0 {
            return Ok(false);
        }

        let mut list = VecDeque::with_capacity(count as usize);
        for _ in 0..count {
            match reader.read_u32_le() {
                Ok(id) => list.push_back(id),
                Err(_) => return Ok(false),
            }
        }

        self.free_list = list;
        Ok(true)
    }

    /// Rebuild the free list by scanning the root for `pack<id>.pak`
    /// files: the complement of the existing ids, then one past the
    /// highest.
    fn recompute_free_list(&mut self) -> Result<()> {
        let mut existing: Vec<PackId> = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(id) = parse_pack_name(&entry.file_name().to_string_lossy()) {
                existing.push(id);
            }
        }
        existing.sort_unstable();

        self.free_list.clear();
        match existing.last() {
            Some(&max) => {
                let mut next = 0;
                for &id in &existing {
                    while next < id {
                        self.free_list.push_back(next);
                        next += 1;
                    }
                    next = id + 1;
                }
                self.free_list.push_back(max + 1);
            }
            None => self.free_list.push_back(0),
        }

        warn!(
            packs = existing.len(),
            free = self.free_list.len(),
            "recomputed pack free list from directory scan"
        );
        Ok(())
    }

    fn write_free_list(&self) -> Result<()> {
        let mut buf = Vec::with_capacity(4 + 4 * self.free_list.len());
        buf.write_u32_le(self.free_list.len() as u32)?;
        for &id in &self.free_list {
            buf.write_u32_le(id)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.root.join(FREELIST_NAME))?;
        file.write_all(&buf)?;
        Ok(())
    }
}

impl Drop for PackfileManager {
    fn drop(&mut self) {
        if let Err(e) = self.write_free_list() {
            warn!(error = %e, "failed to persist pack free list");
        }
    }
}

fn parse_pack_name(name: &str) -> Option<PackId> {
    let digits = name.strip_prefix("pack")?.strip_suffix(".pak")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> PackfileManager {
        PackfileManager::open(dir.path(), &Config::default()).unwrap()
    }

    #[test]
    fn test_fresh_repository_allocates_id_zero() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);

        assert_eq!(mgr.free_list().collect::<Vec<_>>(), vec![0]);
        let (id, _) = mgr.new_packfile().unwrap();
        assert_eq!(id, 0);
        // The tail was bumped in place, never emptied.
        assert_eq!(mgr.free_list().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_free_list_recovery_from_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pack0.pak"), b"").unwrap();
        std::fs::write(dir.path().join("pack2.pak"), b"").unwrap();
        std::fs::write(dir.path().join("notapack.txt"), b"").unwrap();

        let mut mgr = manager(&dir);
        assert_eq!(mgr.free_list().collect::<Vec<_>>(), vec![1, 3]);

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(mgr.new_packfile().unwrap().0);
        }
        assert_eq!(ids, vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_free_list_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut mgr = manager(&dir);
            mgr.new_packfile().unwrap();
            mgr.new_packfile().unwrap();
            mgr.flush().unwrap();
        }

        let mgr = manager(&dir);
        assert_eq!(mgr.free_list().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_recovered_list_is_persisted_before_use() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pack1.pak"), b"").unwrap();

        let _mgr = manager(&dir);
        assert!(dir.path().join(FREELIST_NAME).exists());
    }

    #[test]
    fn test_get_packfile_caches_handle() {
        let dir = TempDir::new().unwrap();
        let mut mgr = manager(&dir);
        let (id, first) = mgr.new_packfile().unwrap();

        let second = mgr.get_packfile(id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_free_list_strictly_increasing_past_existing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pack0.pak"), b"").unwrap();
        std::fs::write(dir.path().join("pack1.pak"), b"").unwrap();
        std::fs::write(dir.path().join("pack4.pak"), b"").unwrap();

        let mgr = manager(&dir);
        let list: Vec<_> = mgr.free_list().collect();
        assert_eq!(list, vec![2, 3, 5]);
        assert!(list.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_parse_pack_name() {
        assert_eq!(parse_pack_name("pack7.pak"), Some(7));
        assert_eq!(parse_pack_name("pack07.pak"), Some(7));
        assert_eq!(parse_pack_name("pack.pak"), None);
        assert_eq!(parse_pack_name("packx.pak"), None);
        assert_eq!(parse_pack_name("pack7.pak.tmp"), None);
    }
}
