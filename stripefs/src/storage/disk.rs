use std::path::PathBuf;

use crate::error::SResult;
use crate::storage::engine::Engine;
use crate::storage::log::Log;
use crate::storage::{KeyDir, Status};

/// On-disk cost of one entry beyond its key and value: the two length
/// prefixes.
const ENTRY_OVERHEAD: u64 = 8;

/// The node's durable key/value engine: a single append-only log file
/// with an in-memory key directory mapping each live key to its latest
/// value slot.
///
/// Every commit rewrites a whole block cell, every rollback tombstones
/// its pending cell, so garbage accumulates quickly under write-heavy
/// files; a long-running node relies on the startup compaction pass
/// (see [`DiskEngine::open_compact`]) to rewrite only the live cells.
pub struct DiskEngine {
    /// The active append-only log file.
    log: Log,

    /// Maps keys to a value position and length in the log file.
    keydir: KeyDir,
}

impl DiskEngine {
    /// Opens or creates a block database in the given file.
    pub fn open(path: PathBuf) -> SResult<Self> {
        let mut log = Log::new(path)?;
        let keydir = log.build_keydir()?;
        Ok(Self { log, keydir })
    }

    /// Opens a block database, and compacts it if the garbage ratio
    /// exceeds the given threshold when opened.
    pub fn open_compact(path: PathBuf, garbage_ratio_threshold: f64) -> SResult<Self> {
        let mut s = Self::open(path)?;

        let status = s.status()?;
        if status.total_disk_size > 0 {
            let garbage_ratio = status.garbage_disk_size as f64 / status.total_disk_size as f64;
            if status.garbage_disk_size > 0 && garbage_ratio >= garbage_ratio_threshold {
                log::info!(
                    "compacting {} to remove {}B garbage ({:.0}% of {}B)",
                    s.log.path.display(),
                    status.garbage_disk_size,
                    garbage_ratio * 100.0,
                    status.total_disk_size
                );
                s.compact()?;
                log::info!(
                    "compacted {} to size {}B",
                    s.log.path.display(),
                    status.total_disk_size - status.garbage_disk_size
                );
            }
        }

        Ok(s)
    }

    pub fn path(&self) -> Option<&str> {
        self.log.path.to_str()
    }

    /// Compacts by rewriting only live cells into a sibling file and
    /// renaming it over the current log.
    pub fn compact(&mut self) -> SResult<()> {
        let mut tmp_path = self.log.path.clone();
        tmp_path.set_extension("new");

        let (mut new_log, new_keydir) = self.rewrite_live(tmp_path)?;

        std::fs::rename(&new_log.path, &self.log.path)?;
        new_log.path = self.log.path.clone();

        self.log = new_log;
        self.keydir = new_keydir;
        Ok(())
    }

    /// Copies every live cell into a fresh log at `path`, in key order,
    /// and returns it together with its keydir.
    fn rewrite_live(&mut self, path: PathBuf) -> SResult<(Log, KeyDir)> {
        let mut new_log = Log::new(path)?;
        new_log.file.set_len(0)?; // a crashed compaction may have left one behind

        let live: Vec<(Vec<u8>, (u64, u32))> =
            self.keydir.iter().map(|(key, slot)| (key.clone(), *slot)).collect();

        let mut new_keydir = KeyDir::new();
        for (key, (pos, len)) in live {
            let value = self.log.read_at(pos, len)?;
            let slot = new_log.append(&key, Some(&value))?;
            new_keydir.insert(key, slot);
        }
        Ok((new_log, new_keydir))
    }
}

impl std::fmt::Display for DiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "disk")
    }
}

impl Engine for DiskEngine {
    fn delete(&mut self, key: &[u8]) -> SResult<()> {
        self.log.append(key, None)?;
        self.keydir.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> SResult<()> {
        self.log.sync()
    }

    fn get(&mut self, key: &[u8]) -> SResult<Option<Vec<u8>>> {
        match self.keydir.get(key).copied() {
            Some((pos, len)) => Ok(Some(self.log.read_at(pos, len)?)),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> SResult<()> {
        let slot = self.log.append(key, Some(&value))?;
        self.keydir.insert(key.to_vec(), slot);
        Ok(())
    }

    fn scan_prefix(&mut self, prefix: &[u8]) -> SResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let range: Vec<(Vec<u8>, (u64, u32))> = self
            .keydir
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let mut out = Vec::with_capacity(range.len());
        for (key, (pos, len)) in range {
            let value = self.log.read_at(pos, len)?;
            out.push((key, value));
        }
        Ok(out)
    }

    fn scan_keys(&mut self, prefix: &[u8]) -> SResult<Vec<Vec<u8>>> {
        Ok(self
            .keydir
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn status(&mut self) -> SResult<Status> {
        let keys = self.keydir.len() as u64;
        let mut size = 0u64;
        for (key, (_, value_len)) in self.keydir.iter() {
            size += key.len() as u64 + *value_len as u64;
        }

        let live_disk_size = size + ENTRY_OVERHEAD * keys;
        let total_disk_size = self.log.len()?;
        Ok(Status {
            name: self.to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size,
            garbage_disk_size: total_disk_size - live_disk_size,
        })
    }
}

impl Drop for DiskEngine {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::error!("sync of {:?} on close failed: {}", self.log.path, err);
        }
    }
}
