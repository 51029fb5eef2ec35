//! Partial-range file cache inside a worker.
//!
//! Entries are whole files' worth of cached bytes: a buffer indexed by
//! absolute file position, a log of `(position, size)` segments the
//! buffer actually covers, and a frequency counter. A lookup hits only
//! when one logged segment fully contains the requested range; anything
//! else is a miss and the caller goes to storage.
//!
//! Bytes are deep-copied in both directions, so a cached range stays
//! equal to what was written even after the request buffer is gone.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, SResult};
use crate::uuid::FileId;

/// Cache eviction policies, selected by a string tag in the worker
/// configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Fifo,
    /// Cache without eviction; the budget is ignored.
    None,
}

impl EvictionPolicy {
    pub fn from_tag(tag: &str) -> SResult<Self> {
        match tag {
            "LRU" => Ok(EvictionPolicy::Lru),
            "FIFO" => Ok(EvictionPolicy::Fifo),
            "NONE" => Ok(EvictionPolicy::None),
            other => Err(Error::Value(format!("unknown cache policy '{}'", other))),
        }
    }

    /// Whether a departing worker's digest may prefill this cache.
    pub fn accepts_transfer(&self) -> bool {
        matches!(self, EvictionPolicy::Lru | EvictionPolicy::Fifo)
    }
}

/// A contiguous cached range of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub position: u32,
    pub size: u32,
}

/// One file's externalized cache state, as shipped in a cache-transfer
/// digest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheExport {
    pub file: FileId,
    pub segments: Vec<Segment>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

struct Entry {
    buf: Vec<u8>,
    segments: Vec<Segment>,
    last_access: u64,
    inserted_at: u64,
}

struct Inner {
    entries: HashMap<FileId, Entry>,
    frequency: HashMap<FileId, u64>,
    used: u64,
    tick: u64,
}

/// The worker cache. Byte budget `capacity` triggers whole-entry
/// eviction by `policy` once exceeded.
pub struct Cache {
    policy: EvictionPolicy,
    capacity: u64,
    inner: Mutex<Inner>,
}

impl Cache {
    pub fn new(policy: EvictionPolicy, capacity: u64) -> Self {
        Cache {
            policy,
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                frequency: HashMap::new(),
                used: 0,
                tick: 0,
            }),
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Returns the cached bytes for `[position, position + size)` if a
    /// logged segment fully covers that range. Counts the access either
    /// way.
    pub fn try_read(&self, file: &FileId, position: u32, size: u32) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().ok()?;
        inner.tick += 1;
        let tick = inner.tick;
        *inner.frequency.entry(*file).or_insert(0) += 1;

        let entry = inner.entries.get_mut(file)?;
        entry.last_access = tick;

        let start = position as usize;
        let end = position as usize + size as usize;
        let covered = entry
            .segments
            .iter()
            .any(|s| s.position <= position && position + size <= s.position + s.size);
        if !covered || entry.buf.len() < end {
            return None;
        }
        Some(entry.buf[start..end].to_vec())
    }

    /// Places `payload` at `position`, growing the buffer as needed and
    /// logging the segment. Both the read-through fill and the
    /// write-through path land here.
    pub fn insert(&self, file: &FileId, position: u32, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else { return };
        inner.tick += 1;
        let tick = inner.tick;
        *inner.frequency.entry(*file).or_insert(0) += 1;

        let entry = inner.entries.entry(*file).or_insert_with(|| Entry {
            buf: Vec::new(),
            segments: Vec::new(),
            last_access: tick,
            inserted_at: tick,
        });

        let old_len = entry.buf.len() as u64;
        let end = position as usize + payload.len();
        if entry.buf.len() < end {
            entry.buf.resize(end, 0);
        }
        entry.buf[position as usize..end].copy_from_slice(payload);
        let segment = Segment { position, size: payload.len() as u32 };
        if !entry.segments.contains(&segment) {
            entry.segments.push(segment);
        }
        entry.last_access = tick;

        let grown = entry.buf.len() as u64 - old_len;
        inner.used += grown;

        self.evict(&mut inner);
    }

    /// Drops whole entries by policy until the budget holds.
    fn evict(&self, inner: &mut Inner) {
        if self.policy == EvictionPolicy::None {
            return;
        }
        while inner.used > self.capacity && !inner.entries.is_empty() {
            let victim = match self.policy {
                EvictionPolicy::Lru => inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(f, _)| *f),
                EvictionPolicy::Fifo => inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(f, _)| *f),
                EvictionPolicy::None => None,
            };
            let Some(victim) = victim else { break };
            if let Some(entry) = inner.entries.remove(&victim) {
                inner.used -= entry.buf.len() as u64;
                log::debug!("evicted {} ({} bytes)", victim, entry.buf.len());
            }
            // Frequency and range log leave with the entry.
            inner.frequency.remove(&victim);
        }
    }

    /// Serializes the cache for a cache-transfer handoff.
    pub fn export(&self) -> SResult<Vec<u8>> {
        let inner = self.inner.lock()?;
        let mut out: Vec<CacheExport> = inner
            .entries
            .iter()
            .map(|(file, entry)| CacheExport {
                file: *file,
                segments: entry.segments.clone(),
                data: entry.buf.clone(),
            })
            .collect();
        out.sort_by_key(|e| e.file);
        Ok(bincode::serialize(&out)?)
    }

    /// Prefills the cache from a predecessor's digest. The caller gates
    /// this on [`EvictionPolicy::accepts_transfer`].
    pub fn import(&self, digest: &[u8]) -> SResult<usize> {
        let exports: Vec<CacheExport> = bincode::deserialize(digest)?;
        let count = exports.len();
        for export in exports {
            for segment in &export.segments {
                let start = segment.position as usize;
                let end = start + segment.size as usize;
                if end <= export.data.len() {
                    self.insert(&export.file, segment.position, &export.data[start..end]);
                }
            }
        }
        Ok(count)
    }

    /// Bytes currently held across all entries.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().map(|i| i.used).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frequency(&self, file: &FileId) -> u64 {
        self.inner.lock().ok().and_then(|i| i.frequency.get(file).copied()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn file(tag: u8) -> FileId {
        FileId([tag; 32])
    }

    #[test]
    fn miss_then_hit_after_insert() {
        let cache = Cache::new(EvictionPolicy::Lru, 1 << 20);
        let f = file(1);

        assert_eq!(cache.try_read(&f, 0, 4), None);
        cache.insert(&f, 0, b"zzzz");
        assert_eq!(cache.try_read(&f, 0, 4), Some(b"zzzz".to_vec()));
        // Sub-ranges of a logged segment hit too.
        assert_eq!(cache.try_read(&f, 1, 2), Some(b"zz".to_vec()));
    }

    #[test]
    fn uncovered_range_is_a_miss() {
        let cache = Cache::new(EvictionPolicy::Lru, 1 << 20);
        let f = file(1);
        cache.insert(&f, 100, b"abcd");

        // Before, after, and straddling the segment all miss.
        assert_eq!(cache.try_read(&f, 0, 4), None);
        assert_eq!(cache.try_read(&f, 104, 1), None);
        assert_eq!(cache.try_read(&f, 98, 4), None);
        // Exactly the segment hits.
        assert_eq!(cache.try_read(&f, 100, 4), Some(b"abcd".to_vec()));
    }

    #[test]
    fn cached_bytes_are_a_deep_copy() {
        let cache = Cache::new(EvictionPolicy::Lru, 1 << 20);
        let f = file(1);
        let mut payload = b"original".to_vec();
        cache.insert(&f, 0, &payload);
        payload.copy_from_slice(b"clobberd");
        assert_eq!(cache.try_read(&f, 0, 8), Some(b"original".to_vec()));
    }

    #[test]
    fn frequency_counts_every_access() {
        let cache = Cache::new(EvictionPolicy::Lru, 1 << 20);
        let f = file(1);
        cache.try_read(&f, 0, 1);
        cache.insert(&f, 0, b"x");
        cache.try_read(&f, 0, 1);
        assert_eq!(cache.frequency(&f), 3);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        // Budget fits two 8-byte entries, not three.
        let cache = Cache::new(EvictionPolicy::Lru, 16);
        cache.insert(&file(1), 0, &[1u8; 8]);
        cache.insert(&file(2), 0, &[2u8; 8]);

        // Touch file 1 so file 2 is the LRU victim.
        cache.try_read(&file(1), 0, 8);
        cache.insert(&file(3), 0, &[3u8; 8]);

        assert_eq!(cache.try_read(&file(2), 0, 8), None);
        assert_eq!(cache.try_read(&file(1), 0, 8), Some(vec![1u8; 8]));
        assert_eq!(cache.try_read(&file(3), 0, 8), Some(vec![3u8; 8]));
        assert!(cache.used_bytes() <= 16);
    }

    #[test]
    fn fifo_evicts_oldest_insert() {
        let cache = Cache::new(EvictionPolicy::Fifo, 16);
        cache.insert(&file(1), 0, &[1u8; 8]);
        cache.insert(&file(2), 0, &[2u8; 8]);

        // Touching file 1 does not save it under FIFO.
        cache.try_read(&file(1), 0, 8);
        cache.insert(&file(3), 0, &[3u8; 8]);

        assert_eq!(cache.try_read(&file(1), 0, 8), None);
        assert_eq!(cache.try_read(&file(2), 0, 8), Some(vec![2u8; 8]));
    }

    #[test]
    fn none_policy_never_evicts() {
        let cache = Cache::new(EvictionPolicy::None, 4);
        cache.insert(&file(1), 0, &[1u8; 8]);
        cache.insert(&file(2), 0, &[2u8; 8]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.try_read(&file(1), 0, 8), Some(vec![1u8; 8]));
    }

    #[test]
    fn eviction_drops_entries_whole() {
        let cache = Cache::new(EvictionPolicy::Lru, 20);
        let f = file(1);
        cache.insert(&f, 0, &[1u8; 8]);
        cache.insert(&f, 8, &[2u8; 8]);
        cache.insert(&file(2), 0, &[3u8; 8]);

        // file(1) holds 16 bytes in two segments; both go together.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.try_read(&f, 0, 8), None);
        assert_eq!(cache.try_read(&f, 8, 8), None);
        assert_eq!(cache.frequency(&f), 2); // restarted by the misses
    }

    #[test]
    fn export_import_round_trip() {
        let cache = Cache::new(EvictionPolicy::Lru, 1 << 20);
        cache.insert(&file(1), 0, b"first");
        cache.insert(&file(2), 64, b"second");

        let digest = cache.export().unwrap();
        let successor = Cache::new(EvictionPolicy::Fifo, 1 << 20);
        assert_eq!(successor.import(&digest).unwrap(), 2);

        assert_eq!(successor.try_read(&file(1), 0, 5), Some(b"first".to_vec()));
        assert_eq!(successor.try_read(&file(2), 64, 6), Some(b"second".to_vec()));
        // Ranges never cached stay misses after import.
        assert_eq!(successor.try_read(&file(2), 0, 8), None);
    }

    #[test]
    fn import_rejects_garbage() {
        let cache = Cache::new(EvictionPolicy::Lru, 1 << 20);
        assert!(cache.import(b"not a digest").is_err());
    }

    #[test]
    fn policy_tags_parse() {
        assert_eq!(EvictionPolicy::from_tag("LRU").unwrap(), EvictionPolicy::Lru);
        assert_eq!(EvictionPolicy::from_tag("FIFO").unwrap(), EvictionPolicy::Fifo);
        assert_eq!(EvictionPolicy::from_tag("NONE").unwrap(), EvictionPolicy::None);
        assert!(EvictionPolicy::from_tag("ARC").is_err());
        assert!(EvictionPolicy::Lru.accepts_transfer());
        assert!(!EvictionPolicy::None.accepts_transfer());
    }
}
