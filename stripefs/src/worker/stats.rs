//! Worker operation counters, logged at deregistration and handy in
//! tests.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_derive::{Deserialize, Serialize};

/// Live counters; cheap relaxed increments on the hot path.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub jobs: AtomicU64,
    pub writes: AtomicU64,
    pub reads: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub jobs: u64,
    pub writes: u64,
    pub reads: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs: self.jobs.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }

    pub fn count_job(&self) {
        self.jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn count_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn count_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn snapshot_reflects_counts() {
        let stats = WorkerStats::default();
        stats.count_job();
        stats.count_job();
        stats.count_write(100);
        stats.count_read(40);
        stats.count_cache(true);
        stats.count_cache(false);
        stats.count_cache(false);

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                jobs: 2,
                writes: 1,
                reads: 1,
                cache_hits: 1,
                cache_misses: 2,
                bytes_written: 100,
                bytes_read: 40,
            }
        );
    }
}
