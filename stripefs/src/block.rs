//! The storage-node block engine: a versioned 2PC participant keeping
//! fixed-size blocks in a persistent key/value engine.
//!
//! Per block record (keyed by `<uuid><blockid>`):
//!
//! - committed payload (the block key itself);
//! - committed version (`…-committed-version`, ASCII decimal);
//! - pending-prepare version (`…-version`, ASCII decimal, 0 = none);
//! - pending-prepare payload (`…-data`);
//! - replica payload (`…repl`), written blindly and unversioned.
//!
//! A block moves `Absent → Empty(committed=0) → Prepared(pending=v) →
//! Committed(committed=v) | Empty`. Prepared is the only state that
//! rejects new prepares.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, SResult};
use crate::storage::engine::Engine;
use crate::storage::Status;
use crate::uuid::FileId;
use crate::version::Version;

/// Bytes per block unless configured otherwise.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

const REPLICA_SUFFIX: &[u8] = b"repl";
const COMMITTED_VERSION_SUFFIX: &[u8] = b"-committed-version";
const PENDING_VERSION_SUFFIX: &[u8] = b"-version";
const PENDING_DATA_SUFFIX: &[u8] = b"-data";

/// Outcome of a prepare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The candidate payload was logged as pending. Reports the current
    /// committed version.
    Agree { committed: Version },
    /// Another prepare is pending on this block. Reports the current
    /// committed version; the coordinator must pick a newer version and
    /// retry.
    Abort { committed: Version },
}

/// Operation counters, shared out for logging and assertions.
#[derive(Debug, Default)]
pub struct OpCounters {
    pub gets: AtomicU64,
    pub prepares: AtomicU64,
    pub aborts: AtomicU64,
    pub commits: AtomicU64,
    pub rollbacks: AtomicU64,
    pub replications: AtomicU64,
}

/// The block store over a key/value engine. Cheap to clone; all clones
/// share the engine and counters.
pub struct BlockStore<E: Engine> {
    engine: Arc<Mutex<E>>,
    block_size: u32,
    counters: Arc<OpCounters>,
}

impl<E: Engine> Clone for BlockStore<E> {
    fn clone(&self) -> Self {
        BlockStore {
            engine: self.engine.clone(),
            block_size: self.block_size,
            counters: self.counters.clone(),
        }
    }
}

fn block_key(uuid: &FileId, block_id: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 10);
    key.extend_from_slice(uuid.as_bytes());
    key.extend_from_slice(block_id.to_string().as_bytes());
    key
}

fn suffixed(base: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(base.len() + suffix.len());
    key.extend_from_slice(base);
    key.extend_from_slice(suffix);
    key
}

/// Versions are stored as ASCII decimal to tolerate hand inspection.
fn decode_version(cell: Option<Vec<u8>>) -> Version {
    let Some(cell) = cell else { return 0 };
    if cell.is_empty() {
        return 0;
    }
    match std::str::from_utf8(&cell).ok().and_then(|s| s.parse::<Version>().ok()) {
        Some(v) => v,
        None => {
            log::error!("unreadable version cell {:?}, treating as 0", cell);
            0
        }
    }
}

fn encode_version(version: Version) -> Vec<u8> {
    version.to_string().into_bytes()
}

/// Grows `base` to cover `offset + patch.len()` and overlays `patch` at
/// `offset`. Payloads only ever grow; truncation is not supported.
fn overlay(mut base: Vec<u8>, offset: usize, patch: &[u8]) -> Vec<u8> {
    let needed = offset + patch.len();
    if base.len() < needed {
        base.resize(needed, 0);
    }
    base[offset..needed].copy_from_slice(patch);
    base
}

impl<E: Engine> BlockStore<E> {
    /// Opens the block store and runs pending-log recovery: any block
    /// whose pending version differs from its committed version is
    /// in-doubt from a crash between prepare and commit, and is treated
    /// as aborted. The coordinator that owned it will reissue.
    pub fn open(engine: E, block_size: u32) -> SResult<Self> {
        let store = BlockStore {
            engine: Arc::new(Mutex::new(engine)),
            block_size,
            counters: Arc::new(OpCounters::default()),
        };
        store.recover()?;
        Ok(store)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn counters(&self) -> Arc<OpCounters> {
        self.counters.clone()
    }

    fn recover(&self) -> SResult<()> {
        let mut engine = self.engine.lock()?;
        let keys = engine.scan_keys(b"")?;
        let mut cleared = 0usize;
        for key in keys {
            if !key.ends_with(PENDING_VERSION_SUFFIX) || key.ends_with(COMMITTED_VERSION_SUFFIX) {
                continue;
            }
            let pending = decode_version(engine.get(&key)?);
            if pending == 0 {
                continue;
            }
            let base = key[..key.len() - PENDING_VERSION_SUFFIX.len()].to_vec();
            let committed =
                decode_version(engine.get(&suffixed(&base, COMMITTED_VERSION_SUFFIX))?);
            if pending != committed {
                engine.set(&key, encode_version(0))?;
                engine.delete(&suffixed(&base, PENDING_DATA_SUFFIX))?;
                cleared += 1;
            }
        }
        if cleared > 0 {
            log::info!("recovery cleared {} in-doubt pending prepare(s)", cleared);
        }
        Ok(())
    }

    /// Logs a pending prepare for `(uuid, block_id)`, or aborts if one
    /// is already pending. The candidate payload is the committed bytes
    /// grown to cover the patch, with `payload` overlaid at `offset`.
    pub fn prepare(
        &self,
        uuid: &FileId,
        block_id: u32,
        offset: u16,
        payload: &[u8],
        version: Version,
    ) -> SResult<PrepareOutcome> {
        if offset as usize + payload.len() > self.block_size as usize {
            return Err(Error::Value(format!(
                "prepare of {} bytes at offset {} exceeds block size {}",
                payload.len(),
                offset,
                self.block_size
            )));
        }

        self.counters.prepares.fetch_add(1, Ordering::Relaxed);
        let mut engine = self.engine.lock()?;
        let base = block_key(uuid, block_id);

        // First touch creates an empty record at version 0.
        let committed_payload = match engine.get(&base)? {
            Some(payload) => payload,
            None => {
                engine.set(&base, Vec::new())?;
                engine.set(&suffixed(&base, COMMITTED_VERSION_SUFFIX), encode_version(0))?;
                engine.set(&suffixed(&base, PENDING_VERSION_SUFFIX), encode_version(0))?;
                Vec::new()
            }
        };

        let committed =
            decode_version(engine.get(&suffixed(&base, COMMITTED_VERSION_SUFFIX))?);
        let pending = decode_version(engine.get(&suffixed(&base, PENDING_VERSION_SUFFIX))?);

        if pending != 0 && pending != committed {
            self.counters.aborts.fetch_add(1, Ordering::Relaxed);
            return Ok(PrepareOutcome::Abort { committed });
        }

        let candidate = overlay(committed_payload, offset as usize, payload);
        engine.set(&suffixed(&base, PENDING_DATA_SUFFIX), candidate)?;
        engine.set(&suffixed(&base, PENDING_VERSION_SUFFIX), encode_version(version))?;

        Ok(PrepareOutcome::Agree { committed })
    }

    /// Promotes the pending prepare to committed. Idempotent: with no
    /// pending log this is a no-op ack.
    pub fn commit(&self, uuid: &FileId, block_id: u32) -> SResult<()> {
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        let mut engine = self.engine.lock()?;
        let base = block_key(uuid, block_id);

        let pending = decode_version(engine.get(&suffixed(&base, PENDING_VERSION_SUFFIX))?);
        if pending == 0 {
            return Ok(());
        }
        let candidate = engine.get(&suffixed(&base, PENDING_DATA_SUFFIX))?.unwrap_or_default();

        engine.set(&suffixed(&base, COMMITTED_VERSION_SUFFIX), encode_version(pending))?;
        engine.set(&base, candidate)?;
        engine.set(&suffixed(&base, PENDING_VERSION_SUFFIX), encode_version(0))?;
        engine.delete(&suffixed(&base, PENDING_DATA_SUFFIX))?;
        Ok(())
    }

    /// Clears the pending slot. Idempotent; never touches the committed
    /// record, so a rollback after a commit leaves the commit intact.
    pub fn rollback(&self, uuid: &FileId, block_id: u32) -> SResult<()> {
        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        let mut engine = self.engine.lock()?;
        let base = block_key(uuid, block_id);

        engine.set(&suffixed(&base, PENDING_VERSION_SUFFIX), encode_version(0))?;
        engine.delete(&suffixed(&base, PENDING_DATA_SUFFIX))?;
        Ok(())
    }

    /// Writes a replica copy blindly: no version, last writer wins.
    pub fn replicate(
        &self,
        uuid: &FileId,
        block_id: u32,
        offset: u16,
        payload: &[u8],
    ) -> SResult<()> {
        if offset as usize + payload.len() > self.block_size as usize {
            return Err(Error::Value(format!(
                "replica write of {} bytes at offset {} exceeds block size {}",
                payload.len(),
                offset,
                self.block_size
            )));
        }

        self.counters.replications.fetch_add(1, Ordering::Relaxed);
        let mut engine = self.engine.lock()?;
        let key = suffixed(&block_key(uuid, block_id), REPLICA_SUFFIX);

        let current = engine.get(&key)?.unwrap_or_default();
        engine.set(&key, overlay(current, offset as usize, payload))?;
        Ok(())
    }

    /// Reads `size` bytes of the committed payload starting at `offset`.
    /// The result is shorter than `size` only when the block itself is
    /// shorter than `offset + size`.
    pub fn get(&self, uuid: &FileId, block_id: u32, offset: u16, size: u32) -> SResult<Vec<u8>> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let mut engine = self.engine.lock()?;
        let payload = engine.get(&block_key(uuid, block_id))?.unwrap_or_default();

        let start = (offset as usize).min(payload.len());
        let end = (offset as usize + size as usize).min(payload.len());
        Ok(payload[start..end].to_vec())
    }

    /// Reads the replica copy, for verification and read fan-out.
    pub fn get_replica(&self, uuid: &FileId, block_id: u32) -> SResult<Vec<u8>> {
        let mut engine = self.engine.lock()?;
        let key = suffixed(&block_key(uuid, block_id), REPLICA_SUFFIX);
        Ok(engine.get(&key)?.unwrap_or_default())
    }

    /// Committed version of a block; 0 when absent.
    pub fn committed_version(&self, uuid: &FileId, block_id: u32) -> SResult<Version> {
        let mut engine = self.engine.lock()?;
        let key = suffixed(&block_key(uuid, block_id), COMMITTED_VERSION_SUFFIX);
        Ok(decode_version(engine.get(&key)?))
    }

    pub fn flush(&self) -> SResult<()> {
        self.engine.lock()?.flush()
    }

    pub fn status(&self) -> SResult<Status> {
        self.engine.lock()?.status()
    }
}
