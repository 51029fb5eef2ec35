//! The worker I/O engine.
//!
//! Decomposes a client byte range into block slices, drives two-phase
//! commit across the deterministic replica set for writes, fans out
//! asynchronous replication, and gathers scattered block reads back
//! into one buffer. Only this driver turns storage errors into
//! client-visible replies.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::join_all;

use crate::error::{Error, SResult};
use crate::select::select_replica;
use crate::uuid::FileId;
use crate::version;
use crate::worker::backend::NodeClient;

/// Request-wide deadline for both reads and writes.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// One per-block slice of a client byte range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slice {
    pub block_id: u32,
    pub offset: u16,
    pub len: u32,
}

/// Splits `[position, position + len)` into per-block slices.
pub fn decompose(position: u32, len: u32, block_size: u32) -> Vec<Slice> {
    let mut slices = Vec::new();
    let end = position as u64 + len as u64;
    let mut cur = position as u64;
    while cur < end {
        let block_id = (cur / block_size as u64) as u32;
        let offset = (cur % block_size as u64) as u32;
        let chunk = (end - cur).min((block_size - offset) as u64) as u32;
        slices.push(Slice { block_id, offset: offset as u16, len: chunk });
        cur += chunk as u64;
    }
    slices
}

/// The striping driver: one per worker, shared by every strand.
pub struct StripeDriver {
    backends: Vec<NodeClient>,
    block_size: u32,
    replication_size: u32,
    deadline: Duration,
    /// Files this worker has successfully prepared before; writes to
    /// them use the quick-prepare variant. Entries leave on any abort.
    seen: Mutex<HashSet<FileId>>,
}

impl StripeDriver {
    pub fn new(backends: Vec<NodeClient>, block_size: u32, replication_size: u32) -> Self {
        StripeDriver {
            backends,
            block_size,
            replication_size: replication_size.max(1),
            deadline: REQUEST_DEADLINE,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Overrides the request deadline; tests shrink it.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn has_seen(&self, file: &FileId) -> bool {
        self.seen.lock().map(|s| s.contains(file)).unwrap_or(false)
    }

    fn forget(&self, file: &FileId) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.remove(file);
        }
    }

    fn backend_for(&self, file: &FileId, block_id: u32, replica_index: u32) -> &NodeClient {
        let index = select_replica(file, block_id, replica_index, self.backends.len());
        &self.backends[index]
    }

    /// Writes `data` at `position`, replying with `OK` or an `Error:`
    /// body. Never returns partial success: every slice committed, or
    /// the agreed slices rolled back.
    pub async fn write(&self, file: &FileId, position: u32, data: &[u8]) -> Vec<u8> {
        match tokio::time::timeout(self.deadline, self.try_write(file, position, data)).await {
            Ok(Ok(())) => b"OK".to_vec(),
            Ok(Err(err)) => {
                log::error!("write {}@{} failed: {}", file, position, err);
                err.to_reply()
            }
            Err(_) => {
                log::error!("write {}@{} hit the request deadline", file, position);
                self.forget(file);
                Error::Timeout("request timeout".to_string()).to_reply()
            }
        }
    }

    /// The 2PC write path. One version covers the whole request.
    pub async fn try_write(&self, file: &FileId, position: u32, data: &[u8]) -> SResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let version = version::now();
        let slices = decompose(position, data.len() as u32, self.block_size);
        let quick = self.has_seen(file);

        // Phase one: prepare every slice on its primary replica.
        let ranges = payload_ranges(&slices);
        let prepares = slices.iter().zip(ranges.iter()).map(|(slice, range)| {
            let payload = &data[range.clone()];
            let client = self.backend_for(file, slice.block_id, 0);
            async move {
                client.prepare(file, slice.block_id, slice.offset, payload, version, quick).await
            }
        });
        let replies = join_all(prepares).await;

        let mut all_agree = true;
        let mut any_abort = false;
        // Per slice: did this slice's node answer abort? Those never
        // logged our prepare and are skipped at rollback.
        let mut slice_aborted = vec![false; slices.len()];
        let mut first_err = None;
        for (i, reply) in replies.into_iter().enumerate() {
            match reply {
                Ok(reply) if reply.agree => {}
                Ok(reply) => {
                    log::debug!(
                        "prepare abort on {} blk={}, node committed v{}",
                        file,
                        slices[i].block_id,
                        reply.committed
                    );
                    all_agree = false;
                    any_abort = true;
                    slice_aborted[i] = true;
                }
                Err(err) => {
                    all_agree = false;
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        // Phase two: unanimous agreement commits, anything else rolls
        // back the slices that may hold our pending log. A slice that
        // answered abort never logged ours and is left alone.
        if all_agree {
            if let Ok(mut seen) = self.seen.lock() {
                seen.insert(*file);
            }
            let commits = slices.iter().map(|slice| {
                let client = self.backend_for(file, slice.block_id, 0);
                async move { client.commit(file, slice.block_id).await }
            });
            for (i, result) in join_all(commits).await.into_iter().enumerate() {
                if let Err(err) = result {
                    // Prepare-agree was the durability point; the node
                    // catches up through replication.
                    log::error!("commit of {} blk={} failed: {}", file, slices[i].block_id, err);
                }
            }
            self.spawn_replication(*file, position, data.to_vec());
            Ok(())
        } else {
            self.forget(file);
            let rollbacks = slices
                .iter()
                .enumerate()
                .filter(|(i, _)| !slice_aborted[*i])
                .map(|(_, slice)| {
                    let client = self.backend_for(file, slice.block_id, 0);
                    async move { client.rollback(file, slice.block_id).await }
                });
            for result in join_all(rollbacks).await {
                if let Err(err) = result {
                    log::error!("rollback on {} failed: {}", file, err);
                }
            }
            match (any_abort, first_err) {
                (true, _) => Err(Error::Abort(0)),
                (false, Some(err)) => Err(err),
                (false, None) => Err(Error::Internal("prepare failed with no reply".to_string())),
            }
        }
    }

    /// Write-forward copies to replicas `1..replication_size`, detached
    /// from the client reply.
    fn spawn_replication(&self, file: FileId, position: u32, data: Vec<u8>) {
        if self.replication_size <= 1 || self.backends.is_empty() {
            return;
        }
        let slices = decompose(position, data.len() as u32, self.block_size);
        let ranges = payload_ranges(&slices);
        let targets: Vec<(Slice, Vec<u8>, NodeClient)> = slices
            .iter()
            .zip(ranges.iter())
            .flat_map(|(slice, range)| {
                let payload = data[range.clone()].to_vec();
                (1..self.replication_size).map(move |replica| {
                    (*slice, payload.clone(), self.backend_for(&file, slice.block_id, replica).clone())
                })
            })
            .collect();

        tokio::spawn(async move {
            let jobs = targets.into_iter().map(|(slice, payload, client)| async move {
                (slice, client.replicate(&file, slice.block_id, slice.offset, &payload).await)
            });
            for (slice, result) in join_all(jobs).await {
                if let Err(err) = result {
                    log::error!("replication of {} blk={} failed: {}", file, slice.block_id, err);
                }
            }
        });
    }

    /// Reads `size` bytes at `position`, replying with the bytes or an
    /// `Error:` body.
    pub async fn read(&self, file: &FileId, position: u32, size: u32) -> Vec<u8> {
        match tokio::time::timeout(self.deadline, self.try_read(file, position, size)).await {
            Ok(Ok(data)) => data,
            Ok(Err(err)) => {
                log::error!("read {}@{} failed: {}", file, position, err);
                err.to_reply()
            }
            Err(_) => {
                log::error!("read {}@{} hit the request deadline", file, position);
                Error::Timeout("read timeout".to_string()).to_reply()
            }
        }
    }

    /// Scatter-gather over the primary replicas. Completions may land
    /// out of order; each slice has a fixed slot and the result is the
    /// in-order concatenation.
    pub async fn try_read(&self, file: &FileId, position: u32, size: u32) -> SResult<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let slices = decompose(position, size, self.block_size);
        let reads = slices.iter().map(|slice| {
            let client = self.backend_for(file, slice.block_id, 0);
            async move { client.get(file, slice.block_id, slice.offset, slice.len).await }
        });

        let mut collected = Vec::with_capacity(size as usize);
        for result in join_all(reads).await {
            collected.extend_from_slice(&result?);
        }
        Ok(collected)
    }
}

/// Byte ranges of the request payload covered by each slice. Slices are
/// contiguous and in position order, so the ranges simply accumulate.
fn payload_ranges(slices: &[Slice]) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::with_capacity(slices.len());
    let mut acc = 0usize;
    for slice in slices {
        ranges.push(acc..acc + slice.len as usize);
        acc += slice.len as usize;
    }
    ranges
}
