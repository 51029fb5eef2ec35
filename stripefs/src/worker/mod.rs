//! The data-function worker: stateless I/O engine that stripes client
//! byte ranges over storage nodes, drives 2PC per write, replicates
//! asynchronously, caches hot ranges, and serializes work per file.

pub mod backend;
pub mod cache;
pub mod control;
pub mod direct;
pub mod driver;
pub mod stats;
pub mod strand;

use std::sync::Arc;

use crate::config::{StorageType, WorkerConfig};
use crate::error::{Error, SResult};
use crate::net::writer::SocketWriter;
use crate::uuid::FileId;
use crate::wire::client::{ClientMsg, ClientPacket, FileOp, FileRequest, SubType};
use crate::worker::backend::NodeClient;
use crate::worker::cache::Cache;
use crate::worker::driver::StripeDriver;
use crate::worker::stats::WorkerStats;
use crate::worker::strand::StrandMap;

/// The storage backends a worker can drive. Only the stripefs block
/// plane is implemented; the legacy tags are rejected at construction.
pub enum StorageBackend {
    Ssbd(StripeDriver),
}

impl StorageBackend {
    pub fn from_config(config: &WorkerConfig) -> SResult<Self> {
        match config.storage_type {
            StorageType::Ssbd => {
                let backends = config
                    .hosts
                    .iter()
                    .map(|hp| NodeClient::new(&hp.host, hp.port))
                    .collect();
                Ok(StorageBackend::Ssbd(StripeDriver::new(
                    backends,
                    config.block_size,
                    config.replication_size,
                )))
            }
            other => Err(Error::Value(format!("storage backend {:?} is not available", other))),
        }
    }

    pub async fn write(&self, file: &FileId, position: u32, data: &[u8]) -> Vec<u8> {
        match self {
            StorageBackend::Ssbd(driver) => driver.write(file, position, data).await,
        }
    }

    pub async fn read(&self, file: &FileId, position: u32, size: u32) -> Vec<u8> {
        match self {
            StorageBackend::Ssbd(driver) => driver.read(file, position, size).await,
        }
    }
}

/// Everything a job needs, shared by the control channel and the
/// direct-client server.
pub struct WorkerContext {
    pub backend: StorageBackend,
    /// Present when caching is enabled.
    pub cache: Option<Cache>,
    pub strands: StrandMap,
    pub stats: WorkerStats,
    pub max_pending_jobs: usize,
}

impl WorkerContext {
    pub fn from_config(config: &WorkerConfig) -> SResult<Arc<Self>> {
        let backend = StorageBackend::from_config(config)?;
        let cache = if config.cache_enabled {
            Some(Cache::new(config.policy()?, config.cache_size))
        } else {
            None
        };
        Ok(Arc::new(WorkerContext {
            backend,
            cache,
            strands: StrandMap::new(),
            stats: WorkerStats::default(),
            max_pending_jobs: config.max_pending_jobs,
        }))
    }

    /// True when the worker should shed load instead of taking jobs.
    pub fn overloaded(&self) -> bool {
        self.strands.total_in_flight() > self.max_pending_jobs
    }

    /// Executes one file request. Reads go through the cache; writes go
    /// through storage and then refresh the cache (write-through).
    pub async fn perform(&self, request: &FileRequest) -> Vec<u8> {
        self.stats.count_job();
        match request.subtype {
            SubType::File => match request.op {
                FileOp::Write => {
                    let reply =
                        self.backend.write(&request.uuid, request.position, &request.payload).await;
                    if reply == b"OK" {
                        self.stats.count_write(request.payload.len() as u64);
                        if let Some(cache) = &self.cache {
                            cache.insert(&request.uuid, request.position, &request.payload);
                        }
                    }
                    reply
                }
                FileOp::Read => {
                    if let Some(cache) = &self.cache {
                        if let Some(data) =
                            cache.try_read(&request.uuid, request.position, request.size)
                        {
                            log::debug!("cache hit for {}@{}", request.uuid, request.position);
                            self.stats.count_cache(true);
                            self.stats.count_read(data.len() as u64);
                            return data;
                        }
                        self.stats.count_cache(false);
                    }
                    let data =
                        self.backend.read(&request.uuid, request.position, request.size).await;
                    if !data.starts_with(b"Error:") {
                        self.stats.count_read(data.len() as u64);
                        if let Some(cache) = &self.cache {
                            cache.insert(&request.uuid, request.position, &data);
                        }
                    }
                    data
                }
            },
            // The metadata plane is an extension point, not wired up.
            SubType::Metadata => b"Error: metadata plane not available".to_vec(),
            SubType::Wakeup => b"OK".to_vec(),
            SubType::StorageTest => Vec::new(),
        }
    }
}

/// Posts a packet's job onto the file's strand; the reply goes out on
/// `writer` as a `WorkerResponse` when the job completes.
pub fn dispatch_job(
    ctx: &Arc<WorkerContext>,
    pack: ClientPacket,
    writer: SocketWriter<ClientPacket>,
) -> SResult<()> {
    let request = match FileRequest::decode(&pack.data) {
        Ok(request) => request,
        Err(err) => {
            log::error!("undecodable job body for {}: {}", pack.header, err);
            let resp = pack.reply(ClientMsg::WorkerResponse, err.to_reply());
            return writer.send(resp);
        }
    };

    let job_ctx = ctx.clone();
    let file: FileId = request.uuid;
    ctx.strands.submit(file, async move {
        let ctx = job_ctx;
        let started = std::time::Instant::now();
        let body = ctx.perform(&request).await;
        let resp = pack.reply(ClientMsg::WorkerResponse, body);
        if let Err(err) = writer.send(resp) {
            log::error!("reply for {} lost: {}", pack.header, err);
        }
        log::debug!("job {} finished in {:?}", pack.header, started.elapsed());
    })
}
