//! Proxy-side worker management (boundary component).
//!
//! The mechanical counterpart of the worker control channel: accepts
//! connections on one port from both workers and clients, registers
//! workers, pushes keepalive timers, assigns client jobs to a worker
//! over its control connection, and relays the worker's responses back
//! to the client that asked. A departing worker's cache digest is kept
//! and handed to the next worker that registers.
//!
//! Assignment here is plain rotation and the keepalive is a fixed
//! interval; the adaptive load-balancing, keepalive, and launch
//! policies of a full deployment sit outside this crate, as does
//! service discovery.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use crate::error::SResult;
use crate::net::writer::SocketWriter;
use crate::uuid::FileId;
use crate::wire::client::{
    decode_endpoint, encode_wait_ms, ClientCodec, ClientMsg, ClientPacket,
};
use crate::wire::SALT_LEN;

/// Correlation key of an in-flight client job.
type JobKey = (FileId, [u8; 4], [u8; SALT_LEN]);

/// A registered worker, addressed through its control connection.
struct WorkerHandle {
    /// The client-facing endpoint it advertised.
    endpoint: ([u8; 4], u16),
    writer: SocketWriter<ClientPacket>,
}

struct Inner {
    keepalive: Duration,
    workers: Mutex<HashMap<SocketAddr, WorkerHandle>>,
    /// Client writers waiting for a worker response, by correlation.
    pending: Mutex<HashMap<JobKey, SocketWriter<ClientPacket>>>,
    /// Rotation counter for job assignment.
    next_worker: AtomicUsize,
    /// Cache digest left behind by the last deregistered worker.
    parked_digest: Mutex<Option<Vec<u8>>>,
}

/// The proxy front: one listener shared by workers and clients.
#[derive(Clone)]
pub struct ProxyServer {
    inner: Arc<Inner>,
}

impl ProxyServer {
    pub fn new(keepalive: Duration) -> Self {
        ProxyServer {
            inner: Arc::new(Inner {
                keepalive,
                workers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_worker: AtomicUsize::new(0),
                parked_digest: Mutex::new(None),
            }),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// The advertised client-facing endpoints of registered workers.
    pub fn worker_endpoints(&self) -> Vec<([u8; 4], u16)> {
        self.inner
            .workers
            .lock()
            .map(|w| w.values().map(|h| h.endpoint).collect())
            .unwrap_or_default()
    }

    /// Serves until the task is dropped.
    pub async fn serve(self, listener: TcpListener) -> SResult<()> {
        let local = listener.local_addr()?;
        log::info!("proxy listening on {}", local);

        let mut incoming = TcpListenerStream::new(listener);
        while let Some(conn) = incoming.next().await {
            match conn {
                Ok(socket) => {
                    let proxy = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = proxy.serve_connection(socket).await {
                            log::error!("proxy connection ended: {}", err);
                        }
                    });
                }
                Err(err) => log::error!("accept error: {}", err),
            }
        }
        Ok(())
    }

    async fn serve_connection(&self, socket: TcpStream) -> SResult<()> {
        socket.set_nodelay(true)?;
        let peer = socket.peer_addr()?;

        let (read_half, write_half) = socket.into_split();
        let mut frames = FramedRead::new(read_half, ClientCodec);
        let writer: SocketWriter<ClientPacket> = SocketWriter::spawn(write_half);

        // Whether this connection turned out to be a worker's.
        let mut is_worker = false;

        while let Some(frame) = frames.next().await {
            let pack = match frame {
                Ok(pack) => pack,
                Err(err) => {
                    log::error!("decode error from {}: {}", peer, err);
                    break;
                }
            };

            match pack.header.msg {
                ClientMsg::WorkerReg => {
                    is_worker = true;
                    self.register_worker(peer, &pack, &writer)?;
                }

                ClientMsg::WorkerDereg => {
                    log::info!("worker {} deregistered, parking {}B digest", peer, pack.data.len());
                    if !pack.data.is_empty() {
                        if let Ok(mut parked) = self.inner.parked_digest.lock() {
                            *parked = Some(pack.data.clone());
                        }
                    }
                    self.unregister_worker(&peer);
                    break;
                }

                ClientMsg::WorkerResponse => self.relay_response(pack)?,

                // Worker acks for SetTimer and friends.
                ClientMsg::Ack => {}

                ClientMsg::Trigger | ClientMsg::Put | ClientMsg::Get => {
                    self.assign_job(pack, &writer)?;
                }

                other => {
                    log::error!("unexpected packet {:?} from {}", other, peer);
                    writer.send(pack.reply(ClientMsg::Err, Vec::new()))?;
                }
            }
        }

        if is_worker {
            self.unregister_worker(&peer);
        }
        Ok(())
    }

    fn register_worker(
        &self,
        peer: SocketAddr,
        pack: &ClientPacket,
        writer: &SocketWriter<ClientPacket>,
    ) -> SResult<()> {
        let endpoint = decode_endpoint(&pack.data)?;
        log::info!(
            "worker registered from {} serving {}.{}.{}.{}:{}",
            peer,
            endpoint.0[0],
            endpoint.0[1],
            endpoint.0[2],
            endpoint.0[3],
            endpoint.1
        );

        writer.send(pack.reply(ClientMsg::Ack, Vec::new()))?;

        // A predecessor's cache moves to the first newcomer.
        let digest = self.inner.parked_digest.lock().map(|mut d| d.take()).unwrap_or(None);
        if let Some(digest) = digest {
            log::info!("handing {}B cache digest to {}", digest.len(), peer);
            let transfer =
                ClientPacket::request(ClientMsg::CacheTransfer, pack.header.key, digest);
            writer.send(transfer)?;
        }

        self.inner
            .workers
            .lock()?
            .insert(peer, WorkerHandle { endpoint, writer: writer.clone() });

        // Keepalive pushes until the control connection goes away.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let wait_ms = inner.keepalive.as_millis() as u32;
            let mut tick = tokio::time::interval(inner.keepalive / 2);
            tick.tick().await; // immediate first tick
            loop {
                tick.tick().await;
                let writer = match inner.workers.lock() {
                    Ok(workers) => match workers.get(&peer) {
                        Some(handle) => handle.writer.clone(),
                        None => return,
                    },
                    Err(_) => return,
                };
                let timer = ClientPacket::request(
                    ClientMsg::SetTimer,
                    FileId([0u8; 32]),
                    encode_wait_ms(wait_ms),
                );
                if writer.send(timer).is_err() {
                    log::info!("keepalive to {} failed, dropping registration", peer);
                    if let Ok(mut workers) = inner.workers.lock() {
                        workers.remove(&peer);
                    }
                    return;
                }
            }
        });
        Ok(())
    }

    fn unregister_worker(&self, peer: &SocketAddr) {
        if let Ok(mut workers) = self.inner.workers.lock() {
            if workers.remove(peer).is_some() {
                log::info!("worker {} removed from rotation", peer);
            }
        }
    }

    /// Hands a client job to the next worker in rotation and parks the
    /// client's writer for the response relay.
    fn assign_job(
        &self,
        pack: ClientPacket,
        client: &SocketWriter<ClientPacket>,
    ) -> SResult<()> {
        let worker = {
            let workers = self.inner.workers.lock()?;
            if workers.is_empty() {
                None
            } else {
                let n = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
                workers.values().nth(n % workers.len()).map(|h| h.writer.clone())
            }
        };

        let Some(worker) = worker else {
            log::error!("no worker available for {}", pack.header);
            return client.send(pack.reply(ClientMsg::TriggerReject, Vec::new()));
        };

        self.inner.pending.lock()?.insert(pack.header.correlation(), client.clone());
        if let Err(err) = worker.send(pack.clone()) {
            // Worker vanished between selection and send.
            self.inner.pending.lock()?.remove(&pack.header.correlation());
            log::error!("job push failed: {}", err);
            return client.send(pack.reply(ClientMsg::TriggerReject, Vec::new()));
        }
        Ok(())
    }

    fn relay_response(&self, pack: ClientPacket) -> SResult<()> {
        let waiter = self.inner.pending.lock()?.remove(&pack.header.correlation());
        match waiter {
            Some(client) => client.send(pack),
            None => {
                log::debug!("response with no waiting client: {}", pack.header);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockStore, DEFAULT_BLOCK_SIZE};
    use crate::config::{HostPort, WorkerConfig};
    use crate::node;
    use crate::storage::memory::MemoryEngine;
    use crate::worker::control::{ControlChannel, WorkerState};
    use crate::worker::WorkerContext;
    use pretty_assertions::assert_eq;
    use tokio::sync::watch;

    struct Fixture {
        proxy: ProxyServer,
        proxy_addr: SocketAddr,
        config: WorkerConfig,
    }

    async fn fixture() -> Fixture {
        let node_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node_port = node_listener.local_addr().unwrap().port();
        let store = BlockStore::open(MemoryEngine::new(), DEFAULT_BLOCK_SIZE).unwrap();
        tokio::spawn(node::serve(node_listener, store));

        let proxy = ProxyServer::new(Duration::from_secs(5));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(proxy.clone().serve(listener));

        let config = WorkerConfig {
            hosts: vec![HostPort { host: "127.0.0.1".to_string(), port: node_port }],
            replication_size: 1,
            cache_enabled: true,
            idle_timeout_ms: 60_000,
            ..WorkerConfig::default()
        };
        Fixture { proxy, proxy_addr, config }
    }

    async fn join_worker(
        fix: &Fixture,
    ) -> (Arc<WorkerContext>, watch::Sender<bool>, tokio::task::JoinHandle<SResult<WorkerState>>)
    {
        let ctx = WorkerContext::from_config(&fix.config).unwrap();
        let (tx, rx) = watch::channel(false);
        let channel = ControlChannel::new(ctx.clone(), fix.proxy_addr, &fix.config, rx);
        let task = tokio::spawn(channel.run());

        // Wait until the proxy has the worker in rotation.
        for _ in 0..200 {
            if fix.proxy.worker_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fix.proxy.worker_count() > 0, "worker never registered");
        (ctx, tx, task)
    }

    async fn client(fix: &Fixture) -> crate::client::Client {
        crate::client::Client::connect(&fix.proxy_addr.to_string()).await.unwrap()
    }

    #[tokio::test]
    async fn jobs_route_through_proxy_to_worker() {
        let fix = fixture().await;
        let (_ctx, _tx, _task) = join_worker(&fix).await;

        let f = FileId([0x41; 32]);
        let mut client = client(&fix).await;
        client.write(&f, 0, b"proxied".to_vec()).await.unwrap();
        assert_eq!(client.read(&f, 0, 7).await.unwrap(), b"proxied".to_vec());
    }

    #[tokio::test]
    async fn clients_bounce_when_no_worker_is_registered() {
        let fix = fixture().await;
        let f = FileId([0x42; 32]);
        let mut client = client(&fix).await;

        let err = client.write(&f, 0, b"nobody home".to_vec()).await.unwrap_err();
        assert!(err.to_string().contains("rejected"), "got {}", err);
    }

    #[tokio::test]
    async fn departing_worker_hands_cache_to_successor() {
        let fix = fixture().await;
        let (_ctx1, tx1, task1) = join_worker(&fix).await;

        // Warm the first worker's cache through a proxied write.
        let f = FileId([0x43; 32]);
        let mut client = client(&fix).await;
        client.write(&f, 0, b"inheritance".to_vec()).await.unwrap();

        // Graceful shutdown parks the digest at the proxy.
        tx1.send(true).unwrap();
        assert_eq!(task1.await.unwrap().unwrap(), WorkerState::Closed);
        for _ in 0..200 {
            if fix.proxy.worker_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The successor receives the digest on registration and serves
        // the range from its prefilled cache.
        let (ctx2, _tx2, _task2) = join_worker(&fix).await;
        let mut hit = false;
        for _ in 0..200 {
            if let Some(cache) = &ctx2.cache {
                if cache.try_read(&f, 0, 11) == Some(b"inheritance".to_vec()) {
                    hit = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(hit, "successor cache was not prefilled");
    }

    #[tokio::test]
    async fn worker_endpoints_are_advertised() {
        let fix = fixture().await;
        let (_ctx, _tx, _task) = join_worker(&fix).await;

        let endpoints = fix.proxy.worker_endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].1, fix.config.listen_port);
    }
}
