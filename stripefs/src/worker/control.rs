//! The worker↔proxy control channel.
//!
//! The worker dials the proxy, registers its client-facing endpoint,
//! and then serves commands until its keepalive deadline fires, the
//! proxy connection breaks, or a shutdown is requested. On a graceful
//! exit it deregisters with its exported cache digest so a successor
//! can prefill.
//!
//! State machine: `Connecting → Registering → Serving →
//! {Deregistering | Broken} → Closed`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use crate::config::WorkerConfig;
use crate::error::SResult;
use crate::net::writer::SocketWriter;
use crate::uuid::FileId;
use crate::wire::client::{
    decode_endpoint, decode_wait_ms, encode_endpoint, ClientCodec, ClientMsg, ClientPacket,
};
use crate::worker::{dispatch_job, WorkerContext};

/// The worker's lifecycle as the proxy sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Registering,
    Serving,
    Deregistering,
    Broken,
    Closed,
}

/// Proxies this worker already holds a control connection to.
type ProxySet = Arc<StdMutex<HashSet<SocketAddr>>>;

pub struct ControlChannel {
    ctx: Arc<WorkerContext>,
    proxy: SocketAddr,
    /// Client-facing endpoint advertised in `WorkerReg`.
    advertised_port: u16,
    /// Current keepalive window; `SetTimer` replaces it.
    waittime: Duration,
    /// Overall lifetime cap; `None` = unlimited.
    lifetime: Option<Duration>,
    peers: ProxySet,
    shutdown: watch::Receiver<bool>,
}

impl ControlChannel {
    pub fn new(
        ctx: Arc<WorkerContext>,
        proxy: SocketAddr,
        config: &WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        ControlChannel {
            ctx,
            proxy,
            advertised_port: config.listen_port,
            waittime: Duration::from_millis(config.idle_timeout_ms.max(1)),
            lifetime: match config.lifetime_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            peers: Arc::new(StdMutex::new(HashSet::new())),
            shutdown,
        }
    }

    /// A secondary channel to a peer proxy, advertised on the next odd
    /// port, sharing the peer set so joins do not loop.
    fn secondary(&self, proxy: SocketAddr) -> Self {
        ControlChannel {
            ctx: self.ctx.clone(),
            proxy,
            advertised_port: self.advertised_port + 1,
            waittime: self.waittime,
            lifetime: self.lifetime,
            peers: self.peers.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Runs the channel to completion and returns the terminal cause:
    /// `Closed` after a graceful deregister, `Broken` on a socket
    /// failure.
    pub async fn run(self) -> SResult<WorkerState> {
        log::info!("control channel connecting to {}", self.proxy);
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(self.proxy);
        }

        let socket = match TcpStream::connect(self.proxy).await {
            Ok(socket) => socket,
            Err(err) => {
                log::error!("connect to proxy {} failed: {}", self.proxy, err);
                return Ok(WorkerState::Broken);
            }
        };
        socket.set_nodelay(true)?;

        let local_ip = match socket.local_addr()? {
            SocketAddr::V4(v4) => v4.ip().octets(),
            SocketAddr::V6(_) => [127, 0, 0, 1],
        };

        let (read_half, write_half) = socket.into_split();
        let mut frames = FramedRead::new(read_half, ClientCodec);
        let writer: SocketWriter<ClientPacket> = SocketWriter::spawn(write_half);

        // Registering: advertise the client-facing endpoint.
        let mut state = WorkerState::Registering;
        log::info!("registering {}.{}.{}.{}:{} with proxy {}",
            local_ip[0], local_ip[1], local_ip[2], local_ip[3], self.advertised_port, self.proxy);
        let reg = ClientPacket::request(
            ClientMsg::WorkerReg,
            FileId([0u8; 32]),
            encode_endpoint(local_ip, self.advertised_port),
        );
        writer.send(reg)?;

        let mut waittime = self.waittime;
        let mut deadline = Instant::now() + waittime;
        let lifetime_deadline = self.lifetime.map(|d| Instant::now() + d);
        let mut shutdown = self.shutdown.clone();

        let cause = loop {
            let lifetime_wait = async {
                match lifetime_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                frame = frames.next() => match frame {
                    None => {
                        log::error!("proxy {} closed the control channel", self.proxy);
                        break WorkerState::Broken;
                    }
                    Some(Err(err)) => {
                        log::error!("control channel decode error: {}", err);
                        break WorkerState::Broken;
                    }
                    Some(Ok(pack)) => {
                        if pack.header.msg != ClientMsg::SetTimer {
                            // Any real activity pushes the deadline out.
                            deadline = Instant::now() + waittime;
                        }
                        if !self.handle(&pack, &writer, &mut state, &mut waittime, &mut deadline)? {
                            break WorkerState::Deregistering;
                        }
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    log::info!("keepalive deadline fired, leaving");
                    break WorkerState::Deregistering;
                }
                _ = lifetime_wait => {
                    log::info!("worker lifetime exhausted, leaving");
                    break WorkerState::Deregistering;
                }
                _ = shutdown.changed() => {
                    log::info!("shutdown requested, leaving");
                    break WorkerState::Deregistering;
                }
            }
        };

        log::info!("worker stats: {:?}", self.ctx.stats.snapshot());
        if cause == WorkerState::Deregistering {
            self.deregister(&writer).await;
            log::info!("control channel to {} closed", self.proxy);
            Ok(WorkerState::Closed)
        } else {
            Ok(WorkerState::Broken)
        }
    }

    /// Handles one proxy command. Returns false when the worker should
    /// shed load by leaving.
    fn handle(
        &self,
        pack: &ClientPacket,
        writer: &SocketWriter<ClientPacket>,
        state: &mut WorkerState,
        waittime: &mut Duration,
        deadline: &mut Instant,
    ) -> SResult<bool> {
        match pack.header.msg {
            ClientMsg::Ack => {
                if *state == WorkerState::Registering {
                    log::info!("registered with proxy {}", self.proxy);
                    *state = WorkerState::Serving;
                }
            }

            ClientMsg::SetTimer => match decode_wait_ms(&pack.data) {
                Ok(ms) => {
                    // Resets the deadline without counting as activity,
                    // and replaces the window for later resets.
                    *waittime = Duration::from_millis(ms as u64);
                    *deadline = Instant::now() + *waittime;
                    writer.send(pack.reply(ClientMsg::Ack, Vec::new()))?;
                    return Ok(true);
                }
                Err(err) => log::error!("bad set_timer payload: {}", err),
            },

            ClientMsg::ProxyJoin => match decode_endpoint(&pack.data) {
                Ok((ip, port)) => {
                    let peer = SocketAddr::from((ip, port));
                    let fresh = self.peers.lock().map(|p| !p.contains(&peer)).unwrap_or(false);
                    if fresh {
                        log::info!("proxy join: opening secondary channel to {}", peer);
                        let secondary = self.secondary(peer);
                        tokio::spawn(async move {
                            if let Err(err) = secondary.run().await {
                                log::error!("secondary control channel failed: {}", err);
                            }
                        });
                    }
                    writer.send(pack.reply(ClientMsg::Ack, Vec::new()))?;
                }
                Err(err) => log::error!("bad proxyjoin payload: {}", err),
            },

            ClientMsg::CacheTransfer => {
                if let Some(cache) = &self.ctx.cache {
                    if cache.policy().accepts_transfer() {
                        match cache.import(&pack.data) {
                            Ok(n) => log::info!("cache transfer prefilled {} file(s)", n),
                            Err(err) => log::error!("cache transfer rejected: {}", err),
                        }
                    }
                }
                writer.send(pack.reply(ClientMsg::Ack, Vec::new()))?;
            }

            ClientMsg::Trigger | ClientMsg::Put | ClientMsg::Get | ClientMsg::WorkerPushRequest => {
                if self.ctx.overloaded() {
                    log::error!("job limit exceeded, shedding load");
                    return Ok(false);
                }
                dispatch_job(&self.ctx, pack.clone(), writer.clone())?;
            }

            other => {
                log::error!("unexpected control packet {:?}: {}", other, pack.header);
                writer.send(pack.reply(ClientMsg::Err, Vec::new()))?;
            }
        }
        Ok(true)
    }

    /// Sends `WorkerDereg` carrying the exported cache digest, and
    /// drains the socket before returning.
    async fn deregister(&self, writer: &SocketWriter<ClientPacket>) {
        let digest = match &self.ctx.cache {
            Some(cache) => match cache.export() {
                Ok(digest) => digest,
                Err(err) => {
                    log::error!("cache export failed: {}", err);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        log::info!("deregistering, cache digest {} bytes", digest.len());
        let dereg = ClientPacket::request(ClientMsg::WorkerDereg, FileId([0u8; 32]), digest);
        if writer.send(dereg).is_ok() {
            let _ = writer.flushed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockStore, DEFAULT_BLOCK_SIZE};
    use crate::config::HostPort;
    use crate::node;
    use crate::storage::memory::MemoryEngine;
    use crate::wire::client::{encode_wait_ms, FileRequest};
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    async fn worker_config() -> (WorkerConfig, BlockStore<MemoryEngine>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store = BlockStore::open(MemoryEngine::new(), DEFAULT_BLOCK_SIZE).unwrap();
        tokio::spawn(node::serve(listener, store.clone()));
        let config = WorkerConfig {
            hosts: vec![HostPort { host: "127.0.0.1".to_string(), port }],
            replication_size: 1,
            cache_enabled: true,
            idle_timeout_ms: 200,
            ..WorkerConfig::default()
        };
        (config, store)
    }

    struct FakeProxy {
        frames: FramedRead<tokio::net::tcp::OwnedReadHalf, ClientCodec>,
        writer: SocketWriter<ClientPacket>,
    }

    impl FakeProxy {
        async fn accept(listener: &TcpListener) -> Self {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = socket.into_split();
            FakeProxy {
                frames: FramedRead::new(read_half, ClientCodec),
                writer: SocketWriter::spawn(write_half),
            }
        }

        async fn next(&mut self) -> ClientPacket {
            tokio::time::timeout(Duration::from_secs(5), self.frames.next())
                .await
                .expect("proxy read timed out")
                .expect("channel closed")
                .expect("decode error")
        }
    }

    fn spawn_channel(
        ctx: Arc<WorkerContext>,
        proxy: SocketAddr,
        config: &WorkerConfig,
    ) -> (tokio::task::JoinHandle<SResult<WorkerState>>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let channel = ControlChannel::new(ctx, proxy, config, rx);
        (tokio::spawn(channel.run()), tx)
    }

    #[tokio::test]
    async fn registers_then_deregisters_on_deadline() {
        let (config, _store) = worker_config().await;
        let ctx = WorkerContext::from_config(&config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let (task, _tx) = spawn_channel(ctx, proxy_addr, &config);
        let mut proxy = FakeProxy::accept(&listener).await;

        let reg = proxy.next().await;
        assert_eq!(reg.header.msg, ClientMsg::WorkerReg);
        let (_ip, port) = decode_endpoint(&reg.data).unwrap();
        assert_eq!(port, config.listen_port);
        proxy.writer.send(reg.reply(ClientMsg::Ack, Vec::new())).unwrap();

        // No traffic: the keepalive deadline fires and the worker says
        // goodbye with its (empty) cache digest.
        let dereg = proxy.next().await;
        assert_eq!(dereg.header.msg, ClientMsg::WorkerDereg);
        assert_eq!(task.await.unwrap().unwrap(), WorkerState::Closed);
    }

    #[tokio::test]
    async fn set_timer_controls_the_deadline() {
        let (mut config, _store) = worker_config().await;
        config.idle_timeout_ms = 60_000; // would outlive the test
        let ctx = WorkerContext::from_config(&config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let (task, _tx) = spawn_channel(ctx, proxy_addr, &config);
        let mut proxy = FakeProxy::accept(&listener).await;
        let reg = proxy.next().await;
        proxy.writer.send(reg.reply(ClientMsg::Ack, Vec::new())).unwrap();

        // Shrink the deadline to 100ms; the worker must leave promptly.
        let timer = ClientPacket::request(
            ClientMsg::SetTimer,
            FileId([0u8; 32]),
            encode_wait_ms(100),
        );
        proxy.writer.send(timer).unwrap();

        let started = std::time::Instant::now();
        loop {
            let pack = proxy.next().await;
            if pack.header.msg == ClientMsg::WorkerDereg {
                break;
            }
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(task.await.unwrap().unwrap(), WorkerState::Closed);
    }

    #[tokio::test]
    async fn jobs_flow_through_the_channel() {
        let (mut config, _store) = worker_config().await;
        config.idle_timeout_ms = 10_000;
        let ctx = WorkerContext::from_config(&config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let (_task, tx) = spawn_channel(ctx, proxy_addr, &config);
        let mut proxy = FakeProxy::accept(&listener).await;
        let reg = proxy.next().await;
        proxy.writer.send(reg.reply(ClientMsg::Ack, Vec::new())).unwrap();

        let f = FileId([0x21; 32]);
        let write = ClientPacket::request(
            ClientMsg::Trigger,
            f,
            FileRequest::write(f, 0, b"via proxy".to_vec()).encode(),
        );
        proxy.writer.send(write.clone()).unwrap();

        let resp = proxy.next().await;
        assert_eq!(resp.header.msg, ClientMsg::WorkerResponse);
        assert_eq!(resp.header.salt, write.header.salt);
        assert_eq!(resp.data, b"OK".to_vec());

        let read = ClientPacket::request(
            ClientMsg::Trigger,
            f,
            FileRequest::read(f, 0, 9).encode(),
        );
        proxy.writer.send(read.clone()).unwrap();
        let resp = proxy.next().await;
        assert_eq!(resp.data, b"via proxy".to_vec());

        drop(tx);
    }

    #[tokio::test]
    async fn proxy_join_opens_secondary_channel_on_next_port() {
        let (mut config, _store) = worker_config().await;
        config.idle_timeout_ms = 10_000;
        let ctx = WorkerContext::from_config(&config).unwrap();

        let listener1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr1 = listener1.local_addr().unwrap();
        let addr2 = listener2.local_addr().unwrap();

        let (_task, _tx) = spawn_channel(ctx, addr1, &config);
        let mut proxy1 = FakeProxy::accept(&listener1).await;
        let reg = proxy1.next().await;
        proxy1.writer.send(reg.reply(ClientMsg::Ack, Vec::new())).unwrap();

        // Tell the worker about the second proxy.
        let join = ClientPacket::request(
            ClientMsg::ProxyJoin,
            FileId([0u8; 32]),
            encode_endpoint([127, 0, 0, 1], addr2.port()),
        );
        proxy1.writer.send(join).unwrap();

        // The worker registers there, advertising the next odd port.
        let mut proxy2 = FakeProxy::accept(&listener2).await;
        let reg2 = proxy2.next().await;
        assert_eq!(reg2.header.msg, ClientMsg::WorkerReg);
        let (_ip, port) = decode_endpoint(&reg2.data).unwrap();
        assert_eq!(port, config.listen_port + 1);
    }

    #[tokio::test]
    async fn shutdown_exports_cache_digest() {
        let (mut config, _store) = worker_config().await;
        config.idle_timeout_ms = 10_000;
        let ctx = WorkerContext::from_config(&config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let (task, tx) = spawn_channel(ctx.clone(), proxy_addr, &config);
        let mut proxy = FakeProxy::accept(&listener).await;
        let reg = proxy.next().await;
        proxy.writer.send(reg.reply(ClientMsg::Ack, Vec::new())).unwrap();

        // Warm the cache through a job, then ask the worker to leave.
        let f = FileId([0x22; 32]);
        let write = ClientPacket::request(
            ClientMsg::Trigger,
            f,
            FileRequest::write(f, 0, b"digest me".to_vec()).encode(),
        );
        proxy.writer.send(write).unwrap();
        let resp = proxy.next().await;
        assert_eq!(resp.data, b"OK".to_vec());

        tx.send(true).unwrap();

        let dereg = proxy.next().await;
        assert_eq!(dereg.header.msg, ClientMsg::WorkerDereg);
        // The digest prefills a successor cache.
        let successor = crate::worker::cache::Cache::new(
            crate::worker::cache::EvictionPolicy::Lru,
            1 << 20,
        );
        assert_eq!(successor.import(&dereg.data).unwrap(), 1);
        assert_eq!(successor.try_read(&f, 0, 9), Some(b"digest me".to_vec()));

        assert_eq!(task.await.unwrap().unwrap(), WorkerState::Closed);
    }
}
