//! The worker's client-facing TCP server.
//!
//! Clients that bypass the proxy connect here directly and send
//! dialect-A `Trigger` packets; the worker dispatches them as jobs and
//! answers with `WorkerResponse`. Anything other than a trigger is a
//! protocol error and gets an `Err` echo. When the worker is shedding
//! load, triggers bounce with `TriggerReject`.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use crate::error::SResult;
use crate::net::writer::SocketWriter;
use crate::wire::client::{ClientCodec, ClientMsg, ClientPacket};
use crate::worker::{dispatch_job, WorkerContext};

/// Serves direct clients until the task is dropped.
pub async fn serve(listener: TcpListener, ctx: Arc<WorkerContext>) -> SResult<()> {
    let local = listener.local_addr()?;
    log::info!("worker accepting direct clients on {}", local);

    let mut incoming = TcpListenerStream::new(listener);
    while let Some(conn) = incoming.next().await {
        match conn {
            Ok(socket) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(socket, ctx).await {
                        log::error!("direct client connection ended: {}", err);
                    }
                });
            }
            Err(err) => log::error!("accept error: {}", err),
        }
    }
    Ok(())
}

async fn serve_connection(socket: TcpStream, ctx: Arc<WorkerContext>) -> SResult<()> {
    socket.set_nodelay(true)?;
    let peer = socket.peer_addr()?;

    let (read_half, write_half) = socket.into_split();
    let mut frames = FramedRead::new(read_half, ClientCodec);
    let writer: SocketWriter<ClientPacket> = SocketWriter::spawn(write_half);

    while let Some(frame) = frames.next().await {
        let pack = match frame {
            Ok(pack) => pack,
            Err(err) => {
                log::error!("decode error from {}: {}", peer, err);
                break;
            }
        };

        match pack.header.msg {
            ClientMsg::Trigger => {
                if ctx.overloaded() {
                    log::error!("rejecting trigger from {}: job limit exceeded", peer);
                    writer.send(pack.reply(ClientMsg::TriggerReject, Vec::new()))?;
                } else {
                    dispatch_job(&ctx, pack, writer.clone())?;
                }
            }
            other => {
                log::error!("packet error from {}: unexpected {:?}", peer, other);
                writer.send(pack.reply(ClientMsg::Err, Vec::new()))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockStore, DEFAULT_BLOCK_SIZE};
    use crate::config::{HostPort, WorkerConfig};
    use crate::node;
    use crate::storage::memory::MemoryEngine;
    use crate::uuid::FileId;
    use crate::wire::client::FileRequest;
    use pretty_assertions::assert_eq;

    async fn spawn_worker() -> std::net::SocketAddr {
        let node_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node_port = node_listener.local_addr().unwrap().port();
        let store = BlockStore::open(MemoryEngine::new(), DEFAULT_BLOCK_SIZE).unwrap();
        tokio::spawn(node::serve(node_listener, store));

        let config = WorkerConfig {
            hosts: vec![HostPort { host: "127.0.0.1".to_string(), port: node_port }],
            replication_size: 1,
            cache_enabled: true,
            ..WorkerConfig::default()
        };
        let ctx = WorkerContext::from_config(&config).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, ctx));
        addr
    }

    #[tokio::test]
    async fn triggers_get_worker_responses() {
        let addr = spawn_worker().await;
        let socket = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = socket.into_split();
        let mut frames = FramedRead::new(read_half, ClientCodec);
        let writer: SocketWriter<ClientPacket> = SocketWriter::spawn(write_half);

        let f = FileId([0x31; 32]);
        let write = ClientPacket::request(
            ClientMsg::Trigger,
            f,
            FileRequest::write(f, 0, b"direct".to_vec()).encode(),
        );
        writer.send(write.clone()).unwrap();

        let resp = frames.next().await.unwrap().unwrap();
        assert_eq!(resp.header.msg, ClientMsg::WorkerResponse);
        assert_eq!(resp.header.salt, write.header.salt);
        assert_eq!(resp.data, b"OK".to_vec());

        let read = ClientPacket::request(ClientMsg::Trigger, f, FileRequest::read(f, 0, 6).encode());
        writer.send(read).unwrap();
        let resp = frames.next().await.unwrap().unwrap();
        assert_eq!(resp.data, b"direct".to_vec());
    }

    #[tokio::test]
    async fn non_triggers_answer_err() {
        let addr = spawn_worker().await;
        let socket = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = socket.into_split();
        let mut frames = FramedRead::new(read_half, ClientCodec);
        let writer: SocketWriter<ClientPacket> = SocketWriter::spawn(write_half);

        let f = FileId([0x32; 32]);
        let bogus = ClientPacket::request(ClientMsg::WorkerReg, f, Vec::new());
        writer.send(bogus.clone()).unwrap();

        let resp = frames.next().await.unwrap().unwrap();
        assert_eq!(resp.header.msg, ClientMsg::Err);
        assert_eq!(resp.header.salt, bogus.header.salt);
    }
}
