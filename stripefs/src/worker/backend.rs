//! Async client for one storage node.
//!
//! A worker keeps one `NodeClient` per configured node. Requests are
//! multiplexed over a single connection: each outstanding request parks
//! a one-shot completion keyed by `(uuid, blockid, salt)`, and a read
//! task matches responses back by that key. Transient connection
//! failures are retried a bounded number of times with a fresh
//! connection before surfacing an error.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use crate::error::{Error, SResult};
use crate::net::writer::SocketWriter;
use crate::uuid::FileId;
use crate::version::Version;
use crate::wire::gen_salt;
use crate::wire::node::{NodeCodec, NodeMsg, NodePacket};
use crate::wire::SALT_LEN;

/// Attempts per request before a transient failure becomes an error.
pub const DEFAULT_ATTEMPTS: usize = 3;

type JobKey = (FileId, u32, [u8; SALT_LEN]);

/// Result of a prepare round-trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrepareReply {
    pub agree: bool,
    /// Committed version reported by the node.
    pub committed: Version,
}

struct Inner {
    addr: String,
    conn: Mutex<Option<SocketWriter<NodePacket>>>,
    pending: StdMutex<HashMap<JobKey, oneshot::Sender<NodePacket>>>,
}

/// Client handle for one storage node. Cheap to clone.
#[derive(Clone)]
pub struct NodeClient {
    inner: Arc<Inner>,
}

impl NodeClient {
    pub fn new(host: &str, port: u16) -> Self {
        NodeClient {
            inner: Arc::new(Inner {
                addr: format!("{}:{}", host, port),
                conn: Mutex::new(None),
                pending: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Issues a prepare (or quick prepare) for one block slice.
    pub async fn prepare(
        &self,
        uuid: &FileId,
        block_id: u32,
        offset: u16,
        payload: &[u8],
        version: Version,
        quick: bool,
    ) -> SResult<PrepareReply> {
        let msg = if quick { NodeMsg::PrepareQuick } else { NodeMsg::Prepare };
        let pack = NodePacket::request(msg, *uuid, block_id, offset, 0, version)
            .with_data(payload.to_vec());
        let resp = self.request(pack).await?;
        match resp.header.msg {
            NodeMsg::PrepareAgree => Ok(PrepareReply { agree: true, committed: resp.header.version }),
            NodeMsg::PrepareAbort => Ok(PrepareReply { agree: false, committed: resp.header.version }),
            other => Err(Error::UnexpectedPacket(format!("{:?} in reply to prepare", other))),
        }
    }

    pub async fn commit(&self, uuid: &FileId, block_id: u32) -> SResult<()> {
        let pack = NodePacket::request(NodeMsg::CommitExecute, *uuid, block_id, 0, 0, 0);
        let resp = self.request(pack).await?;
        match resp.header.msg {
            NodeMsg::CommitAck => Ok(()),
            other => Err(Error::UnexpectedPacket(format!("{:?} in reply to commit", other))),
        }
    }

    pub async fn rollback(&self, uuid: &FileId, block_id: u32) -> SResult<()> {
        let pack = NodePacket::request(NodeMsg::CommitRollback, *uuid, block_id, 0, 0, 0);
        let resp = self.request(pack).await?;
        match resp.header.msg {
            NodeMsg::CommitAck => Ok(()),
            other => Err(Error::UnexpectedPacket(format!("{:?} in reply to rollback", other))),
        }
    }

    pub async fn replicate(
        &self,
        uuid: &FileId,
        block_id: u32,
        offset: u16,
        payload: &[u8],
    ) -> SResult<()> {
        let pack = NodePacket::request(NodeMsg::Replication, *uuid, block_id, offset, 0, 0)
            .with_data(payload.to_vec());
        let resp = self.request(pack).await?;
        match resp.header.msg {
            NodeMsg::Ack => Ok(()),
            other => Err(Error::UnexpectedPacket(format!("{:?} in reply to replication", other))),
        }
    }

    /// Reads committed bytes from one block. The request is header-only
    /// with `datasize` as the read size.
    pub async fn get(
        &self,
        uuid: &FileId,
        block_id: u32,
        offset: u16,
        size: u32,
    ) -> SResult<Vec<u8>> {
        let pack = NodePacket::request(NodeMsg::Get, *uuid, block_id, offset, size, 0);
        let resp = self.request(pack).await?;
        match resp.header.msg {
            NodeMsg::Ack => Ok(resp.data),
            other => Err(Error::UnexpectedPacket(format!("{:?} in reply to get", other))),
        }
    }

    /// Sends one request and awaits its correlated response, retrying
    /// transient connection failures with a fresh connection and salt.
    async fn request(&self, pack: NodePacket) -> SResult<NodePacket> {
        let mut last = Error::Io("no attempt made".to_string());
        for attempt in 0..DEFAULT_ATTEMPTS {
            let mut try_pack = pack.clone();
            if attempt > 0 {
                try_pack.header.salt = gen_salt();
                log::debug!("retrying {} against {} (attempt {})", try_pack.header, self.addr(), attempt + 1);
            }
            match self.request_once(try_pack).await {
                Ok(resp) => return Ok(resp),
                Err(err @ Error::Io(_)) => last = err,
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    async fn request_once(&self, pack: NodePacket) -> SResult<NodePacket> {
        let writer = self.ensure_connected().await?;

        let key = pack.header.correlation();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock()?.insert(key, tx);

        if let Err(err) = writer.send(pack) {
            // The writer task died with the connection; force the next
            // attempt to dial fresh.
            self.inner.pending.lock()?.remove(&key);
            *self.inner.conn.lock().await = None;
            return Err(err);
        }
        // A dropped sender (connection died) surfaces as an Io error.
        Ok(rx.await?)
    }

    async fn ensure_connected(&self) -> SResult<SocketWriter<NodePacket>> {
        let mut conn = self.inner.conn.lock().await;
        if let Some(writer) = conn.as_ref() {
            return Ok(writer.clone());
        }

        log::debug!("connecting to storage node {}", self.inner.addr);
        let socket = TcpStream::connect(&self.inner.addr).await?;
        socket.set_nodelay(true)?;
        let (read_half, write_half) = socket.into_split();
        let writer = SocketWriter::spawn(write_half);
        *conn = Some(writer.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, NodeCodec);
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(resp) => {
                        let waiter = match inner.pending.lock() {
                            Ok(mut pending) => pending.remove(&resp.header.correlation()),
                            Err(_) => None,
                        };
                        match waiter {
                            // The waiter may have timed out and gone.
                            Some(tx) => drop(tx.send(resp)),
                            None => log::debug!("late response discarded: {}", resp.header),
                        }
                    }
                    Err(err) => {
                        log::error!("storage node {} read error: {}", inner.addr, err);
                        break;
                    }
                }
            }
            // Connection is gone: fail everything outstanding and force
            // the next request to reconnect.
            *inner.conn.lock().await = None;
            if let Ok(mut pending) = inner.pending.lock() {
                pending.clear();
            }
        });

        Ok(writer)
    }
}
