//! Per-connection ordered write queue.
//!
//! Every socket has a single-writer discipline: one task owns the write
//! half and drains a FIFO of jobs, so at most one write is outstanding
//! and responses leave in submission order. On a write error the queue
//! stops draining and every later send fails, which is the owner's cue
//! to tear the connection down.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, SResult};
use crate::wire::client::ClientPacket;
use crate::wire::node::NodePacket;

/// Anything the writer can serialize onto a socket.
pub trait WirePacket: Send + 'static {
    fn serialize(&self) -> Bytes;
}

impl WirePacket for NodePacket {
    fn serialize(&self) -> Bytes {
        NodePacket::serialize(self)
    }
}

impl WirePacket for ClientPacket {
    fn serialize(&self) -> Bytes {
        ClientPacket::serialize(self)
    }
}

enum WriteJob<P> {
    Packet {
        packet: P,
        /// Pre-serialized bytes; lets header-only writes skip re-encoding.
        buf: Option<Bytes>,
    },
    /// Barrier: acked once every job queued before it hit the socket.
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Handle to a connection's writer task. Cheap to clone.
pub struct SocketWriter<P> {
    tx: mpsc::UnboundedSender<WriteJob<P>>,
}

impl<P> Clone for SocketWriter<P> {
    fn clone(&self) -> Self {
        SocketWriter { tx: self.tx.clone() }
    }
}

impl<P: WirePacket> SocketWriter<P> {
    /// Takes ownership of the write half and spawns the drain task.
    pub fn spawn<W>(mut write_half: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob<P>>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let bytes = match job {
                    WriteJob::Packet { packet, buf } => match buf {
                        Some(buf) => buf,
                        None => packet.serialize(),
                    },
                    WriteJob::Flush(ack) => {
                        if write_half.flush().await.is_ok() {
                            let _ = ack.send(());
                        }
                        continue;
                    }
                };
                if let Err(err) = write_half.write_all(&bytes).await {
                    log::error!("socket write error, dropping queue: {}", err);
                    return;
                }
            }
        });
        SocketWriter { tx }
    }

    /// Queues a packet. Fails once the writer task has died.
    pub fn send(&self, packet: P) -> SResult<()> {
        self.tx
            .send(WriteJob::Packet { packet, buf: None })
            .map_err(|_| Error::Io("connection writer closed".to_string()))
    }

    /// Queues a packet with its already-serialized bytes.
    pub fn send_serialized(&self, packet: P, buf: Bytes) -> SResult<()> {
        self.tx
            .send(WriteJob::Packet { packet, buf: Some(buf) })
            .map_err(|_| Error::Io("connection writer closed".to_string()))
    }

    /// Waits until everything queued so far has reached the socket.
    /// The worker drains its deregister packet through this before it
    /// closes the connection.
    pub async fn flushed(&self) -> SResult<()> {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(WriteJob::Flush(ack_tx))
            .map_err(|_| Error::Io("connection writer closed".to_string()))?;
        Ok(ack_rx.await?)
    }
}
