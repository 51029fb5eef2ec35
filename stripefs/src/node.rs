//! The storage-node protocol server.
//!
//! Accepts TCP connections and runs one dispatch loop per connection:
//! read a dialect-B frame, hand it to the block store, queue the
//! response on the connection's ordered writer. Inbound frames on one
//! connection are handled in arrival order and responses leave in the
//! same order.

use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use crate::block::{BlockStore, PrepareOutcome};
use crate::error::SResult;
use crate::net::writer::SocketWriter;
use crate::storage::engine::Engine;
use crate::wire::node::{NodeCodec, NodeMsg, NodePacket};

/// Serves the block store on the given listener until the task is
/// dropped or the listener fails.
pub async fn serve<E: Engine>(listener: TcpListener, store: BlockStore<E>) -> SResult<()> {
    let local = listener.local_addr()?;
    log::info!("storage node listening on {}", local);

    let mut incoming = TcpListenerStream::new(listener);
    while let Some(conn) = incoming.next().await {
        match conn {
            Ok(socket) => {
                let store = store.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(socket, store).await {
                        log::error!("node connection ended: {}", err);
                    }
                });
            }
            Err(err) => log::error!("accept error: {}", err),
        }
    }
    Ok(())
}

async fn serve_connection<E: Engine>(socket: TcpStream, store: BlockStore<E>) -> SResult<()> {
    socket.set_nodelay(true)?;
    let peer = socket.peer_addr()?;
    log::debug!("node connection from {}", peer);

    let (read_half, write_half) = socket.into_split();
    let mut frames = FramedRead::new(read_half, NodeCodec);
    let writer: SocketWriter<NodePacket> = SocketWriter::spawn(write_half);

    while let Some(frame) = frames.next().await {
        let pack = match frame {
            Ok(pack) => pack,
            Err(err) => {
                // Decode errors poison the stream; close the connection.
                log::error!("decode error from {}: {}", peer, err);
                break;
            }
        };
        let resp = handle_packet(&store, &pack);
        writer.send(resp)?;
    }
    Ok(())
}

/// Dispatches one request to the block store and builds its response.
/// Network errors never reach here; KV errors surface as `Err` packets
/// and do not mutate state beyond what the store already applied.
pub fn handle_packet<E: Engine>(store: &BlockStore<E>, pack: &NodePacket) -> NodePacket {
    let uuid = pack.header.uuid;
    let block_id = pack.header.block_id;

    match pack.header.msg {
        NodeMsg::Prepare | NodeMsg::PrepareQuick => {
            match store.prepare(&uuid, block_id, pack.header.position, &pack.data, pack.header.version)
            {
                Ok(PrepareOutcome::Agree { committed }) => {
                    let mut resp = pack.reply(NodeMsg::PrepareAgree, Vec::new());
                    resp.header.version = committed;
                    resp
                }
                Ok(PrepareOutcome::Abort { committed }) => {
                    log::debug!("prepare abort for {} blk={}, committed v{}", uuid, block_id, committed);
                    let mut resp = pack.reply(NodeMsg::PrepareAbort, Vec::new());
                    resp.header.version = committed;
                    resp
                }
                Err(err) => {
                    log::error!("prepare failed for {} blk={}: {}", uuid, block_id, err);
                    pack.reply(NodeMsg::Err, err.to_reply())
                }
            }
        }

        NodeMsg::CommitExecute => match store.commit(&uuid, block_id) {
            Ok(()) => pack.reply(NodeMsg::CommitAck, Vec::new()),
            Err(err) => {
                log::error!("commit failed for {} blk={}: {}", uuid, block_id, err);
                pack.reply(NodeMsg::Err, err.to_reply())
            }
        },

        NodeMsg::CommitRollback => match store.rollback(&uuid, block_id) {
            Ok(()) => pack.reply(NodeMsg::CommitAck, Vec::new()),
            Err(err) => {
                log::error!("rollback failed for {} blk={}: {}", uuid, block_id, err);
                pack.reply(NodeMsg::Err, err.to_reply())
            }
        },

        NodeMsg::Replication => {
            match store.replicate(&uuid, block_id, pack.header.position, &pack.data) {
                Ok(()) => pack.reply(NodeMsg::Ack, Vec::new()),
                Err(err) => {
                    log::error!("replication failed for {} blk={}: {}", uuid, block_id, err);
                    pack.reply(NodeMsg::Err, err.to_reply())
                }
            }
        }

        NodeMsg::Get => {
            match store.get(&uuid, block_id, pack.header.position, pack.header.data_size) {
                Ok(payload) => pack.reply(NodeMsg::Ack, payload),
                Err(err) => {
                    log::error!("get failed for {} blk={}: {}", uuid, block_id, err);
                    pack.reply(NodeMsg::Err, err.to_reply())
                }
            }
        }

        // A server never receives responses; answer Err and keep going.
        NodeMsg::Err
        | NodeMsg::Ack
        | NodeMsg::PrepareAgree
        | NodeMsg::PrepareAbort
        | NodeMsg::CommitAck => {
            log::error!("server should not get {:?} from a client: {}", pack.header.msg, pack.header);
            pack.reply(NodeMsg::Err, Vec::new())
        }
    }
}
