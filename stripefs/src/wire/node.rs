//! Dialect B: the worker↔storage-node packet format.
//!
//! Header layout (big-endian):
//!
//! ```text
//! type     : u16
//! uuid     : 32 bytes
//! blockid  : u32
//! position : u16
//! datasize : u32
//! salt     : 4 bytes
//! version  : u64
//! ```
//!
//! `version` rides in the header: prepares carry the candidate version,
//! abort responses report the node's committed version, every other
//! message sends 0.
//!
//! `datasize` is the length of the body that follows, except on a
//! `Get` request: that one is header-only and uses `datasize` as the
//! requested read size. The `Ack` answering it carries the returned
//! bytes as a normal length-prefixed body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, SResult};
use crate::uuid::{FileId, FILE_ID_LEN};
use crate::version::Version;
use crate::wire::{gen_salt, SALT_LEN};

/// Serialized header size in bytes.
pub const HEADER_LEN: usize = 2 + FILE_ID_LEN + 4 + 2 + 4 + SALT_LEN + 8;

/// Upper bound on a body. Bodies hold at most one block plus slack;
/// anything larger is a corrupt or hostile frame.
pub const MAX_DATA_LEN: u32 = 16 * 1024 * 1024;

/// Message types understood by the storage node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NodeMsg {
    Err = 0,
    Ack = 1,
    Get = 2,
    Prepare = 8,
    /// Same semantics as `Prepare`; the node may skip structural
    /// precondition checks for a file it has already admitted.
    PrepareQuick = 9,
    PrepareAgree = 10,
    PrepareAbort = 11,
    CommitExecute = 12,
    CommitRollback = 13,
    CommitAck = 14,
    Replication = 15,
}

impl NodeMsg {
    pub fn from_u16(raw: u16) -> SResult<Self> {
        Ok(match raw {
            0 => NodeMsg::Err,
            1 => NodeMsg::Ack,
            2 => NodeMsg::Get,
            8 => NodeMsg::Prepare,
            9 => NodeMsg::PrepareQuick,
            10 => NodeMsg::PrepareAgree,
            11 => NodeMsg::PrepareAbort,
            12 => NodeMsg::CommitExecute,
            13 => NodeMsg::CommitRollback,
            14 => NodeMsg::CommitAck,
            15 => NodeMsg::Replication,
            other => return Err(Error::Decode(format!("unknown node message type {}", other))),
        })
    }
}

/// A dialect-B packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHeader {
    pub msg: NodeMsg,
    pub uuid: FileId,
    pub block_id: u32,
    pub position: u16,
    pub data_size: u32,
    pub salt: [u8; SALT_LEN],
    pub version: Version,
}

impl NodeHeader {
    /// The correlation key: responses echo uuid, blockid and salt.
    pub fn correlation(&self) -> (FileId, u32, [u8; SALT_LEN]) {
        (self.uuid, self.block_id, self.salt)
    }

    /// Builds the response header for this request.
    pub fn reply(&self, msg: NodeMsg) -> NodeHeader {
        NodeHeader { msg, data_size: 0, ..*self }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u16(self.msg as u16);
        buf.put_slice(self.uuid.as_bytes());
        buf.put_u32(self.block_id);
        buf.put_u16(self.position);
        buf.put_u32(self.data_size);
        buf.put_slice(&self.salt);
        buf.put_u64(self.version);
    }

    pub fn decode(buf: &mut impl Buf) -> SResult<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(Error::Decode("short node header".to_string()));
        }
        let msg = NodeMsg::from_u16(buf.get_u16())?;
        let mut uuid = [0u8; FILE_ID_LEN];
        buf.copy_to_slice(&mut uuid);
        let block_id = buf.get_u32();
        let position = buf.get_u16();
        let data_size = buf.get_u32();
        let mut salt = [0u8; SALT_LEN];
        buf.copy_to_slice(&mut salt);
        let version = buf.get_u64();
        Ok(NodeHeader { msg, uuid: FileId(uuid), block_id, position, data_size, salt, version })
    }
}

impl std::fmt::Display for NodeHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[t={:?}|k={},blk={},pos={},salt={}|d={},v={}]",
            self.msg,
            self.uuid,
            self.block_id,
            self.position,
            hex_salt(&self.salt),
            self.data_size,
            self.version
        )
    }
}

pub(crate) fn hex_salt(salt: &[u8; SALT_LEN]) -> String {
    salt.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A dialect-B packet: header plus opaque body.
#[derive(Clone, Debug, PartialEq)]
pub struct NodePacket {
    pub header: NodeHeader,
    pub data: Vec<u8>,
}

impl NodePacket {
    pub fn new(header: NodeHeader, data: Vec<u8>) -> Self {
        let mut header = header;
        header.data_size = data.len() as u32;
        NodePacket { header, data }
    }

    /// Builds a request with a fresh salt. `data_size` is the operand
    /// size: callers attach a body with [`NodePacket::with_data`], which
    /// overwrites it, except for `Get` where it stays the read size.
    pub fn request(
        msg: NodeMsg,
        uuid: FileId,
        block_id: u32,
        position: u16,
        data_size: u32,
        version: Version,
    ) -> Self {
        NodePacket {
            header: NodeHeader {
                msg,
                uuid,
                block_id,
                position,
                data_size,
                salt: gen_salt(),
                version,
            },
            data: Vec::new(),
        }
    }

    /// Attaches a body and keeps `datasize` in step with it.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.header.data_size = data.len() as u32;
        self.data = data;
        self
    }

    /// Builds the reply to this packet: echoed header, new type, body.
    pub fn reply(&self, msg: NodeMsg, data: Vec<u8>) -> Self {
        let mut header = self.header;
        header.msg = msg;
        header.data_size = data.len() as u32;
        NodePacket { header, data }
    }

    /// Serializes header and body into one buffer. The header goes out
    /// as constructed; everywhere but a `Get` request its `datasize`
    /// equals the body length.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// Framing codec for dialect-B connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeCodec;

impl Decoder for NodeCodec {
    type Item = NodePacket;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> SResult<Option<NodePacket>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        // Peek type and datasize without consuming the header.
        let msg = NodeMsg::from_u16(u16::from_be_bytes([src[0], src[1]]))?;
        let size_at = 2 + FILE_ID_LEN + 4 + 2;
        let data_size = u32::from_be_bytes([
            src[size_at],
            src[size_at + 1],
            src[size_at + 2],
            src[size_at + 3],
        ]);
        if data_size > MAX_DATA_LEN {
            return Err(Error::Decode(format!("body of {} bytes exceeds limit", data_size)));
        }
        // Get requests are header-only; datasize is the read size.
        let body_len = if msg == NodeMsg::Get { 0 } else { data_size as usize };
        let total = HEADER_LEN + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(total);
        let header = NodeHeader::decode(&mut frame)?;
        Ok(Some(NodePacket { header, data: frame.to_vec() }))
    }
}

impl Encoder<NodePacket> for NodeCodec {
    type Error = Error;

    fn encode(&mut self, item: NodePacket, dst: &mut BytesMut) -> SResult<()> {
        dst.extend_from_slice(&item.serialize());
        Ok(())
    }
}
