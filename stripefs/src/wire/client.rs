//! Dialect A: the client↔worker (and proxy↔worker) packet format.
//!
//! Header layout (big-endian):
//!
//! ```text
//! type     : u8
//! key      : 32 bytes (FileId)
//! sequence : 4 bytes
//! salt     : 4 bytes
//! datasize : u32
//! ```
//!
//! A file request body is a 1-byte subtype, a 1-byte op, the 32-byte
//! FileId again, `position: u32`, `size: u32`, then (for writes) `size`
//! payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, SResult};
use crate::uuid::{FileId, FILE_ID_LEN};
use crate::wire::node::hex_salt;
use crate::wire::{gen_salt, SALT_LEN};

/// Serialized header size in bytes.
pub const HEADER_LEN: usize = 1 + FILE_ID_LEN + 4 + SALT_LEN + 4;

/// Fixed part of a file-request body, before the write payload.
pub const FILE_REQUEST_LEN: usize = 1 + 1 + FILE_ID_LEN + 4 + 4;

/// Upper bound on a body.
pub const MAX_DATA_LEN: u32 = 64 * 1024 * 1024;

/// Message types of the client/worker dialect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientMsg {
    Err = 0,
    Put = 1,
    Get = 2,
    Ack = 3,
    ProxyJoin = 4,
    SetTimer = 5,
    WorkerReg = 8,
    WorkerDereg = 9,
    WorkerPushRequest = 10,
    WorkerResponse = 11,
    Trigger = 14,
    TriggerReject = 15,
    CacheTransfer = 16,
}

impl ClientMsg {
    pub fn from_u8(raw: u8) -> SResult<Self> {
        Ok(match raw {
            0 => ClientMsg::Err,
            1 => ClientMsg::Put,
            2 => ClientMsg::Get,
            3 => ClientMsg::Ack,
            4 => ClientMsg::ProxyJoin,
            5 => ClientMsg::SetTimer,
            8 => ClientMsg::WorkerReg,
            9 => ClientMsg::WorkerDereg,
            10 => ClientMsg::WorkerPushRequest,
            11 => ClientMsg::WorkerResponse,
            14 => ClientMsg::Trigger,
            15 => ClientMsg::TriggerReject,
            16 => ClientMsg::CacheTransfer,
            other => return Err(Error::Decode(format!("unknown client message type {}", other))),
        })
    }
}

/// A dialect-A packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientHeader {
    pub msg: ClientMsg,
    pub key: FileId,
    pub sequence: [u8; 4],
    pub salt: [u8; SALT_LEN],
    pub data_size: u32,
}

impl ClientHeader {
    /// A packet must be dispatched as a new job iff the last salt byte
    /// is zero.
    pub fn is_trigger(&self) -> bool {
        self.salt[SALT_LEN - 1] == 0
    }

    /// Key by which a response is matched back to its request.
    pub fn correlation(&self) -> (FileId, [u8; 4], [u8; SALT_LEN]) {
        (self.key, self.sequence, self.salt)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u8(self.msg as u8);
        buf.put_slice(self.key.as_bytes());
        buf.put_slice(&self.sequence);
        buf.put_slice(&self.salt);
        buf.put_u32(self.data_size);
    }

    pub fn decode(buf: &mut impl Buf) -> SResult<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(Error::Decode("short client header".to_string()));
        }
        let msg = ClientMsg::from_u8(buf.get_u8())?;
        let mut key = [0u8; FILE_ID_LEN];
        buf.copy_to_slice(&mut key);
        let mut sequence = [0u8; 4];
        buf.copy_to_slice(&mut sequence);
        let mut salt = [0u8; SALT_LEN];
        buf.copy_to_slice(&mut salt);
        let data_size = buf.get_u32();
        Ok(ClientHeader { msg, key: FileId(key), sequence, salt, data_size })
    }
}

impl std::fmt::Display for ClientHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[t={:?}|k={},seq={},salt={}|d={}]",
            self.msg,
            self.key,
            hex_salt(&self.sequence),
            hex_salt(&self.salt),
            self.data_size
        )
    }
}

/// A dialect-A packet.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientPacket {
    pub header: ClientHeader,
    pub data: Vec<u8>,
}

impl ClientPacket {
    pub fn new(header: ClientHeader, data: Vec<u8>) -> Self {
        let mut header = header;
        header.data_size = data.len() as u32;
        ClientPacket { header, data }
    }

    /// Builds a packet with fresh sequence and salt.
    pub fn request(msg: ClientMsg, key: FileId, data: Vec<u8>) -> Self {
        ClientPacket::new(
            ClientHeader {
                msg,
                key,
                sequence: gen_salt(),
                salt: gen_salt(),
                data_size: 0,
            },
            data,
        )
    }

    /// Builds the reply to this packet: echoed header, new type, body.
    pub fn reply(&self, msg: ClientMsg, data: Vec<u8>) -> Self {
        let mut header = self.header;
        header.msg = msg;
        ClientPacket::new(header, data)
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        let mut header = self.header;
        header.data_size = self.data.len() as u32;
        header.encode(&mut buf);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// File operations carried in a request body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FileOp {
    Write = 0,
    Read = 1,
}

/// Request subtypes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SubType {
    File = 0,
    Metadata = 1,
    Wakeup = 2,
    StorageTest = 3,
}

/// A parsed file request body.
#[derive(Clone, Debug, PartialEq)]
pub struct FileRequest {
    pub subtype: SubType,
    pub op: FileOp,
    pub uuid: FileId,
    pub position: u32,
    pub size: u32,
    /// Write payload; empty for reads.
    pub payload: Vec<u8>,
}

impl FileRequest {
    pub fn write(uuid: FileId, position: u32, payload: Vec<u8>) -> Self {
        FileRequest {
            subtype: SubType::File,
            op: FileOp::Write,
            uuid,
            position,
            size: payload.len() as u32,
            payload,
        }
    }

    pub fn read(uuid: FileId, position: u32, size: u32) -> Self {
        FileRequest { subtype: SubType::File, op: FileOp::Read, uuid, position, size, payload: Vec::new() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FILE_REQUEST_LEN + self.payload.len());
        buf.put_u8(self.subtype as u8);
        buf.put_u8(self.op as u8);
        buf.put_slice(self.uuid.as_bytes());
        buf.put_u32(self.position);
        buf.put_u32(self.size);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    pub fn decode(body: &[u8]) -> SResult<Self> {
        if body.len() < FILE_REQUEST_LEN {
            return Err(Error::Decode(format!("file request of {} bytes is too short", body.len())));
        }
        let mut buf = body;
        let subtype = match buf.get_u8() {
            0 => SubType::File,
            1 => SubType::Metadata,
            2 => SubType::Wakeup,
            3 => SubType::StorageTest,
            other => return Err(Error::Decode(format!("unknown request subtype {}", other))),
        };
        let op = match buf.get_u8() {
            0 => FileOp::Write,
            1 => FileOp::Read,
            other => return Err(Error::Decode(format!("unknown file op {}", other))),
        };
        let mut uuid = [0u8; FILE_ID_LEN];
        buf.copy_to_slice(&mut uuid);
        let position = buf.get_u32();
        let size = buf.get_u32();

        let payload = match op {
            FileOp::Write => {
                if buf.remaining() < size as usize {
                    return Err(Error::Decode(format!(
                        "write payload truncated: want {}, have {}",
                        size,
                        buf.remaining()
                    )));
                }
                buf[..size as usize].to_vec()
            }
            FileOp::Read => Vec::new(),
        };
        Ok(FileRequest { subtype, op, uuid: FileId(uuid), position, size, payload })
    }
}

/// Encodes an endpoint (ipv4 + port) as a 6-byte payload, used by both
/// `WorkerReg` and `ProxyJoin`.
pub fn encode_endpoint(ip: [u8; 4], port: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_slice(&ip);
    buf.put_u16(port);
    buf.to_vec()
}

pub fn decode_endpoint(body: &[u8]) -> SResult<([u8; 4], u16)> {
    if body.len() < 6 {
        return Err(Error::Decode("endpoint payload must be 6 bytes".to_string()));
    }
    let mut ip = [0u8; 4];
    ip.copy_from_slice(&body[..4]);
    let port = u16::from_be_bytes([body[4], body[5]]);
    Ok((ip, port))
}

/// Encodes a keepalive duration in milliseconds for `SetTimer`.
pub fn encode_wait_ms(ms: u32) -> Vec<u8> {
    ms.to_be_bytes().to_vec()
}

pub fn decode_wait_ms(body: &[u8]) -> SResult<u32> {
    if body.len() < 4 {
        return Err(Error::Decode("set_timer payload must be 4 bytes".to_string()));
    }
    Ok(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

/// Framing codec for dialect-A connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClientCodec;

impl Decoder for ClientCodec {
    type Item = ClientPacket;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> SResult<Option<ClientPacket>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let size_at = 1 + FILE_ID_LEN + 4 + SALT_LEN;
        let data_size = u32::from_be_bytes([
            src[size_at],
            src[size_at + 1],
            src[size_at + 2],
            src[size_at + 3],
        ]);
        if data_size > MAX_DATA_LEN {
            return Err(Error::Decode(format!("body of {} bytes exceeds limit", data_size)));
        }
        let total = HEADER_LEN + data_size as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(total);
        let header = ClientHeader::decode(&mut frame)?;
        Ok(Some(ClientPacket { header, data: frame.to_vec() }))
    }
}

impl Encoder<ClientPacket> for ClientCodec {
    type Error = Error;

    fn encode(&mut self, item: ClientPacket, dst: &mut BytesMut) -> SResult<()> {
        dst.extend_from_slice(&item.serialize());
        Ok(())
    }
}
