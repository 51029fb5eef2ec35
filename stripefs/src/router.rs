//! Proxy-side request routing (boundary component).
//!
//! A sorted ring of 32-byte proxy ids maps every file id to the proxy
//! owning it: the first ring id at or after the file id, wrapping
//! around at the top. The router forwards client packets unchanged to
//! the endpoint registered for the owning id and relays the response.
//! Load balancing, keepalive policy, and worker launching live
//! elsewhere and are not part of this crate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use crate::error::{Error, SResult};
use crate::net::writer::SocketWriter;
use crate::uuid::FileId;
use crate::wire::client::{encode_endpoint, ClientCodec, ClientMsg, ClientPacket};

/// The sorted ring of proxy ids.
#[derive(Clone, Debug, Default)]
pub struct Ring {
    ids: Vec<FileId>,
}

impl Ring {
    pub fn new() -> Self {
        Ring { ids: Vec::new() }
    }

    /// Adds an id, keeping the ring sorted. Returns false if present.
    pub fn insert(&mut self, id: FileId) -> bool {
        match self.ids.binary_search(&id) {
            Ok(_) => false,
            Err(at) => {
                self.ids.insert(at, id);
                true
            }
        }
    }

    /// Removes an id. Returns false if absent.
    pub fn remove(&mut self, id: &FileId) -> bool {
        match self.ids.binary_search(id) {
            Ok(at) => {
                self.ids.remove(at);
                true
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The owning id for a key: its successor on the ring, wrapping
    /// past the highest id back to the lowest.
    pub fn successor(&self, key: &FileId) -> Option<FileId> {
        if self.ids.is_empty() {
            return None;
        }
        match self.ids.binary_search(key) {
            Ok(at) => Some(self.ids[at]),
            Err(at) if at == self.ids.len() => Some(self.ids[0]),
            Err(at) => Some(self.ids[at]),
        }
    }
}

/// Routes client packets to the workers owned by ring members.
pub struct Router {
    ring: Mutex<Ring>,
    endpoints: Mutex<HashMap<FileId, SocketAddr>>,
}

impl Router {
    pub fn new() -> Self {
        Router { ring: Mutex::new(Ring::new()), endpoints: Mutex::new(HashMap::new()) }
    }

    /// Adds a proxy and the worker endpoint it fronts. Returns the
    /// `ProxyJoin` packet to announce to workers, or None if the id was
    /// already a member.
    pub fn join(&self, id: FileId, endpoint: SocketAddr) -> SResult<Option<ClientPacket>> {
        let fresh = self.ring.lock()?.insert(id);
        self.endpoints.lock()?.insert(id, endpoint);
        if !fresh {
            return Ok(None);
        }
        let ip = match endpoint {
            SocketAddr::V4(v4) => v4.ip().octets(),
            SocketAddr::V6(_) => return Err(Error::Value("ring endpoints must be ipv4".to_string())),
        };
        Ok(Some(ClientPacket::request(
            ClientMsg::ProxyJoin,
            id,
            encode_endpoint(ip, endpoint.port()),
        )))
    }

    pub fn leave(&self, id: &FileId) -> SResult<bool> {
        self.endpoints.lock()?.remove(id);
        Ok(self.ring.lock()?.remove(id))
    }

    /// The endpoint owning a file id.
    pub fn route(&self, file: &FileId) -> SResult<SocketAddr> {
        let owner = self
            .ring
            .lock()?
            .successor(file)
            .ok_or_else(|| Error::Value("ring is empty".to_string()))?;
        self.endpoints
            .lock()?
            .get(&owner)
            .copied()
            .ok_or_else(|| Error::Internal(format!("ring id {} has no endpoint", owner)))
    }

    /// Forwards a client packet unchanged to the owner of its key and
    /// returns the matching response.
    pub async fn forward(&self, pack: &ClientPacket) -> SResult<ClientPacket> {
        let target = self.route(&pack.header.key)?;
        log::debug!("forwarding {} to {}", pack.header, target);

        let socket = TcpStream::connect(target).await?;
        socket.set_nodelay(true)?;
        let (read_half, write_half) = socket.into_split();
        let mut frames = FramedRead::new(read_half, ClientCodec);
        let writer: SocketWriter<ClientPacket> = SocketWriter::spawn(write_half);

        // Forwarded bit-for-bit: the worker sees the client's packet.
        writer.send_serialized(pack.clone(), pack.serialize())?;

        while let Some(frame) = frames.next().await {
            let resp = frame?;
            if resp.header.correlation() == pack.header.correlation() {
                return Ok(resp);
            }
            log::debug!("uncorrelated response discarded: {}", resp.header);
        }
        Err(Error::Io("worker closed before responding".to_string()))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
