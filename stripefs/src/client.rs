//! Client library: builds file requests and talks to a worker (or a
//! router front) over dialect A.

use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use crate::error::{Error, SResult};
use crate::net::writer::SocketWriter;
use crate::uuid::FileId;
use crate::wire::client::{ClientCodec, ClientMsg, ClientPacket, FileRequest};

/// Interprets a worker reply body. `Error:`-prefixed bodies and the
/// legacy 4-byte `FAIL` indicator are failures; anything else is the
/// payload.
pub fn parse_reply(body: Vec<u8>) -> SResult<Vec<u8>> {
    if body == b"FAIL" {
        return Err(Error::Value("Error: legacy prepare abort".to_string()));
    }
    if body.starts_with(b"Error:") {
        let reason = String::from_utf8_lossy(&body).into_owned();
        return Err(Error::Value(reason));
    }
    Ok(body)
}

/// A connection to one worker's client-facing port.
pub struct Client {
    frames: FramedRead<tokio::net::tcp::OwnedReadHalf, ClientCodec>,
    writer: SocketWriter<ClientPacket>,
}

impl Client {
    pub async fn connect(addr: &str) -> SResult<Self> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        let (read_half, write_half) = socket.into_split();
        Ok(Client {
            frames: FramedRead::new(read_half, ClientCodec),
            writer: SocketWriter::spawn(write_half),
        })
    }

    /// Writes `data` at `position`. A clean `OK` is `Ok(())`; any
    /// `Error:`/`FAIL` body surfaces as an error with the reason.
    pub async fn write(&mut self, file: &FileId, position: u32, data: Vec<u8>) -> SResult<()> {
        let request = FileRequest::write(*file, position, data);
        let body = self.round_trip(*file, request).await?;
        let body = parse_reply(body)?;
        if body == b"OK" {
            Ok(())
        } else {
            Err(Error::UnexpectedPacket(format!(
                "write acknowledged with {:?}",
                String::from_utf8_lossy(&body)
            )))
        }
    }

    /// Reads `size` bytes at `position`.
    pub async fn read(&mut self, file: &FileId, position: u32, size: u32) -> SResult<Vec<u8>> {
        let request = FileRequest::read(*file, position, size);
        let body = self.round_trip(*file, request).await?;
        parse_reply(body)
    }

    async fn round_trip(&mut self, file: FileId, request: FileRequest) -> SResult<Vec<u8>> {
        let pack = ClientPacket::request(ClientMsg::Trigger, file, request.encode());
        self.writer.send(pack.clone())?;

        while let Some(frame) = self.frames.next().await {
            let resp = frame?;
            if resp.header.correlation() != pack.header.correlation() {
                log::debug!("uncorrelated packet skipped: {}", resp.header);
                continue;
            }
            return match resp.header.msg {
                ClientMsg::WorkerResponse => Ok(resp.data),
                ClientMsg::TriggerReject => {
                    Err(Error::Io("worker rejected the job, retry elsewhere".to_string()))
                }
                other => Err(Error::UnexpectedPacket(format!("{:?} in reply to trigger", other))),
            };
        }
        Err(Error::Io("worker closed the connection".to_string()))
    }
}
