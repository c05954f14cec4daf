//! A single peer TCP session.
//!
//! `PeerConn::connect` runs the fixed connection preamble: TCP connect
//! and handshake under a 3 s deadline each, then the mandatory bitfield
//! within 5 s. After that the connection belongs to one download worker,
//! which reads and writes framed messages sequentially.
use crate::peer::{handshake, Bitfield, Message, PeerError, PeerResult};
use crate::tracker::PeerEndpoint;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a frame body. The largest legitimate frame is a
/// bitfield for a very large torrent; anything past this is a protocol
/// violation, not data.
const MAX_FRAME_LEN: u32 = 1 << 20;

pub struct PeerConn {
    stream: TcpStream,
    /// Peers start out choking us.
    pub choked: bool,
    pub bitfield: Bitfield,
    /// Remote peer id from the handshake, informational only.
    pub peer_id: [u8; 20],
}

impl PeerConn {
    /// Dials the peer and runs handshake + bitfield preamble.
    #[tracing::instrument(skip(info_hash, peer_id), fields(peer = %endpoint), level = "debug")]
    pub async fn connect(
        endpoint: PeerEndpoint,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        piece_count: usize,
    ) -> PeerResult<Self> {
        let mut stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(endpoint.addr()))
            .await
            .map_err(|_| PeerError::Timeout)??;

        let theirs = timeout(
            HANDSHAKE_TIMEOUT,
            handshake::exchange(&mut stream, info_hash, peer_id),
        )
        .await
        .map_err(|_| PeerError::Timeout)??;

        let first = timeout(BITFIELD_TIMEOUT, read_message(&mut stream))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let bitfield = match first {
            Some(Message::Bitfield(payload)) => Bitfield::from_payload(&payload),
            _ => return Err(PeerError::BitfieldExpected),
        };
        if bitfield.len() < Bitfield::expected_len(piece_count) {
            return Err(PeerError::Malformed(format!(
                "bitfield of {} bytes for {piece_count} pieces",
                bitfield.len()
            )));
        }

        tracing::debug!(peer = %endpoint, "connection established");
        Ok(Self {
            stream,
            choked: true,
            bitfield,
            peer_id: theirs.peer_id,
        })
    }

    /// Reads one framed message; `None` is a keep-alive.
    pub async fn read_message(&mut self) -> PeerResult<Option<Message>> {
        read_message(&mut self.stream).await
    }

    pub async fn send(&mut self, msg: &Message) -> PeerResult<()> {
        write_message(&mut self.stream, msg).await
    }
}

/// Reads `length: u32 BE` then the body, and parses it. A zero length is
/// a keep-alive and yields `None`.
pub(crate) async fn read_message<R>(stream: &mut R) -> PeerResult<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let length = u32::from_be_bytes(len_buf);

    if length == 0 {
        return Ok(None);
    }
    if length > MAX_FRAME_LEN {
        return Err(PeerError::Malformed(format!("frame of {length} bytes")));
    }

    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).await?;
    Message::parse(&body).map(Some)
}

pub(crate) async fn write_message<W>(stream: &mut W, msg: &Message) -> PeerResult<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&msg.to_frame()).await?;
    Ok(())
}
