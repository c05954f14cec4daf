//! The 68-byte BitTorrent handshake.
//!
//! First bytes on the wire in both directions: protocol string length,
//! the protocol string itself, eight reserved bytes, the info hash, and
//! the sender's peer id. The remote info hash must equal ours or the
//! connection is for some other torrent and is rejected.
use crate::peer::{PeerError, PeerResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const RESERVED_LEN: usize = 8;
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL.len() + RESERVED_LEN + 20 + 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Serializes into the fixed 68-byte wire form, reserved bytes zero.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads a handshake off the stream. A zero protocol length, a
    /// protocol string other than the v1 one, or a truncated stream all
    /// fail.
    pub async fn read<R>(stream: &mut R) -> PeerResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut length_buf = [0u8; 1];
        stream.read_exact(&mut length_buf).await?;
        let protocol_len = length_buf[0] as usize;
        if protocol_len == 0 {
            return Err(PeerError::HandshakeFail(
                "zero protocol string length".to_string(),
            ));
        }
        if protocol_len != PROTOCOL.len() {
            return Err(PeerError::HandshakeFail(format!(
                "protocol string length {protocol_len}"
            )));
        }

        let mut buf = [0u8; HANDSHAKE_LEN - 1];
        stream.read_exact(&mut buf).await?;

        if &buf[..PROTOCOL.len()] != PROTOCOL {
            return Err(PeerError::HandshakeFail(
                "unknown protocol string".to_string(),
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[27..47]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[47..67]);

        Ok(Self { info_hash, peer_id })
    }
}

/// Sends our handshake, reads the peer's, and checks the echoed info
/// hash. The caller owns the deadline around the whole exchange.
pub async fn exchange<S>(
    stream: &mut S,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> PeerResult<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::new(info_hash, peer_id);
    stream.write_all(&ours.serialize()).await?;

    let theirs = Handshake::read(stream).await?;
    if theirs.info_hash != info_hash {
        return Err(PeerError::HandshakeFail(format!(
            "info hash mismatch: {}",
            hex::encode(theirs.info_hash)
        )));
    }
    Ok(theirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_form_is_68_bytes() {
        let hs = Handshake::new([0xAB; 20], [0xCD; 20]);
        let buf = hs.serialize();
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &[0xAB; 20]);
        assert_eq!(&buf[48..68], &[0xCD; 20]);
    }

    #[tokio::test]
    async fn read_parses_serialized_form() {
        let hs = Handshake::new([0x11; 20], *b"-RM0001-abcdefghijkl");
        let mut stream = &hs.serialize()[..];
        let parsed = Handshake::read(&mut stream).await.unwrap();
        assert_eq!(parsed, hs);
    }

    #[tokio::test]
    async fn exchange_accepts_matching_info_hash() {
        let (mut local, mut remote) = tokio::io::duplex(256);
        let info_hash = [0x42; 20];

        let remote_task = tokio::spawn(async move {
            exchange(&mut remote, info_hash, [0x02; 20]).await
        });
        let theirs = exchange(&mut local, info_hash, [0x01; 20]).await.unwrap();
        assert_eq!(theirs.info_hash, info_hash);
        assert_eq!(theirs.peer_id, [0x02; 20]);
        remote_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn exchange_rejects_foreign_info_hash() {
        let (mut local, mut remote) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let _ = exchange(&mut remote, [0x99; 20], [0x02; 20]).await;
        });
        let err = exchange(&mut local, [0x42; 20], [0x01; 20])
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::HandshakeFail(_)));
    }

    #[tokio::test]
    async fn zero_protocol_length_is_rejected() {
        let mut stream = &[0u8; 68][..];
        assert!(matches!(
            Handshake::read(&mut stream).await,
            Err(PeerError::HandshakeFail(_))
        ));
    }
}
