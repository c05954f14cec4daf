//! Peer wire messages and their framing.
//!
//! Every non-handshake message is `length: u32 BE` then `length` body
//! bytes; a zero length is a keep-alive. The body is one id byte plus a
//! payload. Ids this client does not know are carried as `Unknown` so a
//! peer speaking extensions does not kill the session.
use crate::peer::{PeerError, PeerResult};
use bytes::BufMut;

pub const MSG_CHOKE: u8 = 0;
pub const MSG_UNCHOKE: u8 = 1;
pub const MSG_INTERESTED: u8 = 2;
pub const MSG_NOT_INTERESTED: u8 = 3;
pub const MSG_HAVE: u8 = 4;
pub const MSG_BITFIELD: u8 = 5;
pub const MSG_REQUEST: u8 = 6;
pub const MSG_PIECE: u8 = 7;
pub const MSG_CANCEL: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Unknown(u8),
}

impl Message {
    pub fn id(&self) -> u8 {
        match self {
            Message::Choke => MSG_CHOKE,
            Message::Unchoke => MSG_UNCHOKE,
            Message::Interested => MSG_INTERESTED,
            Message::NotInterested => MSG_NOT_INTERESTED,
            Message::Have(_) => MSG_HAVE,
            Message::Bitfield(_) => MSG_BITFIELD,
            Message::Request { .. } => MSG_REQUEST,
            Message::Piece { .. } => MSG_PIECE,
            Message::Cancel { .. } => MSG_CANCEL,
            Message::Unknown(id) => *id,
        }
    }

    /// Serializes into a complete frame: length prefix, id, payload.
    pub fn to_frame(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut frame = Vec::with_capacity(4 + 1 + payload.len());
        frame.put_u32(payload.len() as u32 + 1);
        frame.put_u8(self.id());
        frame.extend_from_slice(&payload);
        frame
    }

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::Unknown(_) => {}
            Message::Have(index) => payload.put_u32(*index),
            Message::Bitfield(bits) => payload.extend_from_slice(bits),
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length } => {
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.extend_from_slice(block);
            }
        }
        payload
    }

    /// Parses a frame body (id byte plus payload, length prefix already
    /// stripped).
    pub fn parse(body: &[u8]) -> PeerResult<Message> {
        let (&id, payload) = body
            .split_first()
            .ok_or_else(|| PeerError::Malformed("empty frame body".to_string()))?;

        let msg = match id {
            MSG_CHOKE => Message::Choke,
            MSG_UNCHOKE => Message::Unchoke,
            MSG_INTERESTED => Message::Interested,
            MSG_NOT_INTERESTED => Message::NotInterested,
            MSG_HAVE => Message::Have(read_u32(payload, 0)?),
            MSG_BITFIELD => Message::Bitfield(payload.to_vec()),
            MSG_REQUEST => Message::Request {
                index: read_u32(payload, 0)?,
                begin: read_u32(payload, 4)?,
                length: read_u32(payload, 8)?,
            },
            MSG_PIECE => {
                if payload.len() < 8 {
                    return Err(PeerError::Malformed(format!(
                        "piece payload of {} bytes",
                        payload.len()
                    )));
                }
                Message::Piece {
                    index: read_u32(payload, 0)?,
                    begin: read_u32(payload, 4)?,
                    block: payload[8..].to_vec(),
                }
            }
            MSG_CANCEL => Message::Cancel {
                index: read_u32(payload, 0)?,
                begin: read_u32(payload, 4)?,
                length: read_u32(payload, 8)?,
            },
            other => Message::Unknown(other),
        };
        Ok(msg)
    }
}

fn read_u32(payload: &[u8], offset: usize) -> PeerResult<u32> {
    let bytes = payload
        .get(offset..offset + 4)
        .ok_or_else(|| PeerError::Malformed("truncated message payload".to_string()))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_layout() {
        let frame = Message::Request {
            index: 7,
            begin: 32768,
            length: 16384,
        }
        .to_frame();
        assert_eq!(
            frame,
            [
                0x00, 0x00, 0x00, 0x0D, 0x06, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x80, 0x00,
                0x00, 0x00, 0x40, 0x00
            ]
        );
    }

    #[test]
    fn interested_frame_layout() {
        assert_eq!(Message::Interested.to_frame(), [0, 0, 0, 1, 2]);
    }

    #[test]
    fn frame_roundtrip() {
        let messages = [
            Message::Choke,
            Message::Unchoke,
            Message::Have(42),
            Message::Bitfield(vec![0b1010_0000]),
            Message::Request {
                index: 1,
                begin: 2,
                length: 3,
            },
            Message::Piece {
                index: 9,
                begin: 16384,
                block: vec![0xEE; 32],
            },
            Message::Cancel {
                index: 1,
                begin: 2,
                length: 3,
            },
        ];
        for msg in messages {
            let frame = msg.to_frame();
            let parsed = Message::parse(&frame[4..]).unwrap();
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn unknown_id_is_tolerated() {
        let parsed = Message::parse(&[20, 1, 2, 3]).unwrap();
        assert_eq!(parsed, Message::Unknown(20));
    }

    #[test]
    fn truncated_have_is_malformed() {
        assert!(matches!(
            Message::parse(&[MSG_HAVE, 0, 1]),
            Err(PeerError::Malformed(_))
        ));
    }
}
