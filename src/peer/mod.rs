//! Peer wire protocol: handshake, framed messages, bitfield, and the
//! per-peer connection state.
//!
//! A `PeerConn` is owned by exactly one download worker for the lifetime
//! of its TCP session; nothing here is shared across workers.
use thiserror::Error;

pub mod bitfield;
pub mod connection;
pub mod handshake;
pub mod message;

pub use bitfield::Bitfield;
pub use connection::PeerConn;
pub use message::Message;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("handshake failed: {0}")]
    HandshakeFail(String),

    #[error("expected bitfield as first message")]
    BitfieldExpected,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("bad piece frame: {0}")]
    BadPieceFrame(String),

    #[error("peer timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
