//! Metainfo (.torrent) loading.
//!
//! A metainfo file is a bencoded dictionary. This module extracts the
//! typed record the rest of the client works from, derives the info hash,
//! and splits the `pieces` blob into per-piece SHA-1 digests.
use thiserror::Error;
pub mod file;
pub mod info_hash;

pub use file::{FileEntry, Metainfo};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed metainfo: {0}")]
    Malformed(String),
}

pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
