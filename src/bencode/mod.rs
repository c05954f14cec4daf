//! Bencode value tree and codec.
//!
//! Bencode is the BitTorrent metadata encoding: byte strings, integers,
//! lists, and dictionaries with byte-string keys. Metainfo files and HTTP
//! tracker responses are bencoded dictionaries; the info hash that
//! identifies a torrent is the SHA-1 of the canonical re-emission of one
//! such dictionary, which is why the encoder must emit dictionary keys in
//! lexicographic raw-byte order.
use std::collections::HashMap;
use thiserror::Error;
pub mod decoder;
pub mod encoder;

/// A decoded bencode value.
///
/// Strings are raw bytes, not UTF-8: the `pieces` blob and the compact
/// peer list are binary payloads carried in bencode strings.
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(HashMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    /// The raw bytes of a string value.
    pub fn as_bytes(&self) -> BencodeResult<&[u8]> {
        match self {
            BencodeValue::String(s) => Ok(s),
            _ => Err(BencodeError::WrongType),
        }
    }

    /// A string value as UTF-8 text.
    pub fn as_str(&self) -> BencodeResult<&str> {
        std::str::from_utf8(self.as_bytes()?).map_err(|_| BencodeError::WrongType)
    }

    pub fn as_int(&self) -> BencodeResult<i64> {
        match self {
            BencodeValue::Integer(i) => Ok(*i),
            _ => Err(BencodeError::WrongType),
        }
    }

    pub fn as_list(&self) -> BencodeResult<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Ok(l),
            _ => Err(BencodeError::WrongType),
        }
    }

    pub fn as_dict(&self) -> BencodeResult<&HashMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Ok(d),
            _ => Err(BencodeError::WrongType),
        }
    }
}

/// Errors produced by the bencode codec.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("expected digit")]
    ExpectDigit,

    #[error("expected ':'")]
    ExpectColon,

    #[error("expected 'i'")]
    ExpectI,

    #[error("expected 'e'")]
    ExpectE,

    #[error("wrong type")]
    WrongType,

    #[error("invalid bencode: {0}")]
    Invalid(String),

    #[error("unexpected end of input")]
    UnexpectedEof,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
