use crate::bencode::encoder;
use crate::bencode::BencodeValue;
use crate::torrent::TorrentResult;
use sha1::{Digest, Sha1};

/// SHA-1 of the canonical bencode re-emission of the `info` value.
///
/// The hash is taken over the full decoded value tree, so keys this
/// client does not otherwise use (`private`, md5 sums, ...) still count,
/// and a metainfo file that round-trips byte-exact produces the same
/// digest every other client computes.
pub fn calculate_info_hash(info: &BencodeValue) -> TorrentResult<[u8; 20]> {
    let encoded = encoder::encode_to_vec(info)?;

    let mut hasher = Sha1::new();
    hasher.update(&encoded);
    Ok(hasher.finalize().into())
}
