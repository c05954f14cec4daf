//! Metainfo record extraction.
//!
//! The mapping from bencode dicts to the typed record is written by hand,
//! one small decoder per record shape: unknown keys are ignored, missing
//! keys leave their field at the zero value, and a present key with the
//! wrong shape is a type error. Single- and multi-file info dicts share
//! all keys except `length`/`files`, so both shapes are read from the
//! same dictionary level.
use crate::bencode::{decoder, BencodeValue};
use crate::torrent::info_hash;
use crate::torrent::{TorrentError, TorrentResult};
use std::collections::HashMap;
use std::path::Path;

const SHA_LEN: usize = 20;

/// Everything the client needs from a .torrent file.
///
/// Built once at parse time and read-only afterwards; in particular
/// `info_hash` is fixed here and never recomputed.
#[derive(Debug, PartialEq, Clone)]
pub struct Metainfo {
    /// Primary tracker URL, when present.
    pub announce: Option<String>,
    /// Secondary trackers from `announce-list`, flattened in order and
    /// deduplicated by string equality.
    pub announce_list: Vec<String>,
    pub info_hash: [u8; SHA_LEN],
    /// Suggested output name.
    pub name: String,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; SHA_LEN]>,
    pub total_length: u64,
    /// Per-file entries; empty in single-file mode.
    pub files: Vec<FileEntry>,
    pub multi_file: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

type Dict = HashMap<Vec<u8>, BencodeValue>;

fn get_str(dict: &Dict, key: &[u8]) -> TorrentResult<Option<String>> {
    match dict.get(key) {
        Some(v) => Ok(Some(v.as_str()?.to_string())),
        None => Ok(None),
    }
}

fn get_int(dict: &Dict, key: &[u8]) -> TorrentResult<Option<i64>> {
    match dict.get(key) {
        Some(v) => Ok(Some(v.as_int()?)),
        None => Ok(None),
    }
}

fn get_bytes<'a>(dict: &'a Dict, key: &[u8]) -> TorrentResult<Option<&'a [u8]>> {
    match dict.get(key) {
        Some(v) => Ok(Some(v.as_bytes()?)),
        None => Ok(None),
    }
}

fn non_negative(value: i64, what: &str) -> TorrentResult<u64> {
    u64::try_from(value).map_err(|_| TorrentError::Malformed(format!("negative {what}")))
}

/// Splits the `pieces` blob into 20-byte digests, in piece-index order.
fn parse_piece_hashes(pieces: &[u8]) -> TorrentResult<Vec<[u8; SHA_LEN]>> {
    if pieces.len() % SHA_LEN != 0 {
        return Err(TorrentError::Malformed(
            "pieces length is not a multiple of 20".to_string(),
        ));
    }
    Ok(pieces
        .chunks_exact(SHA_LEN)
        .map(|chunk| {
            let mut hash = [0u8; SHA_LEN];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// Flattens `announce-list` (a list of tiers, each a list of URLs) in
/// order, dropping string-equal duplicates.
fn parse_announce_list(value: &BencodeValue) -> TorrentResult<Vec<String>> {
    let mut urls = Vec::new();
    for tier in value.as_list()? {
        for tracker in tier.as_list()? {
            let url = tracker.as_str()?.to_string();
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }
    Ok(urls)
}

fn parse_file_entry(value: &BencodeValue) -> TorrentResult<FileEntry> {
    let dict = value.as_dict()?;
    let length = non_negative(get_int(dict, b"length")?.unwrap_or(0), "file length")?;
    let mut path = Vec::new();
    if let Some(segments) = dict.get(b"path".as_slice()) {
        for segment in segments.as_list()? {
            path.push(segment.as_str()?.to_string());
        }
    }
    Ok(FileEntry { length, path })
}

impl Metainfo {
    pub fn from_file(path: impl AsRef<Path>) -> TorrentResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    #[tracing::instrument(skip(bytes), level = "debug")]
    pub fn from_bytes(bytes: &[u8]) -> TorrentResult<Self> {
        let (root, _) = decoder::decode(bytes)?;
        Self::from_value(&root)
    }

    fn from_value(root: &BencodeValue) -> TorrentResult<Self> {
        let dict = root.as_dict()?;

        let announce = get_str(dict, b"announce")?;
        let announce_list = match dict.get(b"announce-list".as_slice()) {
            Some(value) => parse_announce_list(value)?,
            None => Vec::new(),
        };

        let info = dict
            .get(b"info".as_slice())
            .ok_or_else(|| TorrentError::Malformed("missing info dictionary".to_string()))?;
        let info_dict = info.as_dict()?;

        let name = get_str(info_dict, b"name")?.unwrap_or_default();
        let piece_length = non_negative(
            get_int(info_dict, b"piece length")?.unwrap_or(0),
            "piece length",
        )?;
        let pieces = get_bytes(info_dict, b"pieces")?.unwrap_or_default();
        let piece_hashes = parse_piece_hashes(pieces)?;

        // Single-file and multi-file shapes differ only in length/files.
        let multi_file = info_dict.contains_key(b"files".as_slice());
        let (total_length, files) = if multi_file {
            let mut files = Vec::new();
            for entry in info_dict[b"files".as_slice()].as_list()? {
                files.push(parse_file_entry(entry)?);
            }
            (files.iter().map(|f| f.length).sum(), files)
        } else {
            let length = non_negative(get_int(info_dict, b"length")?.unwrap_or(0), "length")?;
            (length, Vec::new())
        };

        let metainfo = Metainfo {
            announce,
            announce_list,
            info_hash: info_hash::calculate_info_hash(info)?,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            multi_file,
        };
        metainfo.validate()?;
        Ok(metainfo)
    }

    /// Piece digests must cover exactly the payload: the last piece may be
    /// short, but never empty and never more than `piece_length`.
    fn validate(&self) -> TorrentResult<()> {
        let count = self.piece_hashes.len() as u64;
        if count == 0 {
            return Err(TorrentError::Malformed("no pieces".to_string()));
        }
        let covered = count.checked_mul(self.piece_length).ok_or_else(|| {
            TorrentError::Malformed("piece length overflow".to_string())
        })?;
        if covered < self.total_length || self.total_length <= (count - 1) * self.piece_length {
            return Err(TorrentError::Malformed(format!(
                "{count} pieces of {} bytes cannot cover {} bytes",
                self.piece_length, self.total_length
            )));
        }
        Ok(())
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`; equal to `piece_length` for all but
    /// possibly the last piece.
    pub fn piece_size(&self, index: usize) -> u64 {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.total_length);
        end.saturating_sub(begin)
    }

    /// Primary announce URL followed by the flattened announce list, with
    /// string-equal duplicates removed.
    pub fn tracker_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(announce) = &self.announce {
            urls.push(announce.clone());
        }
        for url in &self.announce_list {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    // Canonical single-file metainfo: two pieces of 4 bytes covering a
    // 7-byte payload.
    fn sample_torrent() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"d8:announce21:http://tr.example/ann4:info");
        bytes.extend_from_slice(&sample_info());
        bytes.push(b'e');
        bytes
    }

    fn sample_info() -> Vec<u8> {
        let mut info = Vec::new();
        info.extend_from_slice(b"d6:lengthi7e4:name4:demo12:piece lengthi4e6:pieces40:");
        info.extend_from_slice(&[0x11; 20]);
        info.extend_from_slice(&[0x22; 20]);
        info.push(b'e');
        info
    }

    #[test]
    fn parses_single_file() {
        let meta = Metainfo::from_bytes(&sample_torrent()).unwrap();
        assert_eq!(meta.announce.as_deref(), Some("http://tr.example/ann"));
        assert_eq!(meta.name, "demo");
        assert_eq!(meta.piece_length, 4);
        assert_eq!(meta.total_length, 7);
        assert_eq!(meta.piece_hashes, vec![[0x11; 20], [0x22; 20]]);
        assert!(!meta.multi_file);
        assert!(meta.files.is_empty());
    }

    #[test]
    fn info_hash_matches_canonical_bytes() {
        let meta = Metainfo::from_bytes(&sample_torrent()).unwrap();
        let expected: [u8; 20] = Sha1::digest(sample_info()).into();
        assert_eq!(meta.info_hash, expected);
    }

    #[test]
    fn info_hash_is_stable_across_parses() {
        let bytes = sample_torrent();
        let first = Metainfo::from_bytes(&bytes).unwrap();
        let second = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(first.info_hash, second.info_hash);
    }

    #[test]
    fn piece_sizes_cover_total_length() {
        let meta = Metainfo::from_bytes(&sample_torrent()).unwrap();
        assert_eq!(meta.piece_size(0), 4);
        assert_eq!(meta.piece_size(1), 3);
        let total: u64 = (0..meta.piece_count()).map(|i| meta.piece_size(i)).sum();
        assert_eq!(total, meta.total_length);
    }

    #[test]
    fn parses_multi_file() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"d8:announce21:http://tr.example/ann4:info");
        bytes.extend_from_slice(b"d5:filesl");
        bytes.extend_from_slice(b"d6:lengthi5e4:pathl1:a3:txtee");
        bytes.extend_from_slice(b"d6:lengthi2e4:pathl1:bee");
        bytes.extend_from_slice(b"e4:name4:demo12:piece lengthi4e6:pieces40:");
        bytes.extend_from_slice(&[0x11; 20]);
        bytes.extend_from_slice(&[0x22; 20]);
        bytes.extend_from_slice(b"ee");

        let meta = Metainfo::from_bytes(&bytes).unwrap();
        assert!(meta.multi_file);
        assert_eq!(meta.total_length, 7);
        assert_eq!(meta.files.len(), 2);
        assert_eq!(meta.files[0].path, vec!["a".to_string(), "txt".to_string()]);
    }

    #[test]
    fn announce_list_is_flattened_and_deduped() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"d8:announce21:http://tr.example/ann13:announce-list");
        bytes.extend_from_slice(b"ll20:udp://u.example:6969el21:http://tr.example/ann20:udp://u.example:6969ee");
        bytes.extend_from_slice(b"4:info");
        bytes.extend_from_slice(&sample_info());
        bytes.push(b'e');

        let meta = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(meta.announce_list, vec![
            "udp://u.example:6969".to_string(),
            "http://tr.example/ann".to_string(),
        ]);
        // Combined list keeps the primary announce first and drops the
        // repeat from the tier list.
        assert_eq!(meta.tracker_urls(), vec![
            "http://tr.example/ann".to_string(),
            "udp://u.example:6969".to_string(),
        ]);
    }

    #[test]
    fn rejects_ragged_pieces_blob() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"d4:infod6:lengthi7e4:name4:demo12:piece lengthi4e6:pieces19:");
        bytes.extend_from_slice(&[0x11; 19]);
        bytes.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&bytes),
            Err(TorrentError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_uncovered_length() {
        // Two 4-byte pieces cannot cover 9 bytes.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"d4:infod6:lengthi9e4:name4:demo12:piece lengthi4e6:pieces40:");
        bytes.extend_from_slice(&[0x11; 40]);
        bytes.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&bytes),
            Err(TorrentError::Malformed(_))
        ));
    }
}
