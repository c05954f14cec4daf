//! remora — a one-shot BitTorrent v1 leech client.
//!
//! Given a metainfo file, discover peers through HTTP and UDP trackers,
//! fetch every piece over the peer wire protocol, verify each against
//! its SHA-1 digest, and hand back the assembled payload.
pub mod bencode;
pub mod download;
pub mod peer;
pub mod torrent;
pub mod tracker;
