//! Tracker clients for peer discovery.
//!
//! Every tracker URL from the metainfo gets one announce attempt, HTTP
//! and UDP attempts running as parallel tasks that stream discovered
//! peers onto a shared channel. The aggregation loop dedups them by IP
//! and returns once every attempt has finished or the channel has gone
//! idle. Individual tracker failures are logged and absorbed; the phase
//! as a whole only fails when the final peer set is empty.
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

pub mod http;
pub mod udp;

pub const PEER_ID_LEN: usize = 20;
pub const SHA_LEN: usize = 20;

/// Deadline for a single tracker round trip.
pub const TRACKER_TIMEOUT: Duration = Duration::from_secs(5);
/// The aggregation loop returns once no tracker has produced a peer for
/// this long.
const RETRIEVE_PEERS_IDLE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no usable announce url")]
    NoAnnounceUrl,

    #[error("tracker timed out")]
    Timeout,

    #[error("tracker rejected announce: {0}")]
    Reject(String),

    #[error("malformed tracker response: {0}")]
    MalformedResponse(String),

    #[error("no peers discovered")]
    NoPeers,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("bencode deserialization error: {0}")]
    BencodeDe(#[from] serde_bencode::Error),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// An IPv4 peer address discovered through a tracker.
///
/// De-duplication across trackers keys on the textual IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// Parses a compact peer list: concatenated 6-byte records of
    /// `ipv4[4] || port[2]` big-endian. A trailing partial record makes
    /// the whole list malformed.
    pub fn from_compact(bytes: &[u8]) -> TrackerResult<Vec<PeerEndpoint>> {
        if bytes.len() % 6 != 0 {
            return Err(TrackerError::MalformedResponse(
                "compact peer list length is not a multiple of 6".to_string(),
            ));
        }
        Ok(bytes
            .chunks_exact(6)
            .map(|chunk| PeerEndpoint {
                ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
                port: u16::from_be_bytes([chunk[4], chunk[5]]),
            })
            .collect())
    }
}

impl std::fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parameters shared by every announce attempt for one download.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: [u8; SHA_LEN],
    pub peer_id: [u8; PEER_ID_LEN],
    pub port: u16,
    pub left: u64,
}

/// Announces to every tracker URL concurrently and returns the deduped
/// peer set.
#[tracing::instrument(skip(urls, request), fields(trackers = urls.len()), level = "debug")]
pub async fn retrieve_peers(
    urls: &[String],
    request: &AnnounceRequest,
) -> TrackerResult<Vec<PeerEndpoint>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut spawned = 0;

    for raw_url in urls {
        let url = match Url::parse(raw_url) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(url = %raw_url, error = %e, "skipping unparseable tracker url");
                continue;
            }
        };
        let scheme = url.scheme().to_string();
        let request = *request;
        let tx = tx.clone();
        match scheme.as_str() {
            "http" | "https" => {
                spawned += 1;
                tokio::spawn(async move {
                    match http::announce(&url, &request).await {
                        Ok(peers) => forward_peers(&url, peers, &tx),
                        Err(e) => tracing::warn!(url = %url, error = %e, "http announce failed"),
                    }
                });
            }
            "udp" => {
                spawned += 1;
                tokio::spawn(async move {
                    match udp::announce(&url, &request).await {
                        Ok(peers) => forward_peers(&url, peers, &tx),
                        Err(e) => tracing::warn!(url = %url, error = %e, "udp announce failed"),
                    }
                });
            }
            other => {
                tracing::warn!(url = %raw_url, scheme = %other, "unsupported tracker scheme");
            }
        }
    }
    drop(tx);

    if spawned == 0 {
        return Err(TrackerError::NoAnnounceUrl);
    }

    let peers = collect_peers(rx).await;
    if peers.is_empty() {
        return Err(TrackerError::NoPeers);
    }
    tracing::info!(peers = peers.len(), "peer discovery finished");
    Ok(peers)
}

fn forward_peers(
    url: &Url,
    peers: Vec<PeerEndpoint>,
    tx: &mpsc::UnboundedSender<PeerEndpoint>,
) {
    tracing::debug!(url = %url, peers = peers.len(), "tracker answered");
    for peer in peers {
        // Receiver may already have gone idle and hung up.
        if tx.send(peer).is_err() {
            break;
        }
    }
}

/// Drains the channel into an ip-keyed map until all producers are done
/// or nothing has arrived for `RETRIEVE_PEERS_IDLE`.
async fn collect_peers(mut rx: mpsc::UnboundedReceiver<PeerEndpoint>) -> Vec<PeerEndpoint> {
    let mut by_ip: HashMap<String, PeerEndpoint> = HashMap::new();
    loop {
        match timeout(RETRIEVE_PEERS_IDLE, rx.recv()).await {
            Ok(Some(peer)) => {
                by_ip.entry(peer.ip.to_string()).or_insert(peer);
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    by_ip.into_values().collect()
}

/// 20-byte peer id in the Azureus convention: client tag, then random
/// bytes. Generated fresh per run.
pub fn generate_peer_id() -> [u8; PEER_ID_LEN] {
    const TAG: &[u8] = b"-RM0001-";
    let mut rng = rand::rng();
    std::array::from_fn(|i| match TAG.get(i) {
        Some(&b) => b,
        None => rng.random(),
    })
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"-._~".contains(&byte)
}

/// Percent-encodes raw bytes for a query string, byte-for-byte. The
/// info hash and peer id are binary, so this cannot go through text
/// urlencoding.
pub(crate) fn url_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 3), |mut out, &b| {
            if is_unreserved(b) {
                out.push(b as char);
            } else {
                out.push_str(&format!("%{b:02X}"));
            }
            out
        })
}
