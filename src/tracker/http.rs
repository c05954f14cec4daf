//! HTTP(S) tracker announce.
use crate::tracker::{
    url_encode, AnnounceRequest, PeerEndpoint, TrackerError, TrackerResult, TRACKER_TIMEOUT,
};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use std::net::Ipv4Addr;
use url::Url;

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(default)]
    #[allow(dead_code)]
    interval: i64,
    #[serde(default)]
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    peers: Option<Peers>,
}

/// Trackers answer with either the compact 6-byte-per-peer string or the
/// older list-of-dicts form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(ByteBuf),
    NonCompact(Vec<PeerDict>),
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

/// One announce round trip: GET with the binary params percent-encoded
/// byte-for-byte, bencoded response body.
#[tracing::instrument(skip(request), level = "debug")]
pub async fn announce(url: &Url, request: &AnnounceRequest) -> TrackerResult<Vec<PeerEndpoint>> {
    let url = build_announce_url(url, request);

    let client = reqwest::Client::builder().timeout(TRACKER_TIMEOUT).build()?;
    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            TrackerError::Timeout
        } else {
            TrackerError::Http(e)
        }
    })?;

    if !response.status().is_success() {
        return Err(TrackerError::Reject(response.status().to_string()));
    }

    let body = response.bytes().await?;
    parse_response(&body)
}

/// The query string is assembled by hand: `info_hash` and `peer_id` are
/// raw bytes, and typed query builders would re-encode the percent
/// escapes.
fn build_announce_url(base: &Url, request: &AnnounceRequest) -> Url {
    let mut url = base.clone();
    let params = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        url_encode(&request.info_hash),
        url_encode(&request.peer_id),
        request.port,
        request.left,
    );
    let query = match url.query() {
        Some(existing) => format!("{existing}&{params}"),
        None => params,
    };
    url.set_query(Some(&query));
    url
}

fn parse_response(bytes: &[u8]) -> TrackerResult<Vec<PeerEndpoint>> {
    let response: TrackerResponse = serde_bencode::from_bytes(bytes)?;

    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Reject(reason));
    }

    match response.peers {
        Some(Peers::Compact(bytes)) => PeerEndpoint::from_compact(&bytes),
        Some(Peers::NonCompact(dicts)) => Ok(dicts
            .into_iter()
            .filter_map(|dict| {
                // IPv6 entries in the dict form are outside this client.
                dict.ip
                    .parse::<Ipv4Addr>()
                    .ok()
                    .map(|ip| PeerEndpoint { ip, port: dict.port })
            })
            .collect()),
        None => Err(TrackerError::MalformedResponse(
            "response has no peers".to_string(),
        )),
    }
}
