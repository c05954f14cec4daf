//! UDP tracker announce (BEP-15).
//!
//! Two rounds over one socket: a connect request that yields a
//! connection id, then the announce proper. Every datagram carries a
//! random transaction id that the response must echo; a datagram with
//! the wrong echo or action is retried a bounded number of times before
//! the tracker is discarded.
use crate::tracker::{
    AnnounceRequest, PeerEndpoint, TrackerError, TrackerResult, TRACKER_TIMEOUT,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::Cursor;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use url::Url;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
/// Datagrams with a bad transaction-id echo are retried this many times.
const ATTEMPTS: u32 = 3;

/// One full announce against a `udp://host:port` tracker.
#[tracing::instrument(skip(request), level = "debug")]
pub async fn announce(url: &Url, request: &AnnounceRequest) -> TrackerResult<Vec<PeerEndpoint>> {
    let host = url
        .host_str()
        .ok_or(TrackerError::NoAnnounceUrl)?
        .to_string();
    let port = url.port().ok_or(TrackerError::NoAnnounceUrl)?;

    // Resolve once; first address wins.
    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| {
            TrackerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "tracker host did not resolve",
            ))
        })?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;

    let connection_id = connect_round(&socket).await?;
    announce_round(&socket, connection_id, request).await
}

async fn connect_round(socket: &UdpSocket) -> TrackerResult<u64> {
    for _ in 0..ATTEMPTS {
        let transaction_id = rand::rng().random::<u32>();
        socket.send(&build_connect_request(transaction_id)).await?;

        let mut buf = [0u8; 64];
        let len = timeout(TRACKER_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| TrackerError::Timeout)??;

        match parse_connect_response(&buf[..len], transaction_id)? {
            Some(connection_id) => return Ok(connection_id),
            None => continue,
        }
    }
    Err(TrackerError::MalformedResponse(
        "transaction id never echoed".to_string(),
    ))
}

async fn announce_round(
    socket: &UdpSocket,
    connection_id: u64,
    request: &AnnounceRequest,
) -> TrackerResult<Vec<PeerEndpoint>> {
    for _ in 0..ATTEMPTS {
        let transaction_id = rand::rng().random::<u32>();
        let key = rand::rng().random::<u32>();
        let packet = build_announce_request(connection_id, transaction_id, key, request);
        socket.send(&packet).await?;

        let mut buf = [0u8; 4096];
        let len = timeout(TRACKER_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| TrackerError::Timeout)??;

        match parse_announce_response(&buf[..len], transaction_id)? {
            Some(peers) => return Ok(peers),
            None => continue,
        }
    }
    Err(TrackerError::MalformedResponse(
        "transaction id never echoed".to_string(),
    ))
}

/// 16 bytes: `protocol_id || action=0 || transaction_id`.
fn build_connect_request(transaction_id: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16);
    packet.write_u64::<BigEndian>(PROTOCOL_ID).unwrap();
    packet.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
    packet.write_u32::<BigEndian>(transaction_id).unwrap();
    packet
}

/// `Ok(None)` means a datagram that does not match this round; the
/// caller retries with a fresh transaction id.
///
/// Error responses are only 8 bytes plus a message, so the action check
/// comes before the full-length check.
fn parse_connect_response(buf: &[u8], transaction_id: u32) -> TrackerResult<Option<u64>> {
    if buf.len() < 8 {
        return Err(TrackerError::MalformedResponse(
            "connect response shorter than 8 bytes".to_string(),
        ));
    }
    let mut cursor = Cursor::new(buf);
    let action = cursor.read_u32::<BigEndian>()?;
    let echoed = cursor.read_u32::<BigEndian>()?;

    if action == ACTION_ERROR {
        return Err(reject_from(&buf[8..]));
    }
    if action != ACTION_CONNECT || echoed != transaction_id {
        return Ok(None);
    }
    if buf.len() < 16 {
        return Err(TrackerError::MalformedResponse(
            "connect response shorter than 16 bytes".to_string(),
        ));
    }
    Ok(Some(cursor.read_u64::<BigEndian>()?))
}

/// 98 bytes, all big-endian, per BEP-15.
fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &AnnounceRequest,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98);
    packet.write_u64::<BigEndian>(connection_id).unwrap();
    packet.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
    packet.write_u32::<BigEndian>(transaction_id).unwrap();
    packet.extend_from_slice(&request.info_hash);
    packet.extend_from_slice(&request.peer_id);
    packet.write_u64::<BigEndian>(0).unwrap(); // downloaded
    packet.write_u64::<BigEndian>(request.left).unwrap();
    packet.write_u64::<BigEndian>(0).unwrap(); // uploaded
    packet.write_u32::<BigEndian>(0).unwrap(); // event
    packet.write_u32::<BigEndian>(0).unwrap(); // ip
    packet.write_u32::<BigEndian>(key).unwrap();
    packet.write_i32::<BigEndian>(-1).unwrap(); // num_want
    packet.write_u16::<BigEndian>(request.port).unwrap();
    packet
}

/// 20-byte prefix (action, transaction id, interval, leechers, seeders)
/// followed by compact peer records.
fn parse_announce_response(
    buf: &[u8],
    transaction_id: u32,
) -> TrackerResult<Option<Vec<PeerEndpoint>>> {
    if buf.len() < 8 {
        return Err(TrackerError::MalformedResponse(
            "announce response shorter than 8 bytes".to_string(),
        ));
    }
    let mut cursor = Cursor::new(buf);
    let action = cursor.read_u32::<BigEndian>()?;
    let echoed = cursor.read_u32::<BigEndian>()?;

    if action == ACTION_ERROR {
        return Err(reject_from(&buf[8..]));
    }
    if action != ACTION_ANNOUNCE || echoed != transaction_id {
        return Ok(None);
    }
    if buf.len() < 20 {
        return Err(TrackerError::MalformedResponse(
            "announce response shorter than 20 bytes".to_string(),
        ));
    }
    PeerEndpoint::from_compact(&buf[20..]).map(Some)
}

fn reject_from(message: &[u8]) -> TrackerError {
    TrackerError::Reject(String::from_utf8_lossy(message).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_layout() {
        let packet = build_connect_request(0xDEADBEEF);
        assert_eq!(packet.len(), 16);
        assert_eq!(&packet[..8], &[0, 0, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80]);
        assert_eq!(&packet[8..12], &[0, 0, 0, 0]);
        assert_eq!(&packet[12..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn connect_response_roundtrip() {
        let mut response = Vec::new();
        response.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
        response.write_u32::<BigEndian>(7).unwrap();
        response.write_u64::<BigEndian>(0x1122334455667788).unwrap();

        let connection_id = parse_connect_response(&response, 7).unwrap();
        assert_eq!(connection_id, Some(0x1122334455667788));
    }

    #[test]
    fn connect_response_wrong_echo_retries() {
        let mut response = Vec::new();
        response.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
        response.write_u32::<BigEndian>(8).unwrap();
        response.write_u64::<BigEndian>(1).unwrap();

        assert_eq!(parse_connect_response(&response, 7).unwrap(), None);
    }

    #[test]
    fn error_action_is_a_reject() {
        let mut response = Vec::new();
        response.write_u32::<BigEndian>(ACTION_ERROR).unwrap();
        response.write_u32::<BigEndian>(7).unwrap();
        response.extend_from_slice(b"banned");

        assert!(matches!(
            parse_connect_response(&response, 7),
            Err(TrackerError::Reject(reason)) if reason == "banned"
        ));
    }

    #[test]
    fn announce_request_layout() {
        let request = AnnounceRequest {
            info_hash: [0xAB; 20],
            peer_id: [0xCD; 20],
            port: 7777,
            left: 396361728,
        };
        let packet = build_announce_request(0x0102030405060708, 0x0A0B0C0D, 0x55AA55AA, &request);
        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&packet[8..12], &[0, 0, 0, 1]);
        assert_eq!(&packet[12..16], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&packet[16..36], &[0xAB; 20]);
        assert_eq!(&packet[36..56], &[0xCD; 20]);
        assert_eq!(&packet[56..64], &[0; 8]); // downloaded
        assert_eq!(&packet[64..72], &396361728u64.to_be_bytes());
        assert_eq!(&packet[72..80], &[0; 8]); // uploaded
        assert_eq!(&packet[80..84], &[0; 4]); // event
        assert_eq!(&packet[84..88], &[0; 4]); // ip
        assert_eq!(&packet[88..92], &[0x55, 0xAA, 0x55, 0xAA]);
        assert_eq!(&packet[92..96], &[0xFF, 0xFF, 0xFF, 0xFF]); // num_want = -1
        assert_eq!(&packet[96..], &7777u16.to_be_bytes());
    }

    #[test]
    fn announce_response_parses_peers() {
        let mut response = Vec::new();
        response.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
        response.write_u32::<BigEndian>(9).unwrap();
        response.write_u32::<BigEndian>(1800).unwrap(); // interval
        response.write_u32::<BigEndian>(3).unwrap(); // leechers
        response.write_u32::<BigEndian>(12).unwrap(); // seeders
        response.extend_from_slice(&[192, 0, 2, 1, 0x1A, 0xE1]);
        response.extend_from_slice(&[10, 0, 0, 7, 0x1B, 0x39]);

        let peers = parse_announce_response(&response, 9).unwrap().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "192.0.2.1:6881");
        assert_eq!(peers[1].to_string(), "10.0.0.7:6969");
    }
}
