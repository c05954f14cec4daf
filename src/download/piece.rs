//! Downloading one piece from one peer.
//!
//! Blocks of 16 KiB are requested with up to five outstanding at a time,
//! and whatever arrives is folded into the piece buffer until it is
//! full. The whole piece runs under a single absolute deadline. The
//! SHA-1 check at the end is the caller's: a hash mismatch means a bad
//! piece, not a bad peer.
use crate::peer::{Message, PeerConn, PeerError, PeerResult};
use crate::torrent::Metainfo;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;

pub const MAX_BLOCK_SIZE: usize = 16384;
pub const MAX_BACKLOG: usize = 5;
pub const PIECE_TIMEOUT: Duration = Duration::from_secs(15);

/// One piece to fetch and verify.
#[derive(Debug, Clone)]
pub struct PieceTask {
    pub index: usize,
    pub expected_hash: [u8; 20],
    pub length: usize,
    /// Ids of workers that skipped this task because their peer does not
    /// advertise the piece. When every live worker is in here, nobody
    /// can serve the piece and the download is stalled.
    pub skipped_by: HashSet<u64>,
}

/// Builds the task list in index order; every task is `piece_length`
/// long except possibly the last.
pub fn plan_pieces(meta: &Metainfo) -> Vec<PieceTask> {
    meta.piece_hashes
        .iter()
        .enumerate()
        .map(|(index, &expected_hash)| PieceTask {
            index,
            expected_hash,
            length: meta.piece_size(index) as usize,
            skipped_by: HashSet::new(),
        })
        .collect()
}

/// Request/receive accounting for the piece currently in flight.
///
/// `backlog == requested - downloaded` holds between iterations; each
/// outstanding request covers one block.
struct PieceProgress {
    index: usize,
    buf: Vec<u8>,
    requested: usize,
    downloaded: usize,
    backlog: usize,
}

impl PieceProgress {
    fn new(task: &PieceTask) -> Self {
        Self {
            index: task.index,
            buf: vec![0u8; task.length],
            requested: 0,
            downloaded: 0,
            backlog: 0,
        }
    }

    /// Folds a received block into the buffer, enforcing the frame
    /// invariants: right piece, in-bounds offset, and no more data than
    /// was requested.
    fn accept(&mut self, index: u32, begin: u32, block: &[u8]) -> PeerResult<()> {
        if index as usize != self.index {
            return Err(PeerError::BadPieceFrame(format!(
                "piece {index} while downloading {}",
                self.index
            )));
        }
        let begin = begin as usize;
        if begin >= self.buf.len() || begin + block.len() > self.buf.len() {
            return Err(PeerError::BadPieceFrame(format!(
                "block {begin}+{} overruns piece of {} bytes",
                block.len(),
                self.buf.len()
            )));
        }
        if self.downloaded + block.len() > self.requested {
            return Err(PeerError::BadPieceFrame(
                "more data than requested".to_string(),
            ));
        }
        self.buf[begin..begin + block.len()].copy_from_slice(block);
        self.downloaded += block.len();
        self.backlog = self.backlog.saturating_sub(1);
        Ok(())
    }
}

/// Fetches one piece over an established connection.
///
/// Any I/O error, deadline overrun, or frame invariant violation is
/// fatal for this peer; the caller tears the connection down.
#[tracing::instrument(skip(conn, task), fields(piece = task.index), level = "debug")]
pub async fn download_piece(conn: &mut PeerConn, task: &PieceTask) -> PeerResult<Vec<u8>> {
    let mut progress = PieceProgress::new(task);

    timeout(PIECE_TIMEOUT, async {
        while progress.downloaded < task.length {
            if !conn.choked {
                while progress.backlog < MAX_BACKLOG && progress.requested < task.length {
                    let length = MAX_BLOCK_SIZE.min(task.length - progress.requested);
                    conn.send(&Message::Request {
                        index: task.index as u32,
                        begin: progress.requested as u32,
                        length: length as u32,
                    })
                    .await?;
                    progress.requested += length;
                    progress.backlog += 1;
                }
            }
            step(conn, &mut progress).await?;
        }
        Ok::<(), PeerError>(())
    })
    .await
    .map_err(|_| PeerError::Timeout)??;

    Ok(progress.buf)
}

/// Handles one incoming message. Keep-alives and message kinds that do
/// not affect the transfer are ignored.
async fn step(conn: &mut PeerConn, progress: &mut PieceProgress) -> PeerResult<()> {
    match conn.read_message().await? {
        Some(Message::Choke) => conn.choked = true,
        Some(Message::Unchoke) => conn.choked = false,
        Some(Message::Have(index)) => conn.bitfield.set_piece(index as usize),
        Some(Message::Piece { index, begin, block }) => {
            progress.accept(index, begin, &block)?;
        }
        Some(_) | None => {}
    }
    Ok(())
}

/// True when the piece bytes hash to the expected digest.
pub fn verify(task: &PieceTask, data: &[u8]) -> bool {
    let digest: [u8; 20] = Sha1::digest(data).into();
    digest == task.expected_hash
}
