//! Download orchestration.
//!
//! One worker task per discovered peer, all draining a shared work queue
//! of piece tasks and pushing verified pieces to a single aggregator.
//! Workers requeue tasks they cannot finish (peer lacks the piece, peer
//! died, hash mismatch), so the queue is multi-producer as well as
//! multi-consumer. The aggregator owns the assembly buffer, closes the
//! queue once every piece is in, and the result channel closing with
//! pieces still outstanding is the all-workers-gone signal.
use crate::peer::{Message, PeerConn};
use crate::torrent::Metainfo;
use crate::tracker::PeerEndpoint;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};

pub mod piece;

pub use piece::PieceTask;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download stalled: all peers gone with pieces outstanding")]
    NoProgress,

    #[error("failed to create output file: {0}")]
    FileCreate(std::io::Error),

    #[error("failed to write output file: {0}")]
    FileWrite(std::io::Error),
}

/// Multi-producer / multi-consumer queue of piece tasks.
///
/// The semaphore counts queued tasks; closing it wakes every blocked
/// worker with `None`. Workers requeue through `push` until they exit,
/// which is why closing only happens at completion or abandonment.
struct WorkQueue {
    tasks: Mutex<VecDeque<PieceTask>>,
    available: Semaphore,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
        }
    }

    fn push(&self, task: PieceTask) {
        self.tasks.lock().unwrap().push_back(task);
        self.available.add_permits(1);
    }

    /// Waits for a task; `None` once the queue is closed.
    async fn pop(&self) -> Option<PieceTask> {
        match self.available.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.tasks.lock().unwrap().pop_front()
            }
            Err(_) => None,
        }
    }

    fn close(&self) {
        self.available.close();
    }
}

struct WorkerCtx {
    queue: WorkQueue,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    piece_count: usize,
    /// Ids of workers still running, registered before spawn. A task is
    /// only abandoned once every id in here has declined it.
    live_workers: Mutex<HashSet<u64>>,
}

impl WorkerCtx {
    /// True when every live worker has skipped the task.
    fn nobody_can_serve(&self, task: &PieceTask) -> bool {
        let live = self.live_workers.lock().unwrap();
        live.iter().all(|id| task.skipped_by.contains(id))
    }
}

/// Deregisters the worker however it exits.
struct LiveGuard {
    ctx: Arc<WorkerCtx>,
    id: u64,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.ctx.live_workers.lock().unwrap().remove(&self.id);
    }
}

struct PieceResult {
    index: usize,
    data: Vec<u8>,
}

/// Downloads the whole payload and returns the assembled, verified
/// bytes in piece-index order.
#[tracing::instrument(skip(meta, peers, peer_id), fields(name = %meta.name, peers = peers.len()), level = "info")]
pub async fn download(
    meta: &Metainfo,
    peers: &[PeerEndpoint],
    peer_id: [u8; 20],
) -> Result<Vec<u8>, DownloadError> {
    let tasks = piece::plan_pieces(meta);
    let piece_count = tasks.len();

    let ctx = Arc::new(WorkerCtx {
        queue: WorkQueue::new(),
        info_hash: meta.info_hash,
        peer_id,
        piece_count,
        live_workers: Mutex::new((0..peers.len() as u64).collect()),
    });
    for task in tasks {
        ctx.queue.push(task);
    }

    let (result_tx, mut result_rx) = mpsc::channel::<PieceResult>(1);
    for (id, &endpoint) in peers.iter().enumerate() {
        tokio::spawn(worker(id as u64, endpoint, Arc::clone(&ctx), result_tx.clone()));
    }
    drop(result_tx);

    let mut buf = vec![0u8; meta.total_length as usize];
    let mut completed = 0usize;
    while completed < piece_count {
        match result_rx.recv().await {
            Some(result) => {
                let begin = result.index * meta.piece_length as usize;
                buf[begin..begin + result.data.len()].copy_from_slice(&result.data);
                completed += 1;
                let percent = completed as f64 / piece_count as f64 * 100.0;
                tracing::info!(piece = result.index, "downloaded {percent:.2}%");
            }
            // Every worker has exited with pieces still outstanding.
            None => return Err(DownloadError::NoProgress),
        }
    }
    ctx.queue.close();
    Ok(buf)
}

/// Writes the assembled payload to `path` in one shot. Multi-file
/// torrents come out as the same concatenated stream.
pub fn write_output(path: impl AsRef<Path>, data: &[u8]) -> Result<(), DownloadError> {
    use std::io::Write;
    let mut file = std::fs::File::create(path).map_err(DownloadError::FileCreate)?;
    file.write_all(data).map_err(DownloadError::FileWrite)?;
    Ok(())
}

/// One peer session: connect, declare interest, then drain the work
/// queue until it closes or the peer fails.
#[tracing::instrument(skip(ctx, results), fields(peer = %endpoint), level = "debug")]
async fn worker(
    id: u64,
    endpoint: PeerEndpoint,
    ctx: Arc<WorkerCtx>,
    results: mpsc::Sender<PieceResult>,
) {
    let _live = LiveGuard {
        ctx: Arc::clone(&ctx),
        id,
    };

    let mut conn =
        match PeerConn::connect(endpoint, ctx.info_hash, ctx.peer_id, ctx.piece_count).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(peer = %endpoint, error = %e, "could not establish peer connection");
                return;
            }
        };
    if let Err(e) = conn.send(&Message::Interested).await {
        tracing::warn!(peer = %endpoint, error = %e, "could not declare interest");
        return;
    }

    while let Some(mut task) = ctx.queue.pop().await {
        if !conn.bitfield.has_piece(task.index) {
            task.skipped_by.insert(id);
            if ctx.nobody_can_serve(&task) {
                tracing::warn!(piece = task.index, "no connected peer has this piece, giving up");
                ctx.queue.close();
                return;
            }
            ctx.queue.push(task);
            tokio::task::yield_now().await;
            continue;
        }

        match piece::download_piece(&mut conn, &task).await {
            Ok(data) => {
                if !piece::verify(&task, &data) {
                    tracing::warn!(peer = %endpoint, piece = task.index, "piece failed hash check");
                    ctx.queue.push(task);
                    continue;
                }
                let index = task.index;
                if results.send(PieceResult { index, data }).await.is_err() {
                    // Aggregator finished and hung up.
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(peer = %endpoint, piece = task.index, error = %e, "peer failed, requeueing piece");
                ctx.queue.push(task);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::connection::{read_message, write_message};
    use crate::peer::handshake::Handshake;
    use crate::peer::Message;
    use sha1::{Digest, Sha1};
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const INFO_HASH: [u8; 20] = [7; 20];

    fn test_meta(payload: &[u8], piece_length: usize) -> Metainfo {
        let piece_hashes = payload
            .chunks(piece_length)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        Metainfo {
            announce: None,
            announce_list: Vec::new(),
            info_hash: INFO_HASH,
            name: "test".to_string(),
            piece_length: piece_length as u64,
            piece_hashes,
            total_length: payload.len() as u64,
            files: Vec::new(),
            multi_file: false,
        }
    }

    /// A minimal seeding peer on loopback: handshake, bitfield, unchoke
    /// on interest, serve requested blocks. Optionally corrupts the
    /// first block it serves for one piece, to exercise the hash-retry
    /// path.
    async fn spawn_seeder(
        payload: Vec<u8>,
        piece_length: usize,
        bitfield: Vec<u8>,
        corrupt_first_of: Option<u32>,
    ) -> PeerEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let theirs = Handshake::read(&mut stream).await.unwrap();
            assert_eq!(theirs.info_hash, INFO_HASH);
            stream
                .write_all(&Handshake::new(INFO_HASH, [0xEE; 20]).serialize())
                .await
                .unwrap();
            write_message(&mut stream, &Message::Bitfield(bitfield))
                .await
                .unwrap();

            let mut corrupted = false;
            loop {
                let msg = match read_message(&mut stream).await {
                    Ok(msg) => msg,
                    Err(_) => break,
                };
                match msg {
                    Some(Message::Interested) => {
                        write_message(&mut stream, &Message::Unchoke).await.unwrap();
                    }
                    Some(Message::Request { index, begin, length }) => {
                        let start = index as usize * piece_length + begin as usize;
                        let mut block = payload[start..start + length as usize].to_vec();
                        if corrupt_first_of == Some(index) && !corrupted {
                            block[0] ^= 0xFF;
                            corrupted = true;
                        }
                        write_message(&mut stream, &Message::Piece { index, begin, block })
                            .await
                            .unwrap();
                    }
                    _ => {}
                }
            }
        });

        PeerEndpoint {
            ip: Ipv4Addr::LOCALHOST,
            port,
        }
    }

    #[tokio::test]
    async fn downloads_and_assembles_payload() {
        let payload: Vec<u8> = (0..21u8).collect();
        let meta = test_meta(&payload, 8);
        let seeder = spawn_seeder(payload.clone(), 8, vec![0b1110_0000], None).await;

        let data = download(&meta, &[seeder], [1; 20]).await.unwrap();
        assert_eq!(data, payload);
    }

    #[tokio::test]
    async fn bad_piece_is_retried_on_same_peer() {
        let payload: Vec<u8> = (0..16u8).collect();
        let meta = test_meta(&payload, 8);
        let seeder = spawn_seeder(payload.clone(), 8, vec![0b1100_0000], Some(1)).await;

        let data = download(&meta, &[seeder], [1; 20]).await.unwrap();
        assert_eq!(data, payload);
    }

    #[tokio::test]
    async fn missing_piece_stalls_with_no_progress() {
        let payload: Vec<u8> = (0..16u8).collect();
        let meta = test_meta(&payload, 8);
        // The only peer advertises piece 0 but not piece 1.
        let seeder = spawn_seeder(payload.clone(), 8, vec![0b1000_0000], None).await;

        assert!(matches!(
            download(&meta, &[seeder], [1; 20]).await,
            Err(DownloadError::NoProgress)
        ));
    }

    #[tokio::test]
    async fn unreachable_peer_is_no_progress() {
        let payload: Vec<u8> = (0..8u8).collect();
        let meta = test_meta(&payload, 8);
        // Reserved TEST-NET address, nothing listens there; the connect
        // deadline kills the only worker.
        let dead = PeerEndpoint {
            ip: Ipv4Addr::new(192, 0, 2, 1),
            port: 1,
        };

        assert!(matches!(
            download(&meta, &[dead], [1; 20]).await,
            Err(DownloadError::NoProgress)
        ));
    }

    #[tokio::test]
    async fn work_queue_requeues_and_closes() {
        let queue = WorkQueue::new();
        let task = PieceTask {
            index: 4,
            expected_hash: [0; 20],
            length: 64,
            skipped_by: Default::default(),
        };
        queue.push(task.clone());

        let popped = queue.pop().await.unwrap();
        assert_eq!(popped.index, 4);
        queue.push(popped);
        assert_eq!(queue.pop().await.unwrap().index, 4);

        queue.close();
        assert!(queue.pop().await.is_none());
    }

    #[test]
    fn write_output_creates_file() {
        let dir = std::env::temp_dir().join("remora-test-out");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload.bin");
        write_output(&path, b"assembled bytes").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"assembled bytes");
        std::fs::remove_file(&path).unwrap();
    }
}
