use anyhow::Context;
use clap::Parser;
use remora::torrent::Metainfo;
use remora::tracker::{self, AnnounceRequest};
use remora::download;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "remora", about = "One-shot BitTorrent leech client")]
struct Cli {
    #[clap(short, long, help = "path to the .torrent file")]
    file: String,
    #[clap(short, long, help = "path to write the downloaded payload")]
    out: String,
    #[clap(short, long, default_value = "7777", help = "listen port reported to trackers")]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();

    let meta = Metainfo::from_file(&args.file)
        .with_context(|| format!("failed to load metainfo from {}", args.file))?;
    tracing::info!(
        name = %meta.name,
        info_hash = %hex::encode(meta.info_hash),
        pieces = meta.piece_count(),
        bytes = meta.total_length,
        "metainfo loaded"
    );

    let peer_id = tracker::generate_peer_id();
    let request = AnnounceRequest {
        info_hash: meta.info_hash,
        peer_id,
        port: args.port,
        left: meta.total_length,
    };
    let peers = tracker::retrieve_peers(&meta.tracker_urls(), &request)
        .await
        .context("peer discovery failed")?;

    let data = download::download(&meta, &peers, peer_id)
        .await
        .context("download failed")?;
    download::write_output(&args.out, &data)
        .with_context(|| format!("failed to write {}", args.out))?;

    tracing::info!(path = %args.out, bytes = data.len(), "download complete");
    Ok(())
}
