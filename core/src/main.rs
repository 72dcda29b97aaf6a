//! Flowtree node CLI
//!
//! Run a distribution node that caches chunks and replicates them to peers.
//!
//! Usage:
//!   flowtree-node --listen 0.0.0.0:7400                    # Run a node
//!   flowtree-node --listen 0.0.0.0:7401 --peer host:7400   # Join a peer
//!   flowtree-node --import ./report.pdf                    # Share a local file

mod events;

use std::env;
use std::path::PathBuf;

use tracing::{info, warn};

use flowtree_core::resource::uri;
use flowtree_core::{DistributionConfig, DistributionTask};

fn print_usage() {
    println!("Flowtree Node v0.1.0");
    println!();
    println!("Usage:");
    println!("  flowtree-node --listen 0.0.0.0:7400                    Run a node");
    println!("  flowtree-node --listen 0.0.0.0:7401 --peer host:7400   Join a peer");
    println!();
    println!("Options:");
    println!("  --db-path <PATH>            Chunk database path (default: flowtree_chunks.db)");
    println!("  --listen <ADDR>             Accept peer connections on this address");
    println!("  --peer <ADDR>               Connect to this peer (repeatable)");
    println!("  --import <FILE>             Publish a local file as a resource (repeatable)");
    println!("  --max-cache <SIZE>          In-memory cache limit (default: 250MB, e.g., 1GB, 64MB)");
    println!("  --testing                   Use short job and fetch intervals");
    println!("  --help, -h                  Show this help");
    println!();
    println!("Environment:");
    println!("  RUST_LOG                    Set log level (e.g., info, debug)");
}

/// Parse a human-readable size string into bytes (e.g., "1GB", "64MB")
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_uppercase();

    let num_end = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    let (num_str, unit) = s.split_at(num_end);

    let num: f64 = num_str.parse().ok()?;

    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "KB" | "K" => 1000,
        "MB" | "M" => 1000 * 1000,
        "GB" | "G" => 1000 * 1000 * 1000,
        _ => return None,
    };

    Some((num * multiplier as f64) as u64)
}

/// Copy a local file into a new resource under `file:<path>`
async fn import_file(
    task: &std::sync::Arc<DistributionTask>,
    path: &str,
) -> Result<u64, Box<dyn std::error::Error>> {
    let key = uri::normalize(&format!("file:{}", path));
    let mut file = tokio::fs::File::open(path).await?;
    let (mut writer, loaded) = task.open_writer(&key).await?;
    tokio::io::copy(&mut file, &mut writer).await?;
    drop(writer);
    let bytes = loaded.await??;
    info!(uri = %key, bytes, "imported file");
    Ok(bytes)
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    let show_help = args.iter().any(|a| a == "--help" || a == "-h");
    let testing_mode = args.iter().any(|a| a == "--testing");

    let db_path: PathBuf = args
        .windows(2)
        .find(|w| w[0] == "--db-path")
        .map(|w| PathBuf::from(&w[1]))
        .unwrap_or_else(|| PathBuf::from("flowtree_chunks.db"));

    let listen: Option<String> = args
        .windows(2)
        .find(|w| w[0] == "--listen")
        .map(|w| w[1].clone());

    let peers: Vec<String> = args
        .windows(2)
        .filter(|w| w[0] == "--peer")
        .map(|w| w[1].clone())
        .collect();

    let imports: Vec<String> = args
        .windows(2)
        .filter(|w| w[0] == "--import")
        .map(|w| w[1].clone())
        .collect();

    let max_cache: Option<u64> = args
        .windows(2)
        .find(|w| w[0] == "--max-cache")
        .and_then(|w| {
            parse_size(&w[1]).or_else(|| {
                eprintln!("Invalid --max-cache value: {}", w[1]);
                eprintln!("   Expected format: 1GB, 64MB, 500KB, etc.");
                None
            })
        });

    if show_help {
        print_usage();
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    println!("Flowtree Node v0.1.0");
    println!();

    let mut config = if testing_mode {
        DistributionConfig::for_testing()
    } else {
        DistributionConfig::default()
    }
    .with_db_path(db_path.clone());

    if let Some(addr) = &listen {
        config = config.with_listen_addr(addr.clone());
    }
    for peer in &peers {
        config = config.with_bootstrap_peer(peer.clone());
    }
    if let Some(bytes) = max_cache {
        config = config.with_max_cache(bytes);
        println!("Max cache: {:.1} MB", bytes as f64 / (1000.0 * 1000.0));
    }

    println!("Database: {}", db_path.display());

    let task = match DistributionTask::start(config).await {
        Ok(task) => task,
        Err(e) => {
            eprintln!("Failed to start distribution task: {}", e);
            return;
        }
    };

    println!("Peer ID: {}", task.local_id());
    if let Some(addr) = &listen {
        println!("Listening: {}", addr);
    }

    for path in &imports {
        if let Err(e) = import_file(&task, path).await {
            warn!(error = %e, path = %path, "failed to import file");
        }
    }

    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!();
            info!("Received shutdown signal");
        }
        _ = events::run_event_loop(task.clone()) => {}
    }

    println!("Shutting down...");
    task.stop().await;
    println!("Done");
}
