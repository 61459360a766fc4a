//! Local songlist cluster with a stdin master REPL.
//!
//! Spawns replica 0 first so exactly one coordinator bootstraps, then the
//! rest of the roster. The REPL speaks the master grammar (`add`, `delete`,
//! `get`) plus `status`, `kill <id>` and `quit`, and follows `coordinator`
//! announcements when the cluster elects a new one.

use clap::Parser;
use error_stack::{Report, ResultExt};
use songlist_core::{MasterResponse, ReplicaId, RoomConfig, wire};
use songlist_room::{ClusterError, LocalCluster};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "songlist-node")]
#[command(about = "Run a local songlist cluster with a master REPL")]
struct Args {
    /// Number of replicas; ids are 0..n.
    #[arg(short, long, default_value_t = 3)]
    replicas: u32,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    beat_rate_ms: u64,

    /// Failure-detector window and protocol timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    alive_threshold_ms: u64,

    /// Coordinator bootstrap delay in milliseconds.
    #[arg(long, default_value_t = 3000)]
    determine_coordinator_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Report<ClusterError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = RoomConfig {
        beat_rate: std::time::Duration::from_millis(args.beat_rate_ms),
        alive_threshold: std::time::Duration::from_millis(args.alive_threshold_ms),
        determine_coordinator_after: std::time::Duration::from_millis(args.determine_coordinator_ms),
    };

    let mut cluster = LocalCluster::new(0..args.replicas, config);
    let (master_tx, mut master_rx) = mpsc::unbounded_channel();

    cluster.spawn(0)?;
    cluster.join_master(0, master_tx.clone()).await?;

    // The bootstrap contract: replica 0 promotes itself once it has seen no
    // coordinator for the configured delay.
    let Some(resp) = master_rx.recv().await else {
        return Err(
            Report::new(ClusterError).attach("replica 0 stopped before becoming coordinator")
        );
    };
    println!("{}", wire::encode_master_response(&resp));
    let mut coordinator = match resp {
        MasterResponse::Coordinator(id) => id,
        other => {
            return Err(
                Report::new(ClusterError).attach(format!("unexpected first response: {other:?}"))
            );
        }
    };

    for id in 1..args.replicas {
        cluster.spawn(id)?;
        cluster.join_master(id, master_tx.clone()).await?;
    }
    println!("cluster of {} replicas running; master ready", args.replicas);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(resp) = master_rx.recv() => {
                if let MasterResponse::Coordinator(id) = resp {
                    coordinator = id;
                }
                println!("{}", wire::encode_master_response(&resp));
            }

            line = lines.next_line() => {
                let Some(line) = line.change_context(ClusterError)? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line {
                    "quit" | "exit" => break,
                    "status" => print_status(&cluster).await,
                    _ if line.starts_with("kill ") => {
                        match line["kill ".len()..].trim().parse::<u32>() {
                            Ok(id) => {
                                if let Err(e) = cluster.kill(id) {
                                    println!("error: {e:?}");
                                }
                            }
                            Err(_) => println!("error: kill takes a replica id"),
                        }
                    }
                    _ => match wire::parse_master_request(line) {
                        Ok(req) => {
                            if let Err(e) = cluster.master(coordinator.0, req).await {
                                println!("error: {e:?}");
                            }
                        }
                        Err(e) => println!("error: {e}"),
                    },
                }
            }
        }
    }

    cluster.shutdown();
    Ok(())
}

async fn print_status(cluster: &LocalCluster) {
    for ReplicaId(id) in cluster.running() {
        match cluster.status(id).await {
            Ok(status) => {
                let songs: Vec<String> = status
                    .songs
                    .iter()
                    .map(|(name, url)| format!("{name},{url}"))
                    .collect();
                println!(
                    "replica {}: role={} coordinator={} iter={} phase={:?} songs=[{}]",
                    status.id,
                    status.role.as_str(),
                    status
                        .coordinator
                        .map_or_else(|| "-".to_string(), |c| c.to_string()),
                    status.iter,
                    status.phase,
                    songs.join(" "),
                );
            }
            Err(e) => warn!(id, ?e, "status failed"),
        }
    }
}
