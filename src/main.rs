use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use ballot::shutdown::install_shutdown_handler;
use ballot::transport::GrpcTransport;
use ballot::{Cluster, ClusterConfig, Command, LogEntry, MemberConfig, MemoryLog, StaticCoordinator};

#[derive(Parser, Debug)]
#[command(name = "ballot")]
#[command(version)]
#[command(about = "Raft consensus and cluster membership coordination")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a cluster member until SIGINT/SIGTERM
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Member ID (positive, unique in the cluster)
    #[arg(long, default_value = "1")]
    member_id: u32,

    /// Host this member is reachable at
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Other members (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    members: String,

    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    /// Deadline for a single RPC to another member
    #[arg(long, default_value = "100")]
    rpc_timeout_ms: u64,
}

fn parse_members(members: &str) -> Vec<MemberConfig> {
    if members.is_empty() {
        return Vec::new();
    }

    members
        .split(',')
        .filter_map(|member| {
            let parts: Vec<&str> = member.trim().split(':').collect();
            let id = match parts.as_slice() {
                [id, _, _] => id.parse::<u32>().ok(),
                _ => None,
            };
            match id {
                Some(id) => Some(MemberConfig {
                    id,
                    uri: format!("{}:{}", parts[1], parts[2]),
                }),
                None => {
                    tracing::warn!(member, "Invalid member format, expected id:host:port");
                    None
                }
            }
        })
        .collect()
}

fn log_applied(entry: &LogEntry) {
    match &entry.command {
        Command::Noop => {
            tracing::debug!(index = entry.index, term = entry.term, "Applied no-op");
        }
        Command::Apply(data) => {
            tracing::info!(
                index = entry.index,
                term = entry.term,
                bytes = data.len(),
                "Applied command"
            );
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ClusterConfig::new(args.member_id, format!("{}:{}", args.host, args.port))
        .with_election_timeout(args.election_timeout_min_ms, args.election_timeout_max_ms)
        .with_heartbeat_interval(args.heartbeat_interval_ms);
    config.rpc_timeout_ms = args.rpc_timeout_ms;
    config.members = parse_members(&args.members);
    config.validate()?;

    tracing::info!(
        member_id = config.member_id,
        uri = %config.uri,
        members = ?config.members.iter().map(|m| format!("{}@{}", m.id, m.uri)).collect::<Vec<_>>(),
        "Starting ballot member"
    );

    let coordinator = Arc::new(StaticCoordinator::from_config(&config));
    let cluster = Cluster::new(
        config,
        coordinator,
        Arc::new(GrpcTransport::new()),
        Box::new(MemoryLog::new()),
        Box::new(log_applied),
    )?;

    let mut events = cluster.election().subscribe();
    cluster.open().await?;

    let shutdown = install_shutdown_handler();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    let leader = event.leader.map(|m| m.to_string());
                    tracing::info!(term = event.term, leader = ?leader, "Election event");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed election events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    cluster.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await?,
    }

    Ok(())
}
