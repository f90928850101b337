use anyhow::Result;
use clap::{Parser, Subcommand};
use meshrun::config::{DEFAULT_RELAY_ADDR, WorkerConfig, load_worker_config};
use meshrun::protocol::WorkerId;
use meshrun::relay::RelayServer;
use meshrun::runtime::Worker;
use meshrun::runtime::http_scheduler::HttpScheduler;
use meshrun::vertex::VertexRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Address to listen on
        #[arg(long, default_value = DEFAULT_RELAY_ADDR)]
        bind: String,
    },

    /// Start a worker that registers with the scheduler and hosts tasks
    Worker {
        /// YAML config file; flags below override it
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Proposed worker id
        #[arg(long)]
        id: Option<String>,

        /// Scheduler base URL
        #[arg(long)]
        scheduler: Option<String>,

        /// Relay address
        #[arg(long)]
        relay: Option<String>,

        /// Listen address for direct peer channels
        #[arg(long)]
        data_bind: Option<SocketAddr>,

        /// Address peers should dial, when different from --data-bind
        #[arg(long)]
        advertise: Option<SocketAddr>,

        /// Cores reported to the scheduler
        #[arg(long)]
        cores: Option<usize>,

        /// Batching delay for delivery and send ticks (ms)
        #[arg(long)]
        batch_delay_ms: Option<u64>,

        /// Resend period for unacknowledged batches (ms)
        #[arg(long)]
        resend_delay_ms: Option<u64>,

        /// Heartbeat period (ms)
        #[arg(long)]
        heartbeat_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Relay { bind } => {
            let server = RelayServer::bind(bind.as_str()).await?;
            info!("Relay ready on {}", server.local_addr()?);
            server.run().await?;
        }

        Commands::Worker {
            config,
            id,
            scheduler,
            relay,
            data_bind,
            advertise,
            cores,
            batch_delay_ms,
            resend_delay_ms,
            heartbeat_ms,
        } => {
            let mut cfg = match config {
                Some(path) => load_worker_config(path)?,
                None => WorkerConfig::default(),
            };
            if let Some(id) = id {
                cfg.worker_id = Some(WorkerId::new(id));
            }
            if let Some(url) = scheduler {
                cfg.scheduler_url = url;
            }
            if let Some(addr) = relay {
                cfg.relay_addr = addr;
            }
            if let Some(addr) = data_bind {
                cfg.data_bind = addr;
            }
            if advertise.is_some() {
                cfg.advertise_addr = advertise;
            }
            if let Some(n) = cores {
                cfg.n_cores = n;
            }
            if let Some(ms) = batch_delay_ms {
                cfg.batch_delay_ms = ms;
            }
            if let Some(ms) = resend_delay_ms {
                cfg.resend_delay_ms = ms;
            }
            if let Some(ms) = heartbeat_ms {
                cfg.heartbeat_interval_ms = ms;
            }

            info!("Starting worker... Scheduler: {}, Relay: {}", cfg.scheduler_url, cfg.relay_addr);
            let scheduler = Arc::new(HttpScheduler::new(cfg.scheduler_url.clone())?);
            let registry = Arc::new(VertexRegistry::with_builtins());

            let handle = Worker::start(cfg, scheduler, registry).await?;
            info!("Worker {} ready.", handle.id());

            tokio::select! {
                result = handle.wait() => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down."),
            }
        }
    }

    Ok(())
}
