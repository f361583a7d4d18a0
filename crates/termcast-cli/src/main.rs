use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use termcast_config::Config;
use termcast_federation::{register_with_hq, HqRegistry, RemoteDescriptor};
use termcast_pty::PtySupervisor;
use termcast_recording::RecordingStore;
use termcast_registry::SessionRegistry;
use termcast_renderer::TerminalRenderer;
use termcast_server::AppState;
use termcast_util::Verbosity;
use termcast_watcher::StreamWatcher;
use tracing::info;

#[derive(Parser)]
#[command(name = "termcast")]
#[command(about = "PTY session runtime and streaming fabric", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/SSE/WS server.
    Serve {
        #[arg(long, default_value_t = 4023)]
        port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        hostname: String,
        /// Run this node as an HQ, accepting `/api/remotes/register` and
        /// aggregating session listings from registered Remotes (§4.H).
        #[arg(long, default_value_t = false)]
        hq: bool,
        /// URL of an HQ to register this node with, as a Remote.
        #[arg(long = "hq-url")]
        hq_url: Option<String>,
        /// This node's own URL, as advertised to the HQ.
        #[arg(long = "public-url")]
        public_url: Option<String>,
        /// Bearer token the HQ should use when proxying to this Remote.
        #[arg(long)]
        token: Option<String>,
        /// Identifier this node registers under with the HQ.
        #[arg(long = "remote-id")]
        remote_id: Option<String>,
        /// Display name this node registers under with the HQ.
        #[arg(long = "remote-name")]
        remote_name: Option<String>,
    },
    /// Bulk-delete exited sessions past an age threshold (§4.C
    /// `cleanupExited`), without starting the server.
    Cleanup {
        #[arg(long = "older-than-secs", default_value_t = 86_400)]
        older_than_secs: u64,
    },
}

/// Initializes the global subscriber, writing to a timestamped file under
/// `data_dir/log` so output survives even when the terminal that launched
/// the server is closed; returns the `WorkerGuard` that must stay alive
/// for the life of the process to flush the non-blocking writer.
fn init_tracing(data_dir: &std::path::Path, verbosity: Verbosity) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.tracing_directive()));

    let log_dir = data_dir.join("log");
    std::fs::create_dir_all(&log_dir).ok()?;
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_dir.join(format!("termcast-{timestamp}.log")))
        .ok()?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    Some(guard)
}

async fn build_runtime(
    config: Arc<Config>,
) -> anyhow::Result<(SessionRegistry, StreamWatcher, TerminalRenderer, RecordingStore)> {
    std::fs::create_dir_all(&config.data_dir)?;
    let recordings = RecordingStore::new(config.data_dir.clone());
    let supervisor = PtySupervisor::new();
    let registry = SessionRegistry::new(config.clone(), recordings.clone(), supervisor.clone());
    registry.load_from_disk().await?;
    let watcher = StreamWatcher::new(recordings.clone());
    let renderer = TerminalRenderer::new(supervisor);
    Ok((registry, watcher, renderer, recordings))
}

async fn run_serve(
    port: u16,
    hostname: String,
    hq: bool,
    hq_url: Option<String>,
    public_url: Option<String>,
    token: Option<String>,
    remote_id: Option<String>,
    remote_name: Option<String>,
) -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    termcast_util::set_verbosity(config.verbosity);

    let (registry, watcher, renderer, recordings) = build_runtime(config.clone()).await?;

    let federation = if hq { Some(HqRegistry::new()) } else { None };

    if let Some(hq_url) = hq_url {
        let public_url = public_url
            .ok_or_else(|| anyhow::anyhow!("--public-url is required with --hq-url"))?;
        let token = token.ok_or_else(|| anyhow::anyhow!("--token is required with --hq-url"))?;
        let descriptor = RemoteDescriptor {
            id: remote_id.unwrap_or_else(termcast_util::new_session_id),
            name: remote_name.unwrap_or_else(|| hostname.clone()),
            public_url,
            bearer_token: token,
        };
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            if let Err(e) = register_with_hq(&client, &hq_url, &descriptor).await {
                tracing::error!(error = %e, "giving up registering with hq");
            }
        });
    }

    let state = AppState::new(config, registry, watcher, renderer, recordings, federation);

    let addr: SocketAddr = format!("{hostname}:{port}").parse()?;
    termcast_server::serve(addr, state).await
}

async fn run_cleanup(older_than_secs: u64) -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    termcast_util::set_verbosity(config.verbosity);

    let (registry, _watcher, _renderer, _recordings) = build_runtime(config).await?;
    let removed = registry
        .cleanup_exited(Duration::from_secs(older_than_secs))
        .await?;
    info!(count = removed.len(), "cleaned up exited sessions");
    for id in removed {
        println!("{id}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();
    let _guard = init_tracing(&config.data_dir, config.verbosity)
        .or_else(|| {
            tracing_subscriber::fmt::init();
            None
        });

    match cli.command {
        Commands::Serve {
            port,
            hostname,
            hq,
            hq_url,
            public_url,
            token,
            remote_id,
            remote_name,
        } => run_serve(port, hostname, hq, hq_url, public_url, token, remote_id, remote_name).await,
        Commands::Cleanup { older_than_secs } => run_cleanup(older_than_secs).await,
    }
}
