//! sfkt - CLI Entry Point
//!
//! - `sfkt parse <uri>`: show the decoded descriptor
//! - `sfkt generate <uri>`: print the proxy engine document
//! - `sfkt rank --servers FILE`: probe server latencies
//! - `sfkt connect --servers FILE [--server NAME]`: run a supervised tunnel

// Use mimalloc as global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sfkt_rust::config::{generate_config, ConnectionDescriptor};
use sfkt_rust::event::Event;
use sfkt_rust::provider::{format_latency, load_uri_list, LatencyGrade, MemoryServerStore, ServerRecord, ServerStore};
use sfkt_rust::{Settings, VERSION};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sfkt")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "VLESS tunnel supervisor with connectivity monitoring and failover")]
struct Args {
    /// Path to settings file (YAML)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Engine working directory (overrides settings)
    #[arg(short = 'd', long = "work-dir")]
    work_dir: Option<PathBuf>,

    /// Log level (overrides settings)
    #[arg(short = 'l', long = "log-level")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a descriptor URI
    Parse { uri: String },

    /// Print the proxy engine document for a descriptor URI
    Generate { uri: String },

    /// Probe the latency of every server in a list
    Rank {
        /// File with one descriptor URI per line
        #[arg(short = 's', long = "servers")]
        servers: PathBuf,
    },

    /// Bring the tunnel up and supervise it until interrupted
    Connect {
        #[arg(short = 's', long = "servers")]
        servers: PathBuf,

        /// Server name to start with; defaults to the fastest
        #[arg(long = "server")]
        server: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(dir) = &args.work_dir {
        settings.work_dir = dir.clone();
    }
    if let Some(level) = &args.log_level {
        settings.log_level = level.clone();
    }
    settings.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .enable_all()
        .thread_name("sfkt-worker")
        .build()?;

    runtime.block_on(async_main(args.command, settings))
}

async fn async_main(command: Command, settings: Settings) -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("sfkt_rust={}", settings.log_level).parse()?)
                .add_directive(format!("sfkt={}", settings.log_level).parse()?),
        )
        .init();

    match command {
        Command::Parse { uri } => {
            let descriptor = ConnectionDescriptor::parse(&uri)?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
        Command::Generate { uri } => {
            let descriptor = ConnectionDescriptor::parse(&uri)?;
            print!("{}", generate_config(&descriptor, &settings.network).to_json()?);
        }
        Command::Rank { servers } => {
            let store = load_store(&servers).await?;
            let records = store.list().await?;
            sfkt_rust::provider::rank_servers(&store, &records, settings.ranking.timeout()).await;
            print_servers(&store.list().await?);
        }
        Command::Connect { servers, server } => connect(settings, &servers, server).await?,
    }

    Ok(())
}

async fn load_store(path: &Path) -> anyhow::Result<MemoryServerStore> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let store = MemoryServerStore::new();
    let ids = store.replace_all(load_uri_list(&text)).await?;
    info!("Loaded {} servers from {}", ids.len(), path.display());
    Ok(store)
}

fn print_servers(records: &[ServerRecord]) {
    for record in records {
        println!(
            "{:<6} {:<32} {:>8}  {}",
            record.id.to_string(),
            record.name,
            format_latency(record.latency_ms),
            LatencyGrade::of(record.latency_ms)
        );
    }
}

#[cfg(target_os = "linux")]
async fn connect(settings: Settings, servers: &Path, server: Option<String>) -> anyhow::Result<()> {
    use sfkt_rust::engine::format_bytes;
    use sfkt_rust::{Supervisor, SupervisorComponents};
    use std::sync::Arc;

    let mut components = SupervisorComponents::system(&settings);
    let store = Arc::new(load_store(servers).await?);
    components.store = store.clone();

    let supervisor = Supervisor::new(settings, components)?;
    supervisor.initialize().await?;
    supervisor.rank_all().await?;

    let candidates = store.list().await?;
    print_servers(&candidates);
    let chosen = match &server {
        Some(name) => candidates.iter().find(|r| &r.name == name),
        None => candidates.first(),
    }
    .with_context(|| format!("no server named {}", server.as_deref().unwrap_or("<any>")))?
    .clone();

    let mut events = supervisor.events().subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::SessionError { message } => error!("{}", message),
                Event::NoInternetWarning => warn!("No Internet connection"),
                Event::FailoverSwitching { candidate } => info!("Switching to {}", candidate),
                other => info!("{}", serde_json::to_string(&other).unwrap_or_default()),
            }
        }
    });

    if let Err(e) = supervisor.connect(chosen.id).await {
        error!("Failed to connect to {}: {}", chosen.name, e);
    }

    wait_for_shutdown().await?;
    info!("Received shutdown signal");

    let session = supervisor.session();
    let stats = session.traffic_stats();
    info!(
        "Session ran {}s: sent {} in {} packets, received {} in {} packets",
        session.connection_duration().as_secs(),
        format_bytes(stats.tx_bytes),
        stats.tx_packets,
        format_bytes(stats.rx_bytes),
        stats.rx_packets
    );

    supervisor.shutdown().await;
    reporter.abort();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn connect(_settings: Settings, _servers: &Path, _server: Option<String>) -> anyhow::Result<()> {
    anyhow::bail!("connect is only supported on Linux")
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
