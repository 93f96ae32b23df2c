use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pagevault_core::{Config, Paths};
use pagevault_storage::{HttpReplica, ReadCache, RecordStore, StoreBackend, SyncService};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pagevault")]
#[command(about = "Local-first artifact store and sync daemon for browser automation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the base directory (default ~/.pagevault)
    #[arg(long, global = true)]
    base: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration
    Onboard {
        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show store and sync status
    Status,

    /// Run the sync daemon until interrupted
    Daemon,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let paths = match cli.base {
        Some(base) => Paths::with_base(base),
        None => Paths::new(),
    };

    match cli.command {
        Commands::Onboard { force } => onboard(&paths, force),
        Commands::Status => status(&paths),
        Commands::Daemon => daemon(&paths).await,
    }
}

fn onboard(paths: &Paths, force: bool) -> anyhow::Result<()> {
    let config_path = paths.config_file();
    if config_path.exists() && !force {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            config_path.display()
        );
        return Ok(());
    }
    Config::default().save(&config_path)?;
    println!("Wrote {}", config_path.display());
    Ok(())
}

fn open_store(paths: &Paths) -> anyhow::Result<(Config, RecordStore)> {
    let config = Config::load_or_default(paths)?;
    config.validate()?;
    let backend = Arc::new(StoreBackend::open(&config.store)?);
    let cache = Arc::new(ReadCache::new(config.cache.capacity));
    let records = RecordStore::new(backend, cache, config.cache.ttl());
    Ok((config, records))
}

fn status(paths: &Paths) -> anyhow::Result<()> {
    let (config, records) = open_store(paths)?;
    println!("Store:      {}", config.store.path);
    println!("Artifacts:  {}", records.artifact_count()?);
    println!("Audit rows: {}", records.audit_count()?);
    match &config.store.remote_url {
        Some(url) => {
            println!("Replica:    {}", url);
            let replica = Arc::new(HttpReplica::new(url, config.store.auth_token.clone())?);
            let sync = SyncService::new(records, replica, &config.sync)?;
            let cursor = sync.cursor();
            println!("Pulled to:  {}", or_dash(&cursor.last_pulled));
            println!("Pushed to:  {}", or_dash(&cursor.last_pushed));
        }
        None => println!("Replica:    (not configured)"),
    }
    Ok(())
}

async fn daemon(paths: &Paths) -> anyhow::Result<()> {
    let (config, records) = open_store(paths)?;
    let remote_url = config.store.remote_url.clone().ok_or_else(|| {
        anyhow::anyhow!("no remote replica configured; set store.remoteUrl in config.json")
    })?;

    let replica = Arc::new(HttpReplica::new(
        &remote_url,
        config.store.auth_token.clone(),
    )?);
    let sync = Arc::new(SyncService::new(records, replica, &config.sync)?);

    let runner = sync.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    info!(replica = %remote_url, "Daemon running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    sync.stop();
    handle.await?;

    let health = sync.health();
    if let Some(ts) = health.last_success {
        println!("Last successful sync: {}", ts.to_rfc3339());
    }
    println!(
        "Pending: {} to push, {} to pull",
        health.pending_push, health.pending_pull
    );
    Ok(())
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}
