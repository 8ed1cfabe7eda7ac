use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use snapguard::cluster::parse_urls;
use snapguard::{
    build_engine, InitOutcome, RestoreOptions, SnapstoreConfig, StoreProvider, UrlsMap,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "snapguard")]
#[command(about = "Validate an etcd data directory and restore it from a snapshot chain", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the data directory and restore it only when it is unusable
    Initialize(RestoreArgs),
    /// Rebuild the data directory from the snapshot store unconditionally
    Restore(RestoreArgs),
    /// Report whether the data directory is valid without changing anything
    Validate {
        /// Data directory of the etcd member
        #[arg(long, default_value = "default.etcd")]
        data_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Data directory of the etcd member
    #[arg(long, default_value = "default.etcd")]
    data_dir: PathBuf,

    /// Member name
    #[arg(long, default_value = "default")]
    name: String,

    /// Initial cluster, e.g. "etcd-0=http://10.0.0.1:2380" (defaults to this member's peer URLs)
    #[arg(long)]
    initial_cluster: Option<String>,

    /// Advertised peer URLs (comma-separated)
    #[arg(long, default_value = "http://localhost:2380")]
    initial_advertise_peer_urls: String,

    /// Token of the restored cluster
    #[arg(long, default_value = "etcd-cluster")]
    initial_cluster_token: String,

    /// Skip content hash verification of fetched snapshots
    #[arg(long)]
    skip_hash_check: bool,

    /// Maximum number of concurrent chunk fetches per snapshot
    #[arg(long, default_value_t = 6)]
    max_fetchers: usize,

    /// Chunk size in bytes
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    chunk_size: u64,

    /// Restore up to this revision instead of the latest one
    #[arg(long)]
    restore_up_to: Option<u64>,

    /// Fail on a gap in the snapshot chain instead of restoring up to it
    #[arg(long)]
    strict_chain: bool,

    /// Retries per chunk after the first failure
    #[arg(long, default_value_t = 3)]
    fetch_retries: usize,

    /// Base delay between chunk retries (e.g. "500ms", "2s")
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    fetch_backoff: Duration,

    /// Snapshot store backend: local, http, s3 or r2 (no store when omitted)
    #[arg(long)]
    storage_provider: Option<String>,

    /// Bucket base URL or local backup directory
    #[arg(long, default_value = ".snapguard.backups")]
    store_container: String,

    /// Prefix of the backups inside the container
    #[arg(long, default_value = "")]
    store_prefix: String,

    /// Temporary directory for fetched snapshots
    #[arg(long, default_value = ".snapguard.tmp")]
    snapstore_temp_directory: PathBuf,
}

impl RestoreArgs {
    fn restore_options(&self) -> anyhow::Result<RestoreOptions> {
        let mut options = RestoreOptions::new(&self.data_dir, &self.name);
        options.peer_urls = parse_urls(&self.initial_advertise_peer_urls)
            .context("Invalid --initial-advertise-peer-urls")?;
        options.cluster_urls = match &self.initial_cluster {
            Some(raw) => UrlsMap::parse(raw).context("Invalid --initial-cluster")?,
            None => UrlsMap::single(&self.name, &options.peer_urls),
        };
        options.cluster_token = self.initial_cluster_token.clone();
        options.skip_hash_check = self.skip_hash_check;
        options.max_fetchers = self.max_fetchers;
        options.chunk_size = self.chunk_size;
        options.restore_up_to = self.restore_up_to;
        options.strict_chain = self.strict_chain;
        options.fetch_retries = self.fetch_retries;
        options.fetch_backoff = self.fetch_backoff;
        Ok(options)
    }

    fn store_config(&self) -> anyhow::Result<Option<SnapstoreConfig>> {
        let Some(provider) = &self.storage_provider else {
            return Ok(None);
        };
        let provider: StoreProvider = provider.parse()?;
        Ok(Some(SnapstoreConfig {
            provider,
            container: self.store_container.clone(),
            prefix: self.store_prefix.clone(),
            temp_dir: self.snapstore_temp_directory.clone(),
        }))
    }
}

/// Flips the returned receiver to `true` on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⚠️  Interrupt received, cancelling restore");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run(command: Command) -> anyhow::Result<()> {
    let (args, forced) = match command {
        Command::Validate { data_dir } => {
            let validation = snapguard::validate(&data_dir);
            let summary = validation.to_string();
            validation.into_result()?;
            info!("✅ {}", summary);
            return Ok(());
        }
        Command::Initialize(args) => (args, false),
        Command::Restore(args) => (args, true),
    };

    let options = args.restore_options()?;
    let store_config = args.store_config()?;
    info!("Data directory: {:?}", options.data_dir);
    info!("Initial cluster: {}", options.cluster_urls);
    if let Some(config) = &store_config {
        info!(
            "Snapshot store: {:?} {} (prefix {})",
            config.provider,
            config.container,
            config.effective_prefix()
        );
    }

    let mut engine = build_engine(&options, store_config.as_ref())
        .context("Failed to open snapshot store")?
        .with_shutdown(shutdown_on_ctrl_c());
    let result = if forced {
        engine.restore().await
    } else {
        engine.initialize().await
    };
    let outcome =
        result.with_context(|| format!("Failed to initialize {:?}", options.data_dir))?;

    match outcome {
        InitOutcome::AlreadyValid => info!("✅ Data directory is valid, starting without restore"),
        InitOutcome::Restored(summary) => {
            if summary.truncated {
                warn!(
                    "⚠️  Restored to revision {}, short of the requested revision",
                    summary.revision
                );
            }
            info!(
                "✅ Restored revision {} (member {:016x}, cluster {:016x})",
                summary.revision, summary.member_id, summary.cluster_id
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("snapguard={}", log_level).into()),
        )
        .init();

    info!("🚀 SnapGuard - etcd data directory guard");

    if let Err(e) = run(cli.command).await {
        eprintln!("❌ Error: {:#}", e);
        std::process::exit(1);
    }
}
