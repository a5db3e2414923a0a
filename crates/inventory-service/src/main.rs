use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use inventory_core::config::ConfigSource;
use inventory_core::{
    ArchiveCoordinator, CipherService, CredentialGuard, KeyVault, Layout, PropertiesConfig,
    StoreManager, StoreOptions,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inventory persistence service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open the store and keep it open until interrupted
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Create a full backup archive
    Backup {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Restore a backup archive over the live data
    Restore {
        archive: PathBuf,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// List backup archives as JSON, newest first
    ListBackups {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run a full integrity check and report WAL status
    Check {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

/// Everything a subcommand needs, wired once.
struct Components {
    store: Arc<StoreManager>,
    archives: ArchiveCoordinator,
    credentials: CredentialGuard,
}

impl Components {
    fn build(data_dir: Option<PathBuf>) -> Result<Self> {
        let layout = match data_dir {
            Some(dir) => Layout::new(dir),
            None => Layout::discover()?,
        };
        std::fs::create_dir_all(layout.root())
            .with_context(|| format!("creating data directory {}", layout.root().display()))?;

        let config: Arc<dyn ConfigSource> = Arc::new(
            PropertiesConfig::load(layout.app_properties()).context("loading configuration")?,
        );
        let vault = KeyVault::load_or_create(layout.key_file()).context("loading encryption key")?;
        let cipher = CipherService::new(vault.key());
        let store = Arc::new(StoreManager::new(
            layout.clone(),
            cipher,
            config.clone(),
            StoreOptions::default(),
        ));
        let archives = ArchiveCoordinator::new(layout.clone(), store.clone(), config);
        let credentials = CredentialGuard::open(&layout);
        Ok(Self {
            store,
            archives,
            credentials,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { data_dir } => run_command(data_dir).await,
        Commands::Backup { data_dir } => backup_command(data_dir),
        Commands::Restore { archive, data_dir } => restore_command(data_dir, archive),
        Commands::ListBackups { data_dir } => list_command(data_dir),
        Commands::Check { data_dir } => check_command(data_dir),
    }
}

async fn run_command(data_dir: Option<PathBuf>) -> Result<()> {
    let components = Components::build(data_dir)?;
    components
        .store
        .initialize()
        .context("initialising store")?;
    info!(
        store = %components.store.store_file().display(),
        session_timeout_minutes = components.credentials.session_timeout().num_minutes(),
        "service started"
    );

    wait_for_termination().await?;

    info!("service stopping");
    let store = components.store.clone();
    tokio::task::spawn_blocking(move || store.shutdown())
        .await
        .context("store shutdown task")?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() -> Result<()> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};
    let mut term = unix_signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        res = signal::ctrl_c() => res.context("waiting for ctrl-c")?,
        _ = term.recv() => info!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_termination() -> Result<()> {
    signal::ctrl_c().await.context("waiting for ctrl-c")
}

fn backup_command(data_dir: Option<PathBuf>) -> Result<()> {
    let components = Components::build(data_dir)?;
    let outcome = components.archives.create_backup();
    components.store.shutdown();
    match outcome.context("creating backup")? {
        Some(archive) => println!("{}", archive.root.display()),
        None => println!("backups disabled"),
    }
    Ok(())
}

fn restore_command(data_dir: Option<PathBuf>, archive: PathBuf) -> Result<()> {
    let components = Components::build(data_dir)?;
    let outcome = components.archives.restore_backup_report(&archive);
    components.store.shutdown();
    let report = outcome.map_err(|e| {
        error!(class = ?e.class(), error = %e, "restore failed");
        anyhow!(e)
    })?;
    if report.restart_required {
        warn!("encryption key changed; restart any running service");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn list_command(data_dir: Option<PathBuf>) -> Result<()> {
    let components = Components::build(data_dir)?;
    let backups = components.archives.list_backups().context("listing backups")?;
    println!("{}", serde_json::to_string_pretty(&backups)?);
    Ok(())
}

fn check_command(data_dir: Option<PathBuf>) -> Result<()> {
    let components = Components::build(data_dir)?;
    let integrity = components
        .store
        .full_integrity_check()
        .context("integrity check")?;
    let wal = components.store.wal_status().context("reading WAL status")?;
    components.store.shutdown();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "integrity": integrity,
            "wal": wal,
        }))?
    );
    if !integrity.ok {
        return Err(anyhow!("integrity check reported {} problem(s)", integrity.messages.len()));
    }
    Ok(())
}
