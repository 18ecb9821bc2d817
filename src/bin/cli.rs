//! grade-sync CLI
//!
//! Runs the sync loop locally, or single steps of it.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use grade_sync::{
    error::{AppError, Result},
    models::{Config, EntitySnapshot, RoutingTarget},
    pipeline::{
        ArchiveManager, NotificationDispatcher, RecordSyncScheduler, RefreshWorker, SyncQueue,
    },
    services::{HttpSnapshotProvider, TelegramMessenger},
    storage::{LocalStore, Persistence},
    utils::{
        http,
        log::{header, summary},
    },
};

/// grade-sync - Grade portal sync and course-work archives
#[derive(Parser, Debug)]
#[command(
    name = "grade-sync",
    version,
    about = "Background grade sync with change notifications"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync scheduler until Ctrl-C
    Run,

    /// Run a single sync cycle and exit
    SyncOnce,

    /// Build or reuse the archive of a category
    Archive {
        category: String,

        /// Rebuild even if the archive is fresh
        #[arg(long)]
        force: bool,

        /// Only report the archive state
        #[arg(long, conflicts_with = "force")]
        status: bool,
    },

    /// Start tracking an entity
    Register {
        entity_id: String,

        /// Messaging address (omit for admin-added entities)
        #[arg(long)]
        target: Option<String>,

        #[arg(long)]
        group: Option<String>,
    },

    /// Validate the configuration file
    Validate,

    /// Show configuration and storage info
    Info,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool, level: &str) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Wire the scheduler, worker and archive manager from configuration.
async fn build_scheduler(config: &Config) -> Result<Arc<RecordSyncScheduler>> {
    let store = Arc::new(LocalStore::open(&config.storage.dir).await?);
    let provider = Arc::new(HttpSnapshotProvider::new(&config.provider)?);
    let client =
        http::create_async_client(&config.provider.user_agent, config.provider.timeout_secs)?;
    let messenger = Arc::new(TelegramMessenger::new(&config.telegram, client)?);

    let worker = Arc::new(RefreshWorker::new(
        store.clone(),
        provider,
        NotificationDispatcher::new(messenger),
        Arc::new(SyncQueue::new()),
        &config.sync,
    ));
    let archives = Arc::new(ArchiveManager::new(store.clone(), &config.archive));

    Ok(Arc::new(RecordSyncScheduler::new(
        store,
        worker,
        archives,
        &config.sync,
    )))
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config);
    init_logging(cli.verbose, &config.logging.level);

    log::info!("Loaded configuration from {}", cli.config.display());

    match cli.command {
        Command::Run => {
            config.validate()?;
            let scheduler = build_scheduler(&config).await?;

            header("grade-sync: sync loop running (Ctrl-C to stop)");
            scheduler.start().await;
            tokio::signal::ctrl_c().await?;
            log::info!("Interrupt received, finishing current work...");
            scheduler.stop().await;
        }

        Command::SyncOnce => {
            config.validate()?;
            let scheduler = build_scheduler(&config).await?;

            let report = scheduler.run_once().await?;
            let mut items = vec![("Refreshed", report.enqueued.to_string())];
            for (category, outcome) in &report.archives {
                items.push((category.as_str(), outcome.message.clone()));
            }
            summary("Sync", &items);
        }

        Command::Archive {
            category,
            force,
            status,
        } => {
            let store = Arc::new(LocalStore::open(&config.storage.dir).await?);
            let archives = ArchiveManager::new(store, &config.archive);

            if status {
                let state = archives.status(&category).await?;
                log::info!("Archive '{}': {:?}", category.trim(), state);
                return Ok(());
            }

            let outcome = archives.get_or_create_archive(&category, force).await;
            let Some(parts) = outcome.parts else {
                log::error!("{}", outcome.message);
                return Err(AppError::archive(category, outcome.message));
            };
            log::info!("{}", outcome.message);
            for part in parts {
                println!("{}", part.display());
            }
        }

        Command::Register {
            entity_id,
            target,
            group,
        } => {
            let store = LocalStore::open(&config.storage.dir).await?;
            if store.read_snapshot(&entity_id).await?.is_some() {
                log::warn!("Entity {} is already tracked", entity_id);
                return Ok(());
            }

            let target = target
                .map(RoutingTarget::new)
                .unwrap_or_else(RoutingTarget::placeholder);
            store
                .upsert_snapshot(&EntitySnapshot::registered(&entity_id, target, group))
                .await?;
            log::info!("Registered entity {}", entity_id);
        }

        Command::Validate => {
            log::info!("Validating configuration...");

            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            if config.telegram.bot_token.trim().is_empty() {
                log::warn!("telegram.bot_token is empty; `run` and `sync-once` need it");
            }
            log::info!("✓ Config OK");
        }

        Command::Info => {
            let store = LocalStore::open(&config.storage.dir).await?;
            let tracked = store.count_entities().await?;
            let stale_after = TimeDelta::from_std(config.sync.stale_after())
                .map_err(|e| AppError::config(format!("stale threshold out of range: {e}")))?;
            let due = store.list_stale_entities(Utc::now() - stale_after).await?;

            summary(
                "grade-sync",
                &[
                    ("Storage", store.root_dir().display().to_string()),
                    ("Archives", config.archive.dir.display().to_string()),
                    ("Provider", config.provider.base_url.clone()),
                    ("Sync period", format!("{}s", config.sync.period_secs)),
                    ("Stale after", format!("{}s", config.sync.stale_after_secs)),
                    ("Tracked entities", tracked.to_string()),
                    ("Due for sync", due.len().to_string()),
                ],
            );
        }
    }

    Ok(())
}
