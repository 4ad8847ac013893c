mod config;
mod http;
mod import;
mod jobs;
mod metrics;
mod models;
mod review;
mod store;
mod sync;

use clap::{Parser, Subcommand};
use config::Settings;
use eyre::{WrapErr, bail};
use import::{CsvImportHandler, ImportPipeline};
use jobs::{Dispatcher, JobHandler};
use models::{Job, JobKind, JobReport};
use review::{Overrides, resolve_review_item};
use serde_json::json;
use std::{path::PathBuf, sync::Arc, time::Duration};
use store::{SqliteStore, Store};
use sync::{LAST_SYNC_SETTING, SyncHandler, feed::HttpCatalogFeed};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Background jobs for a card inventory: catalog sync, CSV import and the
/// review queue they feed.
#[derive(Parser, Debug)]
#[command(name = "cardbulk", version)]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh the card catalog from the bulk data feed
    Sync,
    /// Import a CSV export into inventory; unmatched rows go to review
    Import {
        /// CSV file with a header row
        file: PathBuf,
    },
    /// Show one job and its report
    Status { job_id: String },
    /// List recent jobs, newest first
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List review items
    Reviews {
        /// Only items raised by this job
        #[arg(long)]
        job: Option<String>,
    },
    /// Import a review item as the given catalog entry and clear it; values
    /// not given are taken from the item's proposal
    Resolve {
        id: i64,
        scryfall_id: String,
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        quantity: Option<i64>,
        #[arg(long)]
        condition: Option<String>,
        #[arg(long)]
        foil: Option<bool>,
        #[arg(long)]
        language: Option<String>,
    },
    /// Drop a review item without importing it
    Discard { id: i64 },
    /// Search the catalog by name
    Search {
        query: String,
        /// Set code to rank first
        #[arg(long, default_value = "")]
        set: String,
    },
    /// List inventory rows
    Inventory {
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Catalog size, pending reviews and last sync time
    Stats,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(path) = cli.database {
        settings.database_path = path;
    }
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::from_settings(&settings)
            .await
            .wrap_err_with(|| format!("opening {}", settings.database_path.display()))?,
    );

    match cli.command {
        Command::Sync => {
            let feed = HttpCatalogFeed::new(
                http::build_client(),
                settings.catalog_manifest_url.clone(),
                settings.catalog_bulk_type.clone(),
            );
            let handler = Arc::new(SyncHandler::new(Arc::new(feed), settings.sync_batch_size));
            let dispatcher = start_dispatcher(&store, &settings);
            let job = dispatcher.enqueue(JobKind::SyncCatalog, handler).await?;
            let report = follow(&dispatcher, store.as_ref(), &job.id).await;
            dispatcher.shutdown();
            finish(report?)?;
        }
        Command::Import { file } => {
            let handler = Arc::new(
                CsvImportHandler::new(&settings.upload_dir)
                    .with_pipeline(ImportPipeline::default().with_workers(settings.import_workers)),
            );
            let job = Job::new(JobKind::ImportCsv);
            handler.stage(&job.id, &file).await?;
            let dispatcher = start_dispatcher(&store, &settings);
            let job = match dispatcher.enqueue_job(job.clone(), handler.clone()).await {
                Ok(job) => job,
                Err(err) => {
                    handler.abandon(&job).await;
                    return Err(err.into());
                }
            };
            let report = follow(&dispatcher, store.as_ref(), &job.id).await;
            dispatcher.shutdown();
            finish(report?)?;
        }
        Command::Status { job_id } => {
            let job = store.get_job(&job_id).await?;
            let report = job.report();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "job": job, "report": report }))?
            );
        }
        Command::Jobs { limit } => {
            for job in store.list_jobs(limit).await? {
                println!(
                    "{}  {:<12} {:<10} {}/{}  {}",
                    job.id,
                    job.kind.as_str(),
                    job.status.as_str(),
                    job.progress_current,
                    job.progress_total,
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Command::Reviews { job } => {
            let items = match job {
                Some(job_id) => store.list_review_items_for_job(&job_id).await?,
                None => store.list_review_items().await?,
            };
            for item in items {
                println!("{}", serde_json::to_string(&item)?);
            }
        }
        Command::Resolve {
            id,
            scryfall_id,
            quantity,
            condition,
            foil,
            language,
        } => {
            let overrides = Overrides {
                quantity,
                condition,
                is_foil: foil,
                language,
            };
            let item = resolve_review_item(store.as_ref(), id, &scryfall_id, overrides).await?;
            println!("{}", serde_json::to_string(&item)?);
        }
        Command::Discard { id } => {
            store.delete_review_item(id).await?;
            info!(target = "cardbulk.cli", review_id = id, "review item discarded");
        }
        Command::Search { query, set } => {
            for card in store.search_cards(&query, &set).await? {
                println!("{}  {}", card.scryfall_id, card.label());
            }
        }
        Command::Inventory { limit, offset } => {
            for record in store.list_inventory(limit, offset).await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Stats => {
            let stats = json!({
                "cards": store.count_cards().await?,
                "review_items": store.count_review_items().await?,
                "last_sync": store.get_setting(LAST_SYNC_SETTING).await?,
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries command output
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn start_dispatcher(store: &Arc<dyn Store>, settings: &Settings) -> Dispatcher {
    let dispatcher = Dispatcher::new(store.clone(), settings.job_queue_capacity);
    dispatcher.start(settings.job_workers);
    info!(
        target = "cardbulk.cli",
        workers = settings.job_workers,
        queue_capacity = settings.job_queue_capacity,
        "dispatcher started"
    );
    dispatcher
}

/// Polls the job once a second, printing its report whenever it changes.
/// The first Ctrl-C cancels the job; polling continues until it settles.
async fn follow(dispatcher: &Dispatcher, store: &dyn Store, job_id: &str) -> eyre::Result<JobReport> {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut last: Option<JobReport> = None;
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.wrap_err("listening for ctrl-c")?;
                interrupted = true;
                warn!(target = "cardbulk.cli", job_id = %job_id, "interrupted; cancelling job");
                dispatcher.cancel(job_id).await;
                continue;
            }
        }

        let job = store.get_job(job_id).await?;
        let report = job.report();
        if last.as_ref() != Some(&report) {
            println!("{}", serde_json::to_string(&report)?);
        }
        if job.status.is_terminal() {
            return Ok(report);
        }
        last = Some(report);
    }
}

fn finish(report: JobReport) -> eyre::Result<()> {
    if let JobReport::Failed { error } = report {
        bail!("job failed: {error}");
    }
    Ok(())
}
