use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vfmigrate_core::db::{self, AdvisoryLock, PgEntitySink, PgMigrationRecordStore};
use vfmigrate_core::source::{read_csv_listing, read_exclusions, read_xml_listing};
use vfmigrate_core::{
    write_report_csv, BatchRunner, EntitySink, MemoryEntityStore, MemoryMigrationRecordStore,
    MemoryRecencyCache, MigrationConfig, MigrationRecordStore, ReferenceData, RunReport,
    SourceRow,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Legacy video archive migration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run database migrations
    Migrate,
    /// Migrate archive listings into the target system
    Run(RunArgs),
    /// Write the failure and migrated-item reports from the tracker
    Report(ReportArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Glob of CSV archive listings
    #[arg(long)]
    source: Vec<String>,
    /// Glob of XML archive listings
    #[arg(long)]
    xml: Vec<String>,
    /// Site code to court name mapping (CSV)
    #[arg(long)]
    sites: Option<PathBuf>,
    /// Channel user list used for share bookings (CSV)
    #[arg(long)]
    channels: Option<PathBuf>,
    /// Archive ids to leave out (CSV, first column)
    #[arg(long)]
    exclusions: Option<PathBuf>,
    /// Migration settings (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Recency cache dump, loaded before the run and written after it
    #[arg(long)]
    cache_file: Option<PathBuf>,
    /// Start from an empty recency cache
    #[arg(long)]
    clear_cache: bool,
    #[arg(long, default_value = "reports")]
    report_dir: PathBuf,
    /// Build entities without writing them or finalising tracker rows
    #[arg(long)]
    dry_run: bool,
    /// Keep the tracker and entity store in memory instead of Postgres
    #[arg(long)]
    in_memory: bool,
    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ReportArgs {
    #[arg(long, default_value = "reports")]
    report_dir: PathBuf,
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Migrate => {
            let pool = connect_pool(2).await?;
            db::run_migrations(&pool).await?;
            info!("Database migrations applied");
            Ok(())
        }
        Command::Run(args) => handle_run(args).await,
        Command::Report(args) => handle_report(args).await,
    }
}

async fn connect_pool(max_connections: u32) -> Result<db::DbPool> {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL")
        .or_else(|_| std::env::var("VFMIGRATE_DATABASE_URL"))
        .context("DATABASE_URL (or VFMIGRATE_DATABASE_URL) must be set")?;
    db::connect(&database_url, max_connections).await
}

fn expand(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let before = paths.len();
        for entry in glob::glob(pattern).with_context(|| format!("bad pattern {pattern}"))? {
            paths.push(entry?);
        }
        if paths.len() == before {
            warn!(pattern = %pattern, "Pattern matched no files");
        }
    }
    Ok(paths)
}

fn load_rows(args: &RunArgs) -> Result<Vec<SourceRow>> {
    let mut rows = Vec::new();
    for path in expand(&args.source)? {
        let file = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let listing = read_csv_listing(file)?;
        info!(path = %path.display(), rows = listing.len(), "Read CSV listing");
        rows.extend(listing);
    }
    for path in expand(&args.xml)? {
        let file = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let listing = read_xml_listing(BufReader::new(file))?;
        info!(path = %path.display(), rows = listing.len(), "Read XML listing");
        rows.extend(listing);
    }
    Ok(rows)
}

fn load_exclusions(path: Option<&Path>) -> Result<HashSet<String>> {
    match path {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            Ok(read_exclusions(file)?)
        }
        None => Ok(HashSet::new()),
    }
}

async fn handle_run(args: RunArgs) -> Result<()> {
    dotenvy::dotenv().ok();

    let mut config = match &args.config {
        Some(path) => MigrationConfig::load(path)?,
        None => MigrationConfig::default(),
    };
    config.dry_run |= args.dry_run;

    let rows = load_rows(&args)?;
    if rows.is_empty() {
        bail!("no archive rows found; pass --source or --xml");
    }
    let reference = ReferenceData::from_paths(args.sites.as_deref(), args.channels.as_deref())?;
    let exclusions = load_exclusions(args.exclusions.as_deref())?;

    let cache = Arc::new(MemoryRecencyCache::new(config.cache_namespace.clone()));
    if let Some(path) = &args.cache_file {
        if path.exists() && !args.clear_cache {
            let loaded = cache.load_from_path(path)?;
            info!(loaded, path = %path.display(), "Loaded recency cache");
        }
    }

    let (report, lock) = if args.in_memory {
        let tracker: Arc<dyn MigrationRecordStore> = Arc::new(MemoryMigrationRecordStore::new());
        let sink: Arc<dyn EntitySink> = Arc::new(MemoryEntityStore::new());
        let runner = BatchRunner::new(config, tracker, sink, cache.clone(), Arc::new(reference))
            .with_exclusions(exclusions)
            .clear_cache_on_start(args.clear_cache);
        (run_until_done(&runner, rows).await?, None)
    } else {
        let pool = connect_pool(config.workers as u32 + 2).await?;
        db::run_migrations(&pool).await?;
        let lock = AdvisoryLock::acquire(&pool, db::MIGRATION_LOCK_KEY).await?;
        let reference = db::sync_courts(&pool, reference).await?;
        let tracker: Arc<dyn MigrationRecordStore> =
            Arc::new(PgMigrationRecordStore::new(pool.clone()));
        let sink: Arc<dyn EntitySink> = Arc::new(PgEntitySink::new(pool));
        let runner = BatchRunner::new(config, tracker, sink, cache.clone(), Arc::new(reference))
            .with_exclusions(exclusions)
            .clear_cache_on_start(args.clear_cache);
        (run_until_done(&runner, rows).await?, Some(lock))
    };
    if let Some(lock) = lock {
        lock.release().await?;
    }

    if let Some(path) = &args.cache_file {
        let written = cache.dump_to_path(path)?;
        info!(written, path = %path.display(), "Saved recency cache");
    }
    finish(&report, &args.report_dir, args.json)
}

async fn run_until_done(runner: &BatchRunner, rows: Vec<SourceRow>) -> Result<RunReport> {
    let cancel = runner.cancel_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current chunk");
            cancel.cancel();
        }
    });
    let report = runner.run(rows).await;
    watcher.abort();
    Ok(report?)
}

async fn handle_report(args: ReportArgs) -> Result<()> {
    let pool = connect_pool(2).await?;
    let tracker = PgMigrationRecordStore::new(pool);
    let records = tracker.all().await?;
    let report = RunReport::from_records(&records);
    finish(&report, &args.report_dir, args.json)
}

fn finish(report: &RunReport, report_dir: &Path, json: bool) -> Result<()> {
    let paths = write_report_csv(report, report_dir)?;
    for path in &paths {
        info!(path = %path.display(), "Wrote report");
    }

    let summary = &report.summary;
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("Total:       {}", summary.total);
        println!("Migrated:    {}", summary.migrated);
        println!("Failed:      {}", summary.failed);
        println!("Skipped:     {}", summary.skipped);
        println!("Duplicates:  {}", summary.duplicates);
        println!("Unaccounted: {}", summary.unaccounted);
        for (category, counts) in report.failures.ranked().into_iter().take(5) {
            println!("  {:<26} {}", category.as_str(), counts.count);
        }
        if summary.cancelled {
            println!("Run was cancelled before all chunks were processed.");
        }
    }

    if summary.unaccounted != 0 && !summary.cancelled {
        warn!(unaccounted = summary.unaccounted, "Run totals do not reconcile");
    }
    Ok(())
}
