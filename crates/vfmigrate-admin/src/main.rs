use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::Table;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vfmigrate_core::db::{self, PgMigrationRecordStore};
use vfmigrate_core::tracker::MigrationRecord;
use vfmigrate_core::{MemoryRecencyCache, MigrationRecordStore, MigrationStatus, RecencyCache};

#[derive(Parser, Debug)]
#[command(author, version, about = "vfmigrate administrative tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List tracker records
    Records(RecordsArgs),
    /// Return terminal records to PENDING so the next run migrates them again
    Reset(ResetArgs),
    /// Empty a saved recency cache file
    ClearCache(ClearCacheArgs),
}

#[derive(Args, Debug, Default)]
struct RecordsArgs {
    /// PENDING, SUCCESS, FAILED or SKIPPED
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    name: Option<String>,
    /// Recording-group key prefix
    #[arg(long)]
    group: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Args, Debug, Default)]
struct ResetArgs {
    archive_ids: Vec<String>,
}

#[derive(Args, Debug, Default)]
struct ClearCacheArgs {
    #[arg(long)]
    cache_file: PathBuf,
    #[arg(long, default_value = "vf:")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Records(args) => handle_records(args).await,
        Command::Reset(args) => handle_reset(args).await,
        Command::ClearCache(args) => handle_clear_cache(args).await,
    }
}

async fn tracker() -> Result<PgMigrationRecordStore> {
    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL")
        .or_else(|_| env::var("VFMIGRATE_DATABASE_URL"))
        .context("DATABASE_URL (or VFMIGRATE_DATABASE_URL) must be set")?;

    let pool = db::connect(&database_url, 2).await?;
    db::run_migrations(&pool).await?;
    Ok(PgMigrationRecordStore::new(pool))
}

async fn handle_records(args: RecordsArgs) -> Result<()> {
    let store = tracker().await?;

    let records = match (&args.status, &args.name, &args.group) {
        (Some(status), _, _) => {
            let Some(status) = MigrationStatus::from_tag(status) else {
                bail!("unknown status '{status}'");
            };
            store.find_by_status(status).await?
        }
        (None, Some(name), _) => store.find_by_archive_name(name).await?,
        (None, None, Some(prefix)) => store.find_by_group_key_prefix(prefix).await?,
        (None, None, None) => store.all().await?,
    };

    if records.is_empty() {
        println!("No matching records.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "archive_id",
        "archive_name",
        "status",
        "category",
        "version",
        "latest",
    ]);
    for record in records.iter().take(args.limit) {
        table.add_row(row(record));
    }
    println!("{table}");
    if records.len() > args.limit {
        println!("... {} more (raise --limit)", records.len() - args.limit);
    }
    Ok(())
}

fn row(record: &MigrationRecord) -> Vec<String> {
    let version = match (record.version_label, &record.version_number) {
        (Some(label), Some(number)) => format!("{label} {number}"),
        _ => String::new(),
    };
    vec![
        record.archive_id.clone(),
        record.archive_name.clone(),
        record.status.to_string(),
        record
            .failure_category
            .map(|c| c.to_string())
            .unwrap_or_default(),
        version,
        if record.is_most_recent { "yes" } else { "" }.to_string(),
    ]
}

async fn handle_reset(args: ResetArgs) -> Result<()> {
    if args.archive_ids.is_empty() {
        bail!("pass at least one archive id");
    }
    let store = tracker().await?;
    for archive_id in &args.archive_ids {
        store.reset_to_pending(archive_id).await?;
        info!(archive_id = %archive_id, "Reset record to PENDING");
    }
    println!("Reset {} record(s).", args.archive_ids.len());
    Ok(())
}

async fn handle_clear_cache(args: ClearCacheArgs) -> Result<()> {
    let cache = MemoryRecencyCache::new(args.namespace);
    if args.cache_file.exists() {
        cache.load_from_path(&args.cache_file)?;
    }
    let cleared = cache.clear().await?;
    cache.dump_to_path(&args.cache_file)?;
    println!("Cleared {cleared} cache entries.");
    Ok(())
}
