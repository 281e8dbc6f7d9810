use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use plant_guide_core::{
    ingest_plant_file, report_plant, DocumentStore, ReportStatus, ReportedPlant, GUIDE_COLLECTION,
};
use plant_guide_store_sqlite::{PlantStore, SqliteStore};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "pg")]
#[command(about = "Plant Guide loader CLI")]
struct Cli {
    #[arg(long, env = "PLANT_GUIDE_STORE_DIR", default_value = "./chroma_db")]
    store_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Ingest(IngestArgs),
    Collections {
        #[command(subcommand)]
        command: Box<CollectionsCommand>,
    },
    Reports {
        #[command(subcommand)]
        command: Box<ReportsCommand>,
    },
    Runs {
        #[command(subcommand)]
        command: Box<RunsCommand>,
    },
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long, env = "PLANT_GUIDE_CSV", default_value = "Plants - Sheet1.csv")]
    csv: PathBuf,
    #[arg(long, default_value = GUIDE_COLLECTION)]
    collection: String,
}

#[derive(Debug, Subcommand)]
enum CollectionsCommand {
    List,
    Count(CollectionNameArgs),
    Get(CollectionNameArgs),
    Delete(CollectionNameArgs),
}

#[derive(Debug, Args)]
struct CollectionNameArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Subcommand)]
enum ReportsCommand {
    Add(ReportAddArgs),
    List(ReportListArgs),
    Verify(ReportIdArgs),
}

#[derive(Debug, Args)]
struct ReportAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, allow_negative_numbers = true)]
    lat: f64,
    #[arg(long, allow_negative_numbers = true)]
    lng: f64,
    #[arg(long)]
    notes: Option<String>,
    /// RFC3339 timestamp of the sighting; defaults to now.
    #[arg(long, value_parser = parse_rfc3339)]
    observed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Args)]
struct ReportListArgs {
    #[arg(long, value_parser = parse_report_status)]
    status: Option<ReportStatus>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct ReportIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum RunsCommand {
    List,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| format!("invalid RFC3339 timestamp: {err}"))
}

fn parse_report_status(raw: &str) -> Result<ReportStatus, String> {
    ReportStatus::parse(raw).ok_or_else(|| format!("unknown status {raw} (expected pending or verified)"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Ingest(args) => {
            let mut plant_store = PlantStore::open(&cli.store_dir)?;
            run_ingest(&args, &mut plant_store)
        }
        Command::Collections { command } => {
            let mut store = open_migrated(&cli.store_dir)?;
            run_collections(*command, &mut store)
        }
        Command::Reports { command } => {
            let mut plant_store = PlantStore::open(&cli.store_dir)?;
            run_reports(*command, &mut plant_store)
        }
        Command::Runs { command } => {
            let store = open_migrated(&cli.store_dir)?;
            run_runs(&command, &store)
        }
        Command::Db { command } => {
            let mut store = SqliteStore::open_dir(&cli.store_dir)?;
            run_db(&command, &mut store)
        }
    }
}

fn open_migrated(store_dir: &std::path::Path) -> Result<SqliteStore> {
    let mut store = SqliteStore::open_dir(store_dir)?;
    store.migrate()?;
    Ok(store)
}

fn run_ingest(args: &IngestArgs, plant_store: &mut PlantStore) -> Result<()> {
    let collection = if args.collection == plant_store.collections.guide.name {
        plant_store.collections.guide.clone()
    } else {
        plant_store
            .store
            .get_or_create_collection(&args.collection)
            .with_context(|| format!("failed to open collection {}", args.collection))?
    };

    let report = ingest_plant_file(&mut plant_store.store, &collection, &args.csv)
        .with_context(|| format!("failed to ingest {}", args.csv.display()))?;
    let run = plant_store
        .store
        .record_ingest_run(&args.csv.display().to_string(), &report)
        .context("documents were stored but the ingest run could not be recorded; re-run the ingest to record it")?;
    tracing::info!(
        run_id = %run.run_id,
        collection = %report.collection,
        inserted = report.inserted,
        skipped_existing = report.skipped_existing,
        "ingest run recorded"
    );

    emit_json(serde_json::json!({
        "run_id": run.run_id,
        "source": run.source,
        "report": report
    }))
}

fn run_collections(command: CollectionsCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        CollectionsCommand::List => {
            let collections = store.list_collections()?;
            emit_json(serde_json::json!({ "collections": collections }))
        }
        CollectionsCommand::Count(args) => {
            let count = store.count(&args.name)?;
            emit_json(serde_json::json!({ "collection": args.name, "count": count }))
        }
        CollectionsCommand::Get(args) => {
            let documents = store.get_documents(&args.name)?;
            emit_json(serde_json::json!({ "collection": args.name, "documents": documents }))
        }
        CollectionsCommand::Delete(args) => {
            if !store.delete_collection(&args.name)? {
                return Err(anyhow!("collection does not exist: {}", args.name));
            }
            emit_json(serde_json::json!({ "collection": args.name, "deleted": true }))
        }
    }
}

fn run_reports(command: ReportsCommand, plant_store: &mut PlantStore) -> Result<()> {
    match command {
        ReportsCommand::Add(args) => {
            let observed_at = args.observed_at.unwrap_or_else(OffsetDateTime::now_utc);
            let report = ReportedPlant::new(args.name, args.lat, args.lng, args.notes, observed_at)?;
            let reports = plant_store.collections.reports.clone();
            let summary = report_plant(&mut plant_store.store, &reports, &report)
                .context("failed to store plant report")?;
            tracing::debug!(id = %report.id, inserted = summary.inserted, "plant report stored");
            emit_json(serde_json::json!({ "collection": reports.name, "report": report }))
        }
        ReportsCommand::List(args) => {
            let reports = plant_store.store.list_reports(args.status, args.limit)?;
            emit_json(serde_json::json!({ "reports": reports }))
        }
        ReportsCommand::Verify(args) => {
            if !plant_store.store.set_report_status(&args.id, ReportStatus::Verified)? {
                return Err(anyhow!("report does not exist: {}", args.id));
            }
            emit_json(serde_json::json!({ "id": args.id, "status": ReportStatus::Verified }))
        }
    }
}

fn run_runs(command: &RunsCommand, store: &SqliteStore) -> Result<()> {
    match command {
        RunsCommand::List => {
            let runs = store.list_ingest_runs()?;
            emit_json(serde_json::json!({ "runs": runs }))
        }
    }
}

fn run_db(command: &DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(args, store),
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}
