use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use m2m_migrate_core::{plan_associations, run_scoped, AssociationStore, RelationLayout};
use m2m_migrate_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "m2m")]
#[command(about = "Migrate an implicit many-to-many relation to an explicit join table")]
struct Cli {
    #[arg(long, default_value = "./m2m_migrate.sqlite3")]
    db: PathBuf,

    #[command(flatten)]
    layout: LayoutArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct LayoutArgs {
    /// YAML file describing table and column names.
    #[arg(long = "layout")]
    layout_file: Option<PathBuf>,
    #[arg(long)]
    parent_table: Option<String>,
    #[arg(long)]
    child_table: Option<String>,
    #[arg(long)]
    relation_table: Option<String>,
    #[arg(long)]
    join_table: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    SchemaStatus,
    AddJoinTable,
    Copy(CopyArgs),
    Verify,
    DropImplicit(DropImplicitArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct CopyArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DropImplicitArgs {
    #[arg(long, default_value_t = false)]
    force: bool,
}

impl LayoutArgs {
    fn resolve(&self) -> Result<RelationLayout> {
        let mut layout = match self.layout_file.as_deref() {
            Some(path) => read_layout_file(path)?,
            None => RelationLayout::default(),
        };

        let overrides = [
            (&self.parent_table, &mut layout.parent_table),
            (&self.child_table, &mut layout.child_table),
            (&self.relation_table, &mut layout.relation_table),
            (&self.join_table, &mut layout.join_table),
        ];
        for (value, slot) in overrides {
            if let Some(value) = value {
                slot.clone_from(value);
            }
        }

        layout.validate().context("invalid relation layout")?;
        Ok(layout)
    }
}

fn read_layout_file(path: &Path) -> Result<RelationLayout> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read layout file {}", path.display()))?;
    serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse layout file {}", path.display()))
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
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "m2m command failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let layout = cli.layout.resolve()?;
    let store = SqliteStore::open(&cli.db, layout)?;

    match cli.command {
        Command::SchemaStatus => run_schema_status(&store),
        Command::AddJoinTable => run_add_join_table(store),
        Command::Copy(args) => run_copy(&args, &cli.db, store),
        Command::Verify => run_verify(&store),
        Command::DropImplicit(args) => run_drop_implicit(&args, store),
        Command::IntegrityCheck => run_integrity_check(&store),
    }
}

fn run_schema_status(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy,
        "relation_table_present": status.relation_table_present,
        "join_table_present": status.join_table_present
    }))
}

fn run_add_join_table(mut store: SqliteStore) -> Result<()> {
    let created = store.add_join_table()?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "join_table": store.layout().join_table,
        "created": created,
        "current_version": status.current_version
    }))
}

fn run_copy(args: &CopyArgs, db: &Path, mut store: SqliteStore) -> Result<()> {
    if args.dry_run {
        let fetched = store.fetch_parents_with_children();
        let released = store.release();
        let parents = fetched?;
        released?;

        let plan = plan_associations(&parents);
        return emit_json(serde_json::json!({
            "dry_run": true,
            "parents_scanned": parents.len(),
            "planned_join_records": plan.len(),
            "pairs": plan
        }));
    }

    tracing::info!(db = %db.display(), "starting association copy");
    let join_table = store.layout().join_table.clone();
    let report = run_scoped(store)?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "join_table": join_table,
        "parents_scanned": report.parents_scanned,
        "parents_without_children": report.parents_without_children,
        "join_records_written": report.join_records_written
    }))
}

fn run_verify(store: &SqliteStore) -> Result<()> {
    let report = store.verify_copy()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize verify report")?)
}

fn run_drop_implicit(args: &DropImplicitArgs, mut store: SqliteStore) -> Result<()> {
    let summary = store.drop_implicit_relation(args.force)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "dropped_table": summary.relation_table,
        "forced": summary.forced,
        "verification": summary.verification,
        "current_version": status.current_version
    }))
}

fn run_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}
