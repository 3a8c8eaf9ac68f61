pub mod apply;
pub mod cli;
pub mod db;
pub mod error;
pub mod infer;
pub mod naming;
pub mod patch;
pub mod registry;
pub mod source;
pub mod sync;
pub mod table;
pub mod value;

use std::{env, fs::File, sync::OnceLock};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{LevelFilter, info, warn};

use crate::cli::{Cli, Commands};
use crate::db::Database;
use crate::error::SyncError;
use crate::patch::PatchQueue;
use crate::registry::{
    CREATED_AT_COLUMN, EXTERNAL_ID_COLUMN, IS_DELETED_COLUMN, SchemaRegistry, UPDATED_AT_COLUMN,
};
use crate::sync::{SyncEngine, SyncOptions};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("schema_sync", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Sync(args) => handle_sync(&args),
        Commands::Schema(args) => handle_schema(&args),
        Commands::Mappings(args) => handle_mappings(&args),
        Commands::Patches(args) => handle_patches(&args),
        Commands::Approve(args) => handle_approve(&args),
        Commands::Reject(args) => handle_reject(&args),
    }
}

fn handle_sync(args: &cli::SyncArgs) -> Result<()> {
    let table = match &args.table {
        Some(table) => table.clone(),
        None => args
            .input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                anyhow!(
                    "Cannot derive a table name from {:?}; pass --table",
                    args.input
                )
            })?,
    };
    info!(
        "Syncing '{}' into table '{table}' of {:?}",
        args.input.display(),
        args.database
    );
    let db = Database::open(&args.database)?;
    let mut source = source::JsonlSource::new(&args.input, &table, &args.id_field);
    let engine = SyncEngine::new(
        &db,
        SyncOptions {
            sample_rows: args.sample_rows,
            page_size: args.page_size,
        },
    );
    let report = engine
        .sync_table(&mut source, &table)
        .with_context(|| format!("Syncing table '{table}'"))?;

    let headers = vec![
        "table".to_string(),
        "seen".to_string(),
        "written".to_string(),
        "skipped fields".to_string(),
        "patches".to_string(),
        "complete".to_string(),
    ];
    let rows = vec![vec![
        report.table.clone(),
        report.records_seen.to_string(),
        report.records_written.to_string(),
        report.skipped_fields.join(", "),
        report.patches_created.to_string(),
        report.complete.to_string(),
    ]];
    table::print_table(&headers, &rows);
    if !report.complete {
        warn!(
            "Sync of '{}' is incomplete; review pending patches and re-run",
            report.table
        );
    }
    Ok(())
}

fn handle_schema(args: &cli::SchemaArgs) -> Result<()> {
    let db = Database::open(&args.database)?;
    let registry = SchemaRegistry::new(&db);
    let definition = registry
        .table_definition(&args.table)?
        .ok_or_else(|| SyncError::UnknownTable(args.table.clone()))?;

    let mut rows = vec![
        standard_row(EXTERNAL_ID_COLUMN, "text"),
        standard_row(CREATED_AT_COLUMN, "timestamp"),
        standard_row(UPDATED_AT_COLUMN, "timestamp"),
        standard_row(IS_DELETED_COLUMN, "boolean"),
    ];
    for column in &definition.columns {
        let nullable = if column.nullable { "yes" } else { "no" };
        rows.push(vec![
            column.safe_name.clone(),
            column.raw_name.clone(),
            column.column_type.to_string(),
            nullable.to_string(),
        ]);
    }
    let headers = vec![
        "column".to_string(),
        "raw name".to_string(),
        "type".to_string(),
        "nullable".to_string(),
    ];
    table::print_table(&headers, &rows);

    if let Some(meta) = &args.meta {
        let file =
            File::create(meta).with_context(|| format!("Creating schema file {meta:?}"))?;
        serde_yaml::to_writer(file, &definition).context("Writing schema YAML")?;
        info!("Wrote definition of '{}' to {meta:?}", args.table);
    }
    info!(
        "Table '{}' has {} dynamic column(s)",
        args.table,
        definition.columns.len()
    );
    Ok(())
}

fn standard_row(name: &str, column_type: &str) -> Vec<String> {
    vec![
        name.to_string(),
        String::new(),
        column_type.to_string(),
        "no".to_string(),
    ]
}

fn handle_mappings(args: &cli::MappingsArgs) -> Result<()> {
    let db = Database::open(&args.database)?;
    let registry = SchemaRegistry::new(&db);
    let mappings = registry.mappings(&args.table)?;
    if mappings.is_empty() {
        info!("Table '{}' has no field mappings", args.table);
        return Ok(());
    }
    let headers = vec![
        "raw name".to_string(),
        "safe name".to_string(),
        "created".to_string(),
    ];
    let rows = mappings
        .iter()
        .map(|mapping| {
            vec![
                mapping.raw_name.clone(),
                mapping.safe_name.clone(),
                mapping.created_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect::<Vec<_>>();
    table::print_table(&headers, &rows);
    info!("Listed {} mapping(s) for table '{}'", rows.len(), args.table);
    Ok(())
}

fn handle_patches(args: &cli::PatchesArgs) -> Result<()> {
    let db = Database::open(&args.database)?;
    let queue = PatchQueue::new(&db);
    let patches = queue.list(args.status.map(Into::into))?;
    if patches.is_empty() {
        info!("No patches match");
        return Ok(());
    }
    let headers = vec![
        "id".to_string(),
        "table".to_string(),
        "field".to_string(),
        "raw name".to_string(),
        "type".to_string(),
        "status".to_string(),
        "created".to_string(),
        "approved by".to_string(),
        "result".to_string(),
    ];
    let rows = patches
        .iter()
        .map(|patch| {
            vec![
                patch.id.to_string(),
                patch.table.clone(),
                patch.field_name.clone(),
                patch.raw_name.clone(),
                patch.suggested_type.to_string(),
                patch.status.to_string(),
                patch.created_at.format("%Y-%m-%d %H:%M").to_string(),
                patch.approved_by.clone().unwrap_or_default(),
                patch.execution_result.clone().unwrap_or_default(),
            ]
        })
        .collect::<Vec<_>>();
    table::print_table(&headers, &rows);
    info!("Listed {} patch(es)", rows.len());
    Ok(())
}

fn handle_approve(args: &cli::ApproveArgs) -> Result<()> {
    let db = Database::open(&args.database)?;
    let queue = PatchQueue::new(&db);
    let registry = SchemaRegistry::new(&db);
    let applier = apply::SchemaApplier::new(&db);
    let patch = queue
        .approve(args.id, &args.approver, &registry, &applier)
        .with_context(|| format!("Approving patch {}", args.id))?;
    info!(
        "Patch {} applied: column '{}' on table '{}'",
        patch.id, patch.field_name, patch.table
    );
    Ok(())
}

fn handle_reject(args: &cli::RejectArgs) -> Result<()> {
    let db = Database::open(&args.database)?;
    let queue = PatchQueue::new(&db);
    let patch = queue
        .reject(args.id, &args.approver, args.reason.as_deref())
        .with_context(|| format!("Rejecting patch {}", args.id))?;
    info!("Patch {} rejected", patch.id);
    Ok(())
}
