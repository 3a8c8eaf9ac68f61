use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::patch::PatchStatus;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sync schemaless records into SQLite with reviewed schema evolution",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sync a JSONL record file into a table, discovering new fields
    Sync(SyncArgs),
    /// List a table's columns with their original field names
    Schema(SchemaArgs),
    /// List raw-to-safe field name mappings for a table
    Mappings(MappingsArgs),
    /// List schema patches
    Patches(PatchesArgs),
    /// Approve a pending or failed patch and add its column
    Approve(ApproveArgs),
    /// Reject a pending patch without touching the schema
    Reject(RejectArgs),
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// SQLite database file
    #[arg(short = 'd', long = "database")]
    pub database: PathBuf,
    /// Input record file (one JSON object per line)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Target table name (defaults to the input file stem)
    #[arg(short = 't', long = "table")]
    pub table: Option<String>,
    /// Record field holding the external identifier
    #[arg(long = "id-field", default_value = "id")]
    pub id_field: String,
    /// Number of records sampled for field discovery (0 means full scan)
    #[arg(long, default_value_t = 200)]
    pub sample_rows: usize,
    /// Records fetched per page
    #[arg(long, default_value_t = 500)]
    pub page_size: usize,
}

#[derive(Debug, Args)]
pub struct SchemaArgs {
    /// SQLite database file
    #[arg(short = 'd', long = "database")]
    pub database: PathBuf,
    /// Table to describe
    #[arg(short = 't', long = "table")]
    pub table: String,
    /// Also write the definition to this YAML file
    #[arg(short, long)]
    pub meta: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct MappingsArgs {
    /// SQLite database file
    #[arg(short = 'd', long = "database")]
    pub database: PathBuf,
    /// Table whose mappings to list
    #[arg(short = 't', long = "table")]
    pub table: String,
}

#[derive(Debug, Args)]
pub struct PatchesArgs {
    /// SQLite database file
    #[arg(short = 'd', long = "database")]
    pub database: PathBuf,
    /// Restrict the listing to one status
    #[arg(long, value_enum)]
    pub status: Option<PatchStatusFilter>,
}

#[derive(Debug, Args)]
pub struct ApproveArgs {
    /// SQLite database file
    #[arg(short = 'd', long = "database")]
    pub database: PathBuf,
    /// Patch identifier
    #[arg(long)]
    pub id: i64,
    /// Identity recorded as the approver
    #[arg(long)]
    pub approver: String,
}

#[derive(Debug, Args)]
pub struct RejectArgs {
    /// SQLite database file
    #[arg(short = 'd', long = "database")]
    pub database: PathBuf,
    /// Patch identifier
    #[arg(long)]
    pub id: i64,
    /// Identity recorded as the approver
    #[arg(long)]
    pub approver: String,
    /// Optional reason stored with the rejection
    #[arg(long)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PatchStatusFilter {
    Pending,
    Approved,
    Applied,
    Rejected,
    Failed,
}

impl From<PatchStatusFilter> for PatchStatus {
    fn from(filter: PatchStatusFilter) -> Self {
        match filter {
            PatchStatusFilter::Pending => PatchStatus::Pending,
            PatchStatusFilter::Approved => PatchStatus::Approved,
            PatchStatusFilter::Applied => PatchStatus::Applied,
            PatchStatusFilter::Rejected => PatchStatus::Rejected,
            PatchStatusFilter::Failed => PatchStatus::Failed,
        }
    }
}
