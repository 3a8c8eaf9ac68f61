use thiserror::Error;

use crate::patch::PatchStatus;

/// Failure kinds the engine distinguishes by type rather than message.
///
/// Command handlers wrap these with `anyhow::Context`; callers that need to
/// branch (the patch workflow, the sync driver) downcast to this enum.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("schema change on table '{table}' was rejected by the storage engine: {message}")]
    SchemaApply { table: String, message: String },

    #[error("write failed on table '{table}', record '{record}': {source}")]
    Write {
        table: String,
        record: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("patch {id} is '{status}', expected {expected}")]
    PatchState {
        id: i64,
        status: PatchStatus,
        expected: &'static str,
    },

    #[error("no patch with id {0}")]
    UnknownPatch(i64),

    #[error("table '{0}' is not known to the registry")]
    UnknownTable(String),

    #[error("column '{safe}' is already defined on table '{table}'")]
    DuplicateColumn { table: String, safe: String },
}
