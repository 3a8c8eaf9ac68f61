//! Human-gated schema patch workflow.
//!
//! A patch proposes exactly one new column. Lifecycle:
//! `pending -> approved -> applied`, `pending -> rejected`,
//! `approved -> failed` when the DDL errors; a failed patch may be
//! re-approved. Nothing in this module retries automatically — a failed
//! write must never loop on add-column, because a retry on a wrong type
//! suggestion could corrupt the schema silently. The approval gate is the
//! safety valve.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::apply::SchemaApplier;
use crate::db::{Database, parse_rfc3339};
use crate::error::SyncError;
use crate::infer::ColumnType;
use crate::registry::{ColumnDef, SchemaRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchStatus {
    Pending,
    Approved,
    Applied,
    Rejected,
    Failed,
}

impl PatchStatus {
    pub fn token(self) -> &'static str {
        match self {
            PatchStatus::Pending => "pending",
            PatchStatus::Approved => "approved",
            PatchStatus::Applied => "applied",
            PatchStatus::Rejected => "rejected",
            PatchStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for PatchStatus {
    type Err = anyhow::Error;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "pending" => Ok(PatchStatus::Pending),
            "approved" => Ok(PatchStatus::Approved),
            "applied" => Ok(PatchStatus::Applied),
            "rejected" => Ok(PatchStatus::Rejected),
            "failed" => Ok(PatchStatus::Failed),
            other => Err(anyhow!("Unknown patch status '{other}'")),
        }
    }
}

/// A proposed single-column schema extension awaiting operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPatch {
    pub id: i64,
    pub table: String,
    /// Safe-name candidate for the new column.
    pub field_name: String,
    pub raw_name: String,
    pub suggested_type: ColumnType,
    pub reason: String,
    pub error_message: Option<String>,
    pub status: PatchStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub execution_result: Option<String>,
}

/// Arguments for creating a patch, either from a parsed write failure or
/// from an explicit operator request.
#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub table: String,
    pub field_name: String,
    pub raw_name: String,
    pub suggested_type: ColumnType,
    pub reason: String,
    pub error_message: Option<String>,
}

pub struct PatchQueue<'a> {
    db: &'a Database,
}

impl<'a> PatchQueue<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Stores a new pending patch, deduplicating against an existing pending
    /// patch for the same table and field.
    pub fn create(&self, request: PatchRequest) -> Result<PendingPatch> {
        if let Some(existing) = self.find_pending(&request.table, &request.field_name)? {
            debug!(
                "Patch for '{}.{}' already pending (id {})",
                request.table, request.field_name, existing.id
            );
            return Ok(existing);
        }
        self.db
            .conn()
            .execute(
                "INSERT INTO _schema_sync_patches
                 (table_name, field_name, raw_name, suggested_type, reason, error_message,
                  status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                params![
                    request.table,
                    request.field_name,
                    request.raw_name,
                    request.suggested_type.token(),
                    request.reason,
                    request.error_message,
                    Utc::now().to_rfc3339(),
                ],
            )
            .with_context(|| {
                format!(
                    "Creating patch for '{}.{}'",
                    request.table, request.field_name
                )
            })?;
        let id = self.db.conn().last_insert_rowid();
        info!(
            "Created patch {id}: add '{}' ({}) to table '{}'",
            request.field_name, request.suggested_type, request.table
        );
        self.get(id)
    }

    pub fn get(&self, id: i64) -> Result<PendingPatch> {
        self.db
            .conn()
            .query_row(
                &format!("{PATCH_SELECT} WHERE id = ?1"),
                params![id],
                patch_from_row,
            )
            .optional()
            .with_context(|| format!("Loading patch {id}"))?
            .ok_or_else(|| SyncError::UnknownPatch(id).into())
    }

    pub fn list(&self, status: Option<PatchStatus>) -> Result<Vec<PendingPatch>> {
        let (sql, filter) = match status {
            Some(status) => (
                format!("{PATCH_SELECT} WHERE status = ?1 ORDER BY id"),
                Some(status.token()),
            ),
            None => (format!("{PATCH_SELECT} ORDER BY id"), None),
        };
        let mut stmt = self.db.conn().prepare(&sql)?;
        let rows = match filter {
            Some(token) => stmt.query_map(params![token], patch_from_row),
            None => stmt.query_map([], patch_from_row),
        }?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Listing patches")
    }

    pub fn find_pending(&self, table: &str, field_name: &str) -> Result<Option<PendingPatch>> {
        self.db
            .conn()
            .query_row(
                &format!(
                    "{PATCH_SELECT} WHERE table_name = ?1 AND field_name = ?2 AND status = 'pending'"
                ),
                params![table, field_name],
                patch_from_row,
            )
            .optional()
            .with_context(|| format!("Looking up pending patch for '{table}.{field_name}'"))
    }

    /// Approves a pending (or failed) patch and synchronously executes the
    /// add-column DDL. Success transitions to `applied` and records the
    /// column in the registry so it becomes discoverable; a DDL error
    /// transitions to `failed` with the error captured for inspection, and
    /// is returned to the caller.
    pub fn approve(
        &self,
        id: i64,
        approver: &str,
        registry: &SchemaRegistry<'_>,
        applier: &SchemaApplier<'_>,
    ) -> Result<PendingPatch> {
        let patch = self.get(id)?;
        match patch.status {
            PatchStatus::Pending | PatchStatus::Failed => {}
            other => {
                return Err(SyncError::PatchState {
                    id,
                    status: other,
                    expected: "'pending' or 'failed'",
                }
                .into());
            }
        }
        self.db
            .conn()
            .execute(
                "UPDATE _schema_sync_patches
                 SET status = 'approved', approved_at = ?2, approved_by = ?3
                 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339(), approver],
            )
            .with_context(|| format!("Marking patch {id} approved"))?;

        // The persisted mapping decides the final safe name; for a manual
        // patch this may differ from the suggested candidate.
        let mapping = registry.resolve_field(&patch.table, &patch.raw_name)?;
        let already_materialized = registry
            .table_definition(&patch.table)?
            .is_some_and(|def| def.has_column(&mapping.safe_name));
        if already_materialized {
            self.record_execution(id, PatchStatus::Applied, "column already present")?;
            info!("Patch {id} applied: column '{}' already present", mapping.safe_name);
            return self.get(id);
        }

        let column = ColumnDef {
            safe_name: mapping.safe_name.clone(),
            raw_name: patch.raw_name.clone(),
            column_type: patch.suggested_type,
            nullable: true,
        };
        match applier.add_column(&patch.table, &column) {
            Ok(()) => {
                registry.ensure_table(&patch.table)?;
                registry.add_column(&patch.table, &mapping, patch.suggested_type, true)?;
                self.record_execution(id, PatchStatus::Applied, "column added")?;
                info!(
                    "Patch {id} applied: column '{}' added to table '{}'",
                    mapping.safe_name, patch.table
                );
                self.get(id)
            }
            Err(err) => {
                self.record_execution(id, PatchStatus::Failed, &err.to_string())?;
                warn!("Patch {id} failed: {err}");
                Err(err)
            }
        }
    }

    /// Rejects a pending patch. Terminal; no DDL is executed.
    pub fn reject(&self, id: i64, approver: &str, reason: Option<&str>) -> Result<PendingPatch> {
        let patch = self.get(id)?;
        if patch.status != PatchStatus::Pending {
            return Err(SyncError::PatchState {
                id,
                status: patch.status,
                expected: "'pending'",
            }
            .into());
        }
        self.db
            .conn()
            .execute(
                "UPDATE _schema_sync_patches
                 SET status = 'rejected', approved_at = ?2, approved_by = ?3,
                     execution_result = ?4
                 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339(), approver, reason],
            )
            .with_context(|| format!("Marking patch {id} rejected"))?;
        info!("Patch {id} rejected by {approver}");
        self.get(id)
    }

    fn record_execution(&self, id: i64, status: PatchStatus, result: &str) -> Result<()> {
        self.db
            .conn()
            .execute(
                "UPDATE _schema_sync_patches
                 SET status = ?2, executed_at = ?3, execution_result = ?4
                 WHERE id = ?1",
                params![id, status.token(), Utc::now().to_rfc3339(), result],
            )
            .with_context(|| format!("Recording execution of patch {id}"))?;
        Ok(())
    }
}

const PATCH_SELECT: &str = "SELECT id, table_name, field_name, raw_name, suggested_type, reason,
        error_message, status, created_at, approved_at, approved_by, executed_at,
        execution_result
 FROM _schema_sync_patches";

fn patch_from_row(row: &Row<'_>) -> rusqlite::Result<PendingPatch> {
    let suggested_type: String = row.get(4)?;
    let status: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let approved_at: Option<String> = row.get(9)?;
    let executed_at: Option<String> = row.get(11)?;
    Ok(PendingPatch {
        id: row.get(0)?,
        table: row.get(1)?,
        field_name: row.get(2)?,
        raw_name: row.get(3)?,
        suggested_type: suggested_type
            .parse()
            .map_err(|err| stored_value_error(4, err))?,
        reason: row.get(5)?,
        error_message: row.get(6)?,
        status: status.parse().map_err(|err| stored_value_error(7, err))?,
        created_at: parse_rfc3339(&created_at).map_err(|err| stored_value_error(8, err))?,
        approved_at: approved_at
            .as_deref()
            .map(|value| parse_rfc3339(value).map_err(|err| stored_value_error(9, err)))
            .transpose()?,
        approved_by: row.get(10)?,
        executed_at: executed_at
            .as_deref()
            .map(|value| parse_rfc3339(value).map_err(|err| stored_value_error(11, err)))
            .transpose()?,
        execution_result: row.get(12)?,
    })
}

fn stored_value_error(column: usize, err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err.into())
}
