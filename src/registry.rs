//! Durable schema registry: table definitions and raw-to-safe field mappings.
//!
//! The registry is the authoritative record of every synced table's column
//! set. Mappings are persisted the moment a raw name is first resolved;
//! column definitions are persisted by callers only after the corresponding
//! DDL has succeeded (see [`crate::apply::SchemaApplier`]). Column state is
//! append-only: a definition is never removed, even if the source stops
//! sending the field.

use std::collections::HashSet;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::db::{Database, parse_rfc3339};
use crate::error::SyncError;
use crate::infer::ColumnType;
use crate::naming::{CollisionResolver, normalize};

/// Upsert key column present on every synced table.
pub const EXTERNAL_ID_COLUMN: &str = "externalId";
pub const CREATED_AT_COLUMN: &str = "createdAt";
pub const UPDATED_AT_COLUMN: &str = "updatedAt";
/// Soft-delete flag, cleared on every upsert.
pub const IS_DELETED_COLUMN: &str = "isDeleted";

pub const STANDARD_COLUMNS: &[&str] = &[
    EXTERNAL_ID_COLUMN,
    CREATED_AT_COLUMN,
    UPDATED_AT_COLUMN,
    IS_DELETED_COLUMN,
];

/// One resolved raw-to-safe name pair, scoped to a table namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub table: String,
    pub raw_name: String,
    pub safe_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub safe_name: String,
    pub raw_name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub created_at: DateTime<Utc>,
}

impl TableDefinition {
    pub fn column(&self, safe_name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|col| col.safe_name == safe_name)
    }

    pub fn has_column(&self, safe_name: &str) -> bool {
        self.column(safe_name).is_some()
    }
}

pub struct SchemaRegistry<'a> {
    db: &'a Database,
}

impl<'a> SchemaRegistry<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Registers `name` if absent and returns its definition. Idempotent;
    /// a fresh table starts with only the standard columns.
    pub fn ensure_table(&self, name: &str) -> Result<TableDefinition> {
        self.db
            .conn()
            .execute(
                "INSERT OR IGNORE INTO _schema_sync_tables (name, created_at) VALUES (?1, ?2)",
                params![name, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Registering table '{name}'"))?;
        self.table_definition(name)?
            .ok_or_else(|| anyhow!("Table '{name}' missing immediately after registration"))
    }

    pub fn table_definition(&self, name: &str) -> Result<Option<TableDefinition>> {
        let conn = self.db.conn();
        let created_at: Option<String> = conn
            .query_row(
                "SELECT created_at FROM _schema_sync_tables WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Loading table '{name}'"))?;
        let Some(created_at) = created_at else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT safe_name, raw_name, column_type, nullable
             FROM _schema_sync_columns
             WHERE table_name = ?1
             ORDER BY created_at, safe_name",
        )?;
        let rows = stmt
            .query_map(params![name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Loading columns of table '{name}'"))?;

        let mut columns = Vec::with_capacity(rows.len());
        for (safe_name, raw_name, column_type, nullable) in rows {
            columns.push(ColumnDef {
                safe_name,
                raw_name,
                column_type: column_type.parse()?,
                nullable: nullable != 0,
            });
        }
        Ok(Some(TableDefinition {
            name: name.to_string(),
            columns,
            created_at: parse_rfc3339(&created_at)?,
        }))
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .db
            .conn()
            .prepare("SELECT name FROM _schema_sync_tables ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Listing registered tables")?;
        Ok(names)
    }

    /// Appends one column definition. Callers invoke this only after the
    /// matching DDL succeeded. Fails if the safe name is already present.
    pub fn add_column(
        &self,
        table: &str,
        mapping: &FieldMapping,
        column_type: ColumnType,
        nullable: bool,
    ) -> Result<TableDefinition> {
        let definition = self
            .table_definition(table)?
            .ok_or_else(|| SyncError::UnknownTable(table.to_string()))?;
        if definition.has_column(&mapping.safe_name) {
            return Err(SyncError::DuplicateColumn {
                table: table.to_string(),
                safe: mapping.safe_name.clone(),
            }
            .into());
        }
        self.db
            .conn()
            .execute(
                "INSERT INTO _schema_sync_columns
                 (table_name, safe_name, raw_name, column_type, nullable, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    table,
                    mapping.safe_name,
                    mapping.raw_name,
                    column_type.token(),
                    i64::from(nullable),
                    Utc::now().to_rfc3339(),
                ],
            )
            .with_context(|| {
                format!("Recording column '{}' on table '{table}'", mapping.safe_name)
            })?;
        self.table_definition(table)?
            .ok_or_else(|| anyhow!("Table '{table}' vanished while adding a column"))
    }

    /// Resolves a raw field name to its safe name within `table`.
    ///
    /// The persisted mapping wins: the normalization and collision algorithm
    /// only runs for raw names never seen in this namespace, so repeat
    /// discovery is idempotent across process restarts.
    pub fn resolve_field(&self, table: &str, raw_name: &str) -> Result<FieldMapping> {
        if let Some(existing) = self.mapping(table, raw_name)? {
            return Ok(existing);
        }
        let taken = self.safe_names(table)?;
        let candidate = normalize(raw_name);
        let safe_name = CollisionResolver::new(&taken).resolve(&candidate);
        let created_at = Utc::now();
        self.db
            .conn()
            .execute(
                "INSERT INTO _schema_sync_mappings (table_name, raw_name, safe_name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![table, raw_name, safe_name, created_at.to_rfc3339()],
            )
            .with_context(|| format!("Persisting mapping for '{raw_name}' on table '{table}'"))?;
        debug!("Mapped '{raw_name}' -> '{safe_name}' on table '{table}'");
        Ok(FieldMapping {
            table: table.to_string(),
            raw_name: raw_name.to_string(),
            safe_name,
            created_at,
        })
    }

    pub fn mapping(&self, table: &str, raw_name: &str) -> Result<Option<FieldMapping>> {
        let row = self
            .db
            .conn()
            .query_row(
                "SELECT safe_name, created_at FROM _schema_sync_mappings
                 WHERE table_name = ?1 AND raw_name = ?2",
                params![table, raw_name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .with_context(|| format!("Looking up mapping for '{raw_name}' on '{table}'"))?;
        row.map(|(safe_name, created_at)| {
            Ok(FieldMapping {
                table: table.to_string(),
                raw_name: raw_name.to_string(),
                safe_name,
                created_at: parse_rfc3339(&created_at)?,
            })
        })
        .transpose()
    }

    pub fn mappings(&self, table: &str) -> Result<Vec<FieldMapping>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT raw_name, safe_name, created_at FROM _schema_sync_mappings
             WHERE table_name = ?1
             ORDER BY created_at, raw_name",
        )?;
        let rows = stmt
            .query_map(params![table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Listing mappings of table '{table}'"))?;
        rows.into_iter()
            .map(|(raw_name, safe_name, created_at)| {
                Ok(FieldMapping {
                    table: table.to_string(),
                    raw_name,
                    safe_name,
                    created_at: parse_rfc3339(&created_at)?,
                })
            })
            .collect()
    }

    /// Recovers the exact original raw name for a safe name, byte for byte.
    pub fn reverse(&self, table: &str, safe_name: &str) -> Result<Option<String>> {
        self.db
            .conn()
            .query_row(
                "SELECT raw_name FROM _schema_sync_mappings
                 WHERE table_name = ?1 AND safe_name = ?2",
                params![table, safe_name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Reverse lookup of '{safe_name}' on '{table}'"))
    }

    /// Mappings that have no materialized column yet.
    pub fn diff(&self, definition: &TableDefinition, discovered: &[FieldMapping]) -> Vec<FieldMapping> {
        discovered
            .iter()
            .filter(|mapping| !definition.has_column(&mapping.safe_name))
            .cloned()
            .collect()
    }

    fn safe_names(&self, table: &str) -> Result<HashSet<String>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT safe_name FROM _schema_sync_mappings WHERE table_name = ?1
             UNION
             SELECT safe_name FROM _schema_sync_columns WHERE table_name = ?1",
        )?;
        let names = stmt
            .query_map(params![table], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()
            .with_context(|| format!("Collecting safe names of table '{table}'"))?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_db() -> Database {
        Database::open_in_memory().expect("in-memory database")
    }

    #[test]
    fn resolve_field_round_trips_the_raw_name() {
        let db = registry_db();
        let registry = SchemaRegistry::new(&db);
        let mapping = registry.resolve_field("orders", "2nd Payment %").unwrap();
        assert_eq!(mapping.safe_name, "f2ndPayment");
        assert_eq!(
            registry.reverse("orders", "f2ndPayment").unwrap().as_deref(),
            Some("2nd Payment %")
        );
    }

    #[test]
    fn resolve_field_is_idempotent_for_the_same_raw_name() {
        let db = registry_db();
        let registry = SchemaRegistry::new(&db);
        let first = registry.resolve_field("orders", "Status").unwrap();
        let second = registry.resolve_field("orders", "Status").unwrap();
        assert_eq!(first.safe_name, second.safe_name);
        assert_eq!(registry.mappings("orders").unwrap().len(), 1);
    }

    #[test]
    fn identical_candidates_get_distinct_suffixes() {
        let db = registry_db();
        let registry = SchemaRegistry::new(&db);
        let first = registry.resolve_field("orders", "Status").unwrap();
        let second = registry.resolve_field("orders", "STATUS ").unwrap();
        assert_eq!(first.safe_name, "status");
        assert_eq!(second.safe_name, "status1");
        assert_eq!(
            registry.reverse("orders", "status1").unwrap().as_deref(),
            Some("STATUS ")
        );
    }

    #[test]
    fn namespaces_are_independent() {
        let db = registry_db();
        let registry = SchemaRegistry::new(&db);
        let orders = registry.resolve_field("orders", "Status").unwrap();
        let users = registry.resolve_field("users", "Status").unwrap();
        assert_eq!(orders.safe_name, "status");
        assert_eq!(users.safe_name, "status");
    }

    #[test]
    fn add_column_rejects_duplicates_and_unknown_tables() {
        let db = registry_db();
        let registry = SchemaRegistry::new(&db);
        let mapping = registry.resolve_field("orders", "Amount").unwrap();

        let missing = registry.add_column("orders", &mapping, ColumnType::Number, true);
        assert!(missing.is_err());

        registry.ensure_table("orders").unwrap();
        let definition = registry
            .add_column("orders", &mapping, ColumnType::Number, true)
            .unwrap();
        assert!(definition.has_column("amount"));

        let duplicate = registry.add_column("orders", &mapping, ColumnType::Text, true);
        assert!(duplicate.is_err());
    }

    #[test]
    fn diff_reports_unmaterialized_mappings() {
        let db = registry_db();
        let registry = SchemaRegistry::new(&db);
        registry.ensure_table("orders").unwrap();
        let amount = registry.resolve_field("orders", "Amount").unwrap();
        let status = registry.resolve_field("orders", "Status").unwrap();
        let definition = registry
            .add_column("orders", &amount, ColumnType::Number, true)
            .unwrap();

        let pending = registry.diff(&definition, &[amount, status.clone()]);
        assert_eq!(pending, vec![status]);
    }

    #[test]
    fn ensure_table_is_idempotent() {
        let db = registry_db();
        let registry = SchemaRegistry::new(&db);
        registry.ensure_table("orders").unwrap();
        registry.ensure_table("orders").unwrap();
        assert_eq!(registry.table_names().unwrap(), vec!["orders".to_string()]);
    }
}
