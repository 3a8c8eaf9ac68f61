//! Idempotent DDL against the storage engine.
//!
//! The applier issues the minimal statements needed to realize a registry
//! definition: `CREATE TABLE IF NOT EXISTS` and guarded `ALTER TABLE ... ADD
//! COLUMN` (SQLite has no `ADD COLUMN IF NOT EXISTS`, so presence is checked
//! via `PRAGMA table_info` first). It never drops a column and never alters
//! an existing column's type. DDL failures are fatal for the triggering
//! operation and reported, not retried.

use anyhow::Result;
use itertools::Itertools;
use log::{debug, info};

use crate::db::{Database, quote_identifier};
use crate::error::SyncError;
use crate::registry::{
    CREATED_AT_COLUMN, ColumnDef, EXTERNAL_ID_COLUMN, IS_DELETED_COLUMN, TableDefinition,
    UPDATED_AT_COLUMN,
};

pub struct SchemaApplier<'a> {
    db: &'a Database,
}

impl<'a> SchemaApplier<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn create_table(&self, definition: &TableDefinition) -> Result<()> {
        let mut clauses = vec![
            format!("{} TEXT PRIMARY KEY", quote_identifier(EXTERNAL_ID_COLUMN)),
            format!("{} TEXT NOT NULL", quote_identifier(CREATED_AT_COLUMN)),
            format!("{} TEXT NOT NULL", quote_identifier(UPDATED_AT_COLUMN)),
            format!(
                "{} INTEGER NOT NULL DEFAULT 0",
                quote_identifier(IS_DELETED_COLUMN)
            ),
        ];
        clauses.extend(definition.columns.iter().map(column_clause));
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&definition.name),
            clauses.iter().join(", ")
        );
        debug!("DDL: {ddl}");
        self.execute_ddl(&definition.name, &ddl)?;
        info!(
            "Ensured table '{}' with {} dynamic column(s)",
            definition.name,
            definition.columns.len()
        );
        Ok(())
    }

    pub fn add_column(&self, table: &str, column: &ColumnDef) -> Result<()> {
        if self.column_exists(table, &column.safe_name)? {
            debug!(
                "Column '{}' already present on table '{table}', skipping DDL",
                column.safe_name
            );
            return Ok(());
        }
        let ddl = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_identifier(table),
            column_clause(column)
        );
        debug!("DDL: {ddl}");
        self.execute_ddl(table, &ddl)?;
        info!(
            "Added column '{}' ({}) to table '{table}'",
            column.safe_name, column.column_type
        );
        Ok(())
    }

    pub fn column_exists(&self, table: &str, safe_name: &str) -> Result<bool> {
        let mut stmt = self
            .db
            .conn()
            .prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == safe_name {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn execute_ddl(&self, table: &str, ddl: &str) -> Result<()> {
        self.db.conn().execute(ddl, []).map_err(|err| {
            SyncError::SchemaApply {
                table: table.to_string(),
                message: err.to_string(),
            }
        })?;
        Ok(())
    }
}

fn column_clause(column: &ColumnDef) -> String {
    let mut clause = format!(
        "{} {}",
        quote_identifier(&column.safe_name),
        column.column_type.sql_type()
    );
    if !column.nullable {
        clause.push_str(" NOT NULL");
    }
    clause
}
