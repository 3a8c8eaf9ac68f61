//! SQLite handle and durable meta schema.
//!
//! One database file holds both the synced data tables and the engine's own
//! state: field mappings, materialized column definitions, and schema
//! patches. An in-memory connection provides the deterministic fake used
//! throughout the tests.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Meta tables. Mappings are written when a raw name is first resolved;
/// columns only after the corresponding DDL has succeeded, which is why the
/// two are kept separate.
const META_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS _schema_sync_tables (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS _schema_sync_mappings (
    table_name TEXT NOT NULL,
    raw_name TEXT NOT NULL,
    safe_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (table_name, raw_name),
    UNIQUE (table_name, safe_name)
);
CREATE TABLE IF NOT EXISTS _schema_sync_columns (
    table_name TEXT NOT NULL,
    safe_name TEXT NOT NULL,
    raw_name TEXT NOT NULL,
    column_type TEXT NOT NULL,
    nullable INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    PRIMARY KEY (table_name, safe_name)
);
CREATE TABLE IF NOT EXISTS _schema_sync_patches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    field_name TEXT NOT NULL,
    raw_name TEXT NOT NULL,
    suggested_type TEXT NOT NULL,
    reason TEXT NOT NULL,
    error_message TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    approved_at TEXT,
    approved_by TEXT,
    executed_at TEXT,
    execution_result TEXT
);
";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn =
            Connection::open(path).with_context(|| format!("Opening database {path:?}"))?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Opening in-memory database")?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Setting busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("Applying connection pragmas")?;
        conn.execute_batch(META_SCHEMA)
            .context("Creating meta tables")?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Quotes an identifier for inclusion in SQL text. Raw-name metadata never
/// travels through DDL unquoted.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&chrono::Utc))
        .with_context(|| format!("Parsing stored timestamp '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_tables_exist_after_open() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE '_schema_sync_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn quote_identifier_escapes_embedded_quotes() {
        assert_eq!(quote_identifier("plain"), "\"plain\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
