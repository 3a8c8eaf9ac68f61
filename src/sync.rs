//! The sync/upsert engine.
//!
//! Tables are processed one at a time and records sequentially in source
//! order; the only concurrency admitted is the out-of-band human approval
//! path, which shares no state with a running sync. The engine fails fast:
//! any write error it cannot turn into a pending patch aborts the table's
//! run with the table name and record identifier attached, leaving progress
//! as-is for manual resumption.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use chrono::Utc;
use itertools::Itertools;
use log::{debug, info, warn};
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use serde::Serialize;

use crate::apply::SchemaApplier;
use crate::db::{Database, quote_identifier};
use crate::error::SyncError;
use crate::infer::{self, Inference};
use crate::patch::{PatchQueue, PatchRequest};
use crate::registry::{
    CREATED_AT_COLUMN, ColumnDef, EXTERNAL_ID_COLUMN, FieldMapping, IS_DELETED_COLUMN,
    SchemaRegistry, TableDefinition, UPDATED_AT_COLUMN,
};
use crate::source::{Record, RecordSource};
use crate::value::FieldValue;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Records sampled for field discovery before the write pass
    /// (0 means the full collection).
    pub sample_rows: usize,
    /// Records fetched per page from the source.
    pub page_size: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sample_rows: 200,
            page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub table: String,
    pub records_seen: usize,
    pub records_written: usize,
    /// Raw names of fields whose values were skipped pending approval.
    pub skipped_fields: Vec<String>,
    pub patches_created: usize,
    /// False when any field was skipped or the run was stopped early.
    pub complete: bool,
    pub stopped: bool,
}

impl SyncReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            records_seen: 0,
            records_written: 0,
            skipped_fields: Vec::new(),
            patches_created: 0,
            complete: true,
            stopped: false,
        }
    }
}

pub struct SyncEngine<'a> {
    db: &'a Database,
    options: SyncOptions,
    stop: Arc<AtomicBool>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(db: &'a Database, options: SyncOptions) -> Self {
        Self {
            db,
            options,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag for cooperative cancellation. Checked between records and
    /// between tables; in-flight statements are allowed to complete.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Syncs several sources sequentially, each into the table named by its
    /// collection. Tables are never processed concurrently.
    pub fn sync_all(&self, sources: &mut [Box<dyn RecordSource>]) -> Result<Vec<SyncReport>> {
        let mut reports = Vec::with_capacity(sources.len());
        for source in sources {
            if self.stop.load(Ordering::Relaxed) {
                warn!("Stop requested; remaining tables are not synced");
                break;
            }
            let table = source.collection().to_string();
            reports.push(self.sync_table(source.as_mut(), &table)?);
        }
        Ok(reports)
    }

    /// Syncs one source into `table`, discovering fields, creating or
    /// patch-gating schema, and upserting records in source order.
    pub fn sync_table(&self, source: &mut dyn RecordSource, table: &str) -> Result<SyncReport> {
        let registry = SchemaRegistry::new(self.db);
        let applier = SchemaApplier::new(self.db);
        let patches = PatchQueue::new(self.db);
        let page_size = self.options.page_size.max(1);

        info!(
            "Syncing collection '{}' into table '{table}'",
            source.collection()
        );

        let discovered = self.discover(source, table, &registry, page_size)?;
        let mut run = TableRun {
            db: self.db,
            table: table.to_string(),
            registry,
            applier,
            patches,
            definition: TableDefinition {
                name: table.to_string(),
                columns: Vec::new(),
                created_at: Utc::now(),
            },
            mapping_cache: HashMap::new(),
            skipped: BTreeSet::new(),
            report: SyncReport::new(table),
        };
        run.prepare_schema(&discovered)?;

        let mut cursor: Option<String> = None;
        'pages: loop {
            let page = source.fetch_page(cursor.as_deref(), page_size)?;
            for record in page.records {
                if self.stop.load(Ordering::Relaxed) {
                    warn!("Stop requested; leaving table '{table}' partially synced");
                    run.report.stopped = true;
                    run.report.complete = false;
                    break 'pages;
                }
                run.report.records_seen += 1;
                run.upsert_record(&record)?;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        run.report.skipped_fields = run.skipped.iter().cloned().collect();
        if run.report.complete {
            info!(
                "Table '{table}': {} record(s) written",
                run.report.records_written
            );
        } else {
            warn!(
                "Table '{table}': run incomplete; {} field(s) awaiting approval, {} patch(es) created",
                run.report.skipped_fields.len(),
                run.report.patches_created
            );
        }
        Ok(run.report)
    }

    /// Samples a bounded prefix of the collection and resolves a mapping and
    /// an inference for every raw field name seen.
    fn discover(
        &self,
        source: &mut dyn RecordSource,
        table: &str,
        registry: &SchemaRegistry<'_>,
        page_size: usize,
    ) -> Result<Discovery> {
        let limit = self.options.sample_rows;
        let mut order: Vec<String> = Vec::new();
        let mut samples: HashMap<String, Vec<FieldValue>> = HashMap::new();
        let mut sampled_records = 0usize;
        let mut cursor: Option<String> = None;

        'pages: loop {
            let page = source.fetch_page(cursor.as_deref(), page_size)?;
            for record in &page.records {
                for (raw_name, value) in &record.fields {
                    let bucket = samples.entry(raw_name.clone()).or_insert_with(|| {
                        order.push(raw_name.clone());
                        Vec::new()
                    });
                    if bucket.len() < infer::SAMPLE_LIMIT {
                        bucket.push(value.clone());
                    }
                }
                sampled_records += 1;
                if limit > 0 && sampled_records >= limit {
                    break 'pages;
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        debug!(
            "Discovered {} field(s) across {sampled_records} sampled record(s) of '{table}'",
            order.len()
        );

        let mut mappings = Vec::with_capacity(order.len());
        let mut inferences = HashMap::with_capacity(order.len());
        for raw_name in order {
            let values = &samples[&raw_name];
            let mapping = registry.resolve_field(table, &raw_name)?;
            inferences.insert(raw_name, infer::infer(&mapping.raw_name, values));
            mappings.push(mapping);
        }
        Ok(Discovery {
            mappings,
            inferences,
        })
    }
}

struct Discovery {
    /// In first-seen order.
    mappings: Vec<FieldMapping>,
    inferences: HashMap<String, Inference>,
}

impl Discovery {
    fn inference(&self, raw_name: &str) -> Inference {
        self.inferences.get(raw_name).copied().unwrap_or(Inference {
            column_type: infer::ColumnType::Text,
            nullable: true,
            low_confidence: true,
        })
    }
}

/// Per-table state for one sync run.
struct TableRun<'e> {
    db: &'e Database,
    table: String,
    registry: SchemaRegistry<'e>,
    applier: SchemaApplier<'e>,
    patches: PatchQueue<'e>,
    definition: TableDefinition,
    mapping_cache: HashMap<String, FieldMapping>,
    skipped: BTreeSet<String>,
    report: SyncReport,
}

impl TableRun<'_> {
    /// Materializes a brand-new table outright, or gates newly discovered
    /// fields on an existing table behind pending patches.
    fn prepare_schema(&mut self, discovered: &Discovery) -> Result<()> {
        self.definition = match self.registry.table_definition(&self.table)? {
            Some(existing) => {
                for mapping in self.registry.diff(&existing, &discovered.mappings) {
                    let inference = discovered.inference(&mapping.raw_name);
                    self.gate_field(&mapping, inference, None)?;
                }
                // heals a missing physical table; otherwise a no-op
                self.applier.create_table(&existing)?;
                existing
            }
            None => {
                let columns = discovered
                    .mappings
                    .iter()
                    .map(|mapping| {
                        let inference = discovered.inference(&mapping.raw_name);
                        ColumnDef {
                            safe_name: mapping.safe_name.clone(),
                            raw_name: mapping.raw_name.clone(),
                            column_type: inference.column_type,
                            nullable: inference.nullable,
                        }
                    })
                    .collect();
                let draft = TableDefinition {
                    name: self.table.clone(),
                    columns,
                    created_at: Utc::now(),
                };
                // DDL first; the registry only records what exists
                self.applier.create_table(&draft)?;
                self.registry.ensure_table(&self.table)?;
                for (mapping, column) in discovered.mappings.iter().zip(&draft.columns) {
                    self.registry.add_column(
                        &self.table,
                        mapping,
                        column.column_type,
                        column.nullable,
                    )?;
                }
                self.registry
                    .table_definition(&self.table)?
                    .ok_or_else(|| anyhow!("Table '{}' missing after creation", self.table))?
            }
        };
        for mapping in &discovered.mappings {
            self.mapping_cache
                .insert(mapping.raw_name.clone(), mapping.clone());
        }
        Ok(())
    }

    fn upsert_record(&mut self, record: &Record) -> Result<()> {
        self.resolve_new_fields(record)?;

        loop {
            let now = Utc::now().to_rfc3339();
            let sql = self.upsert_sql();
            let mut params: Vec<SqlValue> = Vec::with_capacity(self.definition.columns.len() + 3);
            params.push(SqlValue::Text(record.external_id.clone()));
            params.push(SqlValue::Text(now.clone()));
            params.push(SqlValue::Text(now));
            for column in &self.definition.columns {
                let bound = record
                    .fields
                    .get(&column.raw_name)
                    .map(|value| value.bind(column.column_type))
                    .unwrap_or(SqlValue::Null);
                params.push(bound);
            }

            let outcome = self
                .db
                .conn()
                .prepare_cached(&sql)
                .and_then(|mut stmt| stmt.execute(rusqlite::params_from_iter(params)));
            match outcome {
                Ok(_) => {
                    self.report.records_written += 1;
                    return Ok(());
                }
                Err(err) => {
                    let message = err.to_string();
                    let Some(missing) = parse_missing_column(&message) else {
                        return Err(SyncError::Write {
                            table: self.table.clone(),
                            record: record.external_id.clone(),
                            source: err,
                        }
                        .into());
                    };
                    if !self.definition.has_column(&missing) {
                        return Err(SyncError::Write {
                            table: self.table.clone(),
                            record: record.external_id.clone(),
                            source: err,
                        }
                        .into());
                    }
                    // registry and physical table disagree; drop the column
                    // from this run, leave a patch, retry the record once
                    // without it
                    warn!(
                        "Table '{}' is missing column '{missing}' despite the registry; gating it behind a patch",
                        self.table
                    );
                    let raw_name = self
                        .registry
                        .reverse(&self.table, &missing)?
                        .unwrap_or_else(|| missing.clone());
                    let value = record.fields.get(&raw_name).cloned().unwrap_or(FieldValue::Null);
                    let inference = infer::infer(&raw_name, std::slice::from_ref(&value));
                    let mapping = self.registry.resolve_field(&self.table, &raw_name)?;
                    self.gate_field(&mapping, inference, Some(&message))?;
                    self.definition
                        .columns
                        .retain(|column| column.safe_name != missing);
                }
            }
        }
    }

    /// Resolves fields that first appear after the discovery sample; they
    /// are never written in this run — a patch is left instead.
    fn resolve_new_fields(&mut self, record: &Record) -> Result<()> {
        for (raw_name, value) in &record.fields {
            if self.mapping_cache.contains_key(raw_name) {
                continue;
            }
            let mapping = self.registry.resolve_field(&self.table, raw_name)?;
            if !self.definition.has_column(&mapping.safe_name) {
                let inference = infer::infer(raw_name, std::slice::from_ref(value));
                self.gate_field(&mapping, inference, None)?;
            }
            self.mapping_cache.insert(raw_name.clone(), mapping);
        }
        Ok(())
    }

    /// Creates (or reuses) a pending patch for an unmaterialized field and
    /// marks the run incomplete.
    fn gate_field(
        &mut self,
        mapping: &FieldMapping,
        inference: Inference,
        error_message: Option<&str>,
    ) -> Result<()> {
        if self
            .patches
            .find_pending(&self.table, &mapping.safe_name)?
            .is_none()
        {
            self.patches.create(PatchRequest {
                table: self.table.clone(),
                field_name: mapping.safe_name.clone(),
                raw_name: mapping.raw_name.clone(),
                suggested_type: inference.column_type,
                reason: match error_message {
                    Some(_) => "write failed on unmaterialized column".to_string(),
                    None => "field discovered during sync".to_string(),
                },
                error_message: error_message.map(str::to_string),
            })?;
            self.report.patches_created += 1;
        }
        self.skipped.insert(mapping.raw_name.clone());
        self.report.complete = false;
        Ok(())
    }

    fn upsert_sql(&self) -> String {
        let mut columns = vec![
            quote_identifier(EXTERNAL_ID_COLUMN),
            quote_identifier(CREATED_AT_COLUMN),
            quote_identifier(UPDATED_AT_COLUMN),
            quote_identifier(IS_DELETED_COLUMN),
        ];
        columns.extend(
            self.definition
                .columns
                .iter()
                .map(|column| quote_identifier(&column.safe_name)),
        );
        let mut placeholders = vec!["?".to_string(); 3];
        placeholders.push("0".to_string());
        placeholders.extend(vec!["?".to_string(); self.definition.columns.len()]);

        // full overwrite on conflict: every dynamic column is set from the
        // incoming record (absent fields become NULL), the soft-delete flag
        // is cleared, and createdAt keeps its original value
        let mut updates = vec![
            format!(
                "{col} = excluded.{col}",
                col = quote_identifier(UPDATED_AT_COLUMN)
            ),
            format!("{} = 0", quote_identifier(IS_DELETED_COLUMN)),
        ];
        updates.extend(self.definition.columns.iter().map(|column| {
            format!(
                "{col} = excluded.{col}",
                col = quote_identifier(&column.safe_name)
            )
        }));

        format!(
            "INSERT INTO {table} ({columns}) VALUES ({placeholders}) \
             ON CONFLICT({key}) DO UPDATE SET {updates}",
            table = quote_identifier(&self.table),
            columns = columns.iter().join(", "),
            placeholders = placeholders.iter().join(", "),
            key = quote_identifier(EXTERNAL_ID_COLUMN),
            updates = updates.iter().join(", "),
        )
    }
}

static MISSING_COLUMN_PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();

/// Extracts the offending column name from the storage engine's
/// "missing column" diagnostics.
pub(crate) fn parse_missing_column(message: &str) -> Option<String> {
    let patterns = MISSING_COLUMN_PATTERNS.get_or_init(|| {
        [
            Regex::new(r"has no column named ([^\s,]+)").expect("pattern compiles"),
            Regex::new(r"no such column: ([^\s,]+)").expect("pattern compiles"),
        ]
    });
    patterns.iter().find_map(|pattern| {
        pattern
            .captures(message)
            .map(|captures| captures[1].trim_matches('"').to_string())
    })
}
