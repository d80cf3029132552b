//! Replicated table description and the statements generated from it
//!
//! Rows travel between databases as `to_jsonb(row)::text` and are written
//! back with `jsonb_populate_recordset`, so no per-column type mapping is
//! needed on either side.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ============================================================================
// Id types
// ============================================================================

/// Type of a table's `id` column, deciding how id lists are bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    /// `integer` / `smallint`
    Integer,
    /// `bigint`
    BigInt,
    /// `uuid`
    Uuid,
    /// `text` / `character varying`
    Text,
    /// Anything else (enums, domains), compared as text
    Other(String),
}

impl IdType {
    /// Map `information_schema.columns` `data_type` / `udt_name`.
    pub fn from_column_type(data_type: &str, udt_name: &str) -> Self {
        match data_type {
            "integer" | "smallint" => Self::Integer,
            "bigint" => Self::BigInt,
            "uuid" => Self::Uuid,
            "text" | "character varying" => Self::Text,
            "USER-DEFINED" => Self::Other(udt_name.to_string()),
            other => Self::Other(other.to_string()),
        }
    }

    /// Predicate matching `id` against the bound id array `$1`.
    pub fn id_match(&self) -> &'static str {
        match self {
            Self::Integer | Self::BigInt => "\"id\" = ANY($1::bigint[])",
            Self::Uuid => "\"id\" = ANY($1::uuid[])",
            Self::Text => "\"id\" = ANY($1::text[])",
            Self::Other(_) => "\"id\"::text = ANY($1::text[])",
        }
    }

    /// Parse change log row ids (always text) for binding.
    pub fn parse_ids<'a, I>(&self, table: &str, ids: I) -> Result<IdList>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let invalid = |id: &String| SyncError::InvalidRowId {
            table: table.to_string(),
            id: id.clone(),
        };
        match self {
            Self::Integer | Self::BigInt => ids
                .into_iter()
                .map(|id| id.parse::<i64>().map_err(|_| invalid(id)))
                .collect::<Result<Vec<_>>>()
                .map(IdList::BigInt),
            Self::Uuid => ids
                .into_iter()
                .map(|id| Uuid::parse_str(id).map_err(|_| invalid(id)))
                .collect::<Result<Vec<_>>>()
                .map(IdList::Uuid),
            Self::Text | Self::Other(_) => Ok(IdList::Text(ids.into_iter().cloned().collect())),
        }
    }
}

/// Row ids bound as a single array parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum IdList {
    /// `bigint[]`
    BigInt(Vec<i64>),
    /// `uuid[]`
    Uuid(Vec<Uuid>),
    /// `text[]`
    Text(Vec<String>),
}

impl IdList {
    /// Number of ids
    pub fn len(&self) -> usize {
        match self {
            Self::BigInt(v) => v.len(),
            Self::Uuid(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Query parameter for `$1`
    pub fn as_param(&self) -> &(dyn ToSql + Sync) {
        match self {
            Self::BigInt(v) => v,
            Self::Uuid(v) => v,
            Self::Text(v) => v,
        }
    }
}

// ============================================================================
// Table
// ============================================================================

/// A replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name in the `public` schema
    pub name: String,
    /// Column names in ordinal order
    pub columns: Vec<String>,
    /// Type of the `id` column
    pub id_type: IdType,
    /// Tables this one references through non-deferrable foreign keys
    pub deps: BTreeSet<String>,
}

impl Table {
    /// Create a table description. `columns` must contain `id`.
    pub fn new(name: impl Into<String>, columns: Vec<String>, id_type: IdType) -> Result<Self> {
        let name = name.into();
        if !columns.iter().any(|c| c == "id") {
            return Err(SyncError::MissingIdColumn { table: name });
        }
        Ok(Self {
            name,
            columns,
            id_type,
            deps: BTreeSet::new(),
        })
    }

    /// Add a dependency on `table`
    pub fn with_dep(mut self, table: impl Into<String>) -> Self {
        self.deps.insert(table.into());
        self
    }

    /// Quoted table name
    pub fn quoted(&self) -> String {
        quote_ident(&self.name)
    }

    fn quoted_columns(&self) -> Vec<String> {
        self.columns.iter().map(|c| quote_ident(c)).collect()
    }

    /// Every row as JSON text, for the initial copy.
    pub fn select_all_sql(&self) -> String {
        format!(
            "SELECT to_jsonb(src_row)::text FROM {} src_row",
            self.quoted()
        )
    }

    /// All ids as text, for the destination row tracker.
    pub fn select_ids_sql(&self) -> String {
        format!("SELECT \"id\"::text FROM {}", self.quoted())
    }

    /// Id and JSON text of the rows whose id is in `$1`.
    pub fn select_rows_by_id_sql(&self) -> String {
        format!(
            "SELECT src_row.\"id\"::text, to_jsonb(src_row)::text FROM {} src_row WHERE src_row.{}",
            self.quoted(),
            self.id_type.id_match()
        )
    }

    /// Insert a JSON array of rows bound as `$1`.
    pub fn insert_sql(&self) -> String {
        let cols = self.quoted_columns().join(", ");
        format!(
            "INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_recordset(NULL::{table}, $1::text::jsonb)",
            table = self.quoted(),
        )
    }

    /// Insert a JSON array of rows bound as `$1`, overwriting rows that
    /// already exist.
    pub fn upsert_sql(&self) -> String {
        let assignments: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.as_str() != "id")
            .map(|c| {
                let q = quote_ident(c);
                format!("{q} = excluded.{q}")
            })
            .collect();
        let conflict = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };
        format!("{} ON CONFLICT (\"id\") {}", self.insert_sql(), conflict)
    }

    /// Delete the rows whose id is in `$1`.
    pub fn delete_sql(&self) -> String {
        format!("DELETE FROM {} WHERE {}", self.quoted(), self.id_type.id_match())
    }

    /// Stop user triggers from firing while rows are replicated.
    pub fn disable_triggers_sql(&self) -> String {
        format!("ALTER TABLE {} DISABLE TRIGGER USER", self.quoted())
    }

    /// Re-enable user triggers.
    pub fn enable_triggers_sql(&self) -> String {
        format!("ALTER TABLE {} ENABLE TRIGGER USER", self.quoted())
    }
}

/// Truncate every table in one statement.
pub fn truncate_sql(tables: &[Table]) -> Option<String> {
    if tables.is_empty() {
        return None;
    }
    let names: Vec<String> = tables.iter().map(Table::quoted).collect();
    Some(format!("TRUNCATE {}", names.join(", ")))
}

// ============================================================================
// JSON batches
// ============================================================================

/// Accumulates JSON row text into `[...]` arrays of roughly `max_bytes`.
#[derive(Debug)]
pub struct JsonBatcher {
    max_bytes: usize,
    buf: String,
    rows: usize,
}

impl JsonBatcher {
    /// Create a batcher flushing at `max_bytes`
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(1),
            buf: String::new(),
            rows: 0,
        }
    }

    /// Add a row. Returns a full batch (JSON array, row count) once the
    /// buffer reaches the size limit.
    pub fn push(&mut self, row: &str) -> Option<(String, usize)> {
        self.buf.push(if self.rows == 0 { '[' } else { ',' });
        self.buf.push_str(row);
        self.rows += 1;
        if self.buf.len() >= self.max_bytes {
            self.take()
        } else {
            None
        }
    }

    /// Remaining rows, if any
    pub fn finish(&mut self) -> Option<(String, usize)> {
        self.take()
    }

    fn take(&mut self) -> Option<(String, usize)> {
        if self.rows == 0 {
            return None;
        }
        self.buf.push(']');
        let rows = std::mem::take(&mut self.rows);
        Some((std::mem::take(&mut self.buf), rows))
    }
}

/// Split rows into JSON arrays of roughly `max_bytes`.
pub fn json_batches<'a, I>(rows: I, max_bytes: usize) -> Vec<(String, usize)>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut batcher = JsonBatcher::new(max_bytes);
    let mut out: Vec<(String, usize)> = rows
        .into_iter()
        .filter_map(|row| batcher.push(row))
        .collect();
    out.extend(batcher.finish());
    out
}
