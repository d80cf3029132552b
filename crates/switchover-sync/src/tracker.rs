//! Destination row presence tracking
//!
//! The replicator remembers which row ids exist on the next database so a
//! change can be classified as insert, update or delete without querying the
//! destination, and deletes of rows that never arrived can be skipped.

use std::collections::{HashMap, HashSet};
use tokio_postgres::GenericClient;
use tracing::debug;

use crate::error::{pg_err, Result};
use crate::table::Table;

/// Row ids present on the destination, per table.
#[derive(Debug, Clone, Default)]
pub struct RowTracker {
    rows: HashMap<String, HashSet<String>>,
}

impl RowTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every id of every table from the destination.
    pub async fn load<C: GenericClient + Sync>(client: &C, tables: &[Table]) -> Result<Self> {
        let mut tracker = Self::new();
        for table in tables {
            let sql = table.select_ids_sql();
            let ids = client
                .query(sql.as_str(), &[])
                .await
                .map_err(pg_err(&sql))?
                .into_iter()
                .map(|row| row.try_get::<_, String>(0))
                .collect::<std::result::Result<HashSet<_>, _>>()?;
            tracker.rows.insert(table.name.clone(), ids);
        }
        debug!("Tracking {} destination rows", tracker.len());
        Ok(tracker)
    }

    /// Whether `id` exists in `table`
    pub fn contains(&self, table: &str, id: &str) -> bool {
        self.rows.get(table).is_some_and(|ids| ids.contains(id))
    }

    /// Record rows written to `table`
    pub fn insert<I>(&mut self, table: &str, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.rows.entry(table.to_string()).or_default().extend(ids);
    }

    /// Forget rows deleted from `table`
    pub fn remove<'a, I>(&mut self, table: &str, ids: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        if let Some(existing) = self.rows.get_mut(table) {
            for id in ids {
                existing.remove(id);
            }
        }
    }

    /// Total tracked rows
    pub fn len(&self) -> usize {
        self.rows.values().map(HashSet::len).sum()
    }

    /// Whether no rows are tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
