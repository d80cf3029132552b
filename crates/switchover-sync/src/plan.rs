//! Turning change log entries into destination writes
//!
//! Each changed row is classified from two facts: whether the row still
//! exists on the main database and whether it already exists on the next
//! one. Writes are ordered so non-deferrable foreign keys hold after every
//! statement: inserts and updates follow table dependency order, deletes
//! run in reverse.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::changelog::ChangeEntry;
use crate::error::{Result, SyncError};
use crate::table::Table;
use crate::tracker::RowTracker;

/// Changed row ids per table.
pub type ChangedRows = BTreeMap<String, BTreeSet<String>>;

/// Current row contents on the main database: table → id → JSON text.
pub type FetchedRows = HashMap<String, HashMap<String, String>>;

/// Collapse change log entries into distinct row ids per table.
///
/// An entry for a table outside the replicated set means the schema changed
/// after the session started.
pub fn group_changes(entries: &[ChangeEntry], tables: &[Table]) -> Result<ChangedRows> {
    let mut changed = ChangedRows::new();
    for entry in entries {
        if !tables.iter().any(|t| t.name == entry.table) {
            return Err(SyncError::schema(format!(
                "change log references untracked table {}",
                entry.table
            )));
        }
        changed
            .entry(entry.table.clone())
            .or_default()
            .insert(entry.row_id.clone());
    }
    Ok(changed)
}

/// Kind of destination write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Row is new on the destination
    Insert,
    /// Row exists on the destination and changed
    Update,
    /// Row was removed from the main database
    Delete,
}

/// Writes for one table.
#[derive(Debug)]
pub struct TableWrites<'t> {
    /// Target table
    pub table: &'t Table,
    /// `(id, row JSON)` for new rows
    pub inserts: Vec<(String, String)>,
    /// `(id, row JSON)` for changed rows
    pub updates: Vec<(String, String)>,
    /// Ids to delete
    pub deletes: Vec<String>,
}

impl TableWrites<'_> {
    fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// One ordered write step.
#[derive(Debug, Clone, Copy)]
pub struct WriteStep<'p, 't> {
    /// What the step does
    pub kind: WriteKind,
    /// Writes of the table involved
    pub writes: &'p TableWrites<'t>,
}

/// All destination writes of a sync pass, in dependency order.
#[derive(Debug, Default)]
pub struct ApplyPlan<'t> {
    writes: Vec<TableWrites<'t>>,
}

impl<'t> ApplyPlan<'t> {
    /// Classify every changed row.
    ///
    /// | on main | on next | write |
    /// |---------|---------|-------|
    /// | yes | no | insert |
    /// | yes | yes | update |
    /// | no | yes | delete |
    /// | no | no | nothing |
    pub fn build(
        tables: &'t [Table],
        changed: &ChangedRows,
        fetched: &FetchedRows,
        tracker: &RowTracker,
    ) -> Self {
        let mut writes = Vec::new();
        for table in tables {
            let Some(ids) = changed.get(&table.name) else {
                continue;
            };
            let rows = fetched.get(&table.name);
            let mut entry = TableWrites {
                table,
                inserts: Vec::new(),
                updates: Vec::new(),
                deletes: Vec::new(),
            };
            for id in ids {
                let exists = tracker.contains(&table.name, id);
                match rows.and_then(|r| r.get(id)) {
                    Some(json) if exists => entry.updates.push((id.clone(), json.clone())),
                    Some(json) => entry.inserts.push((id.clone(), json.clone())),
                    None if exists => entry.deletes.push(id.clone()),
                    None => {}
                }
            }
            if !entry.is_empty() {
                writes.push(entry);
            }
        }
        Self { writes }
    }

    /// Writes in execution order: inserts and updates by dependency,
    /// deletes in reverse dependency order.
    pub fn steps(&self) -> Vec<WriteStep<'_, 't>> {
        let mut steps = Vec::new();
        for writes in &self.writes {
            if !writes.inserts.is_empty() {
                steps.push(WriteStep {
                    kind: WriteKind::Insert,
                    writes,
                });
            }
        }
        for writes in &self.writes {
            if !writes.updates.is_empty() {
                steps.push(WriteStep {
                    kind: WriteKind::Update,
                    writes,
                });
            }
        }
        for writes in self.writes.iter().rev() {
            if !writes.deletes.is_empty() {
                steps.push(WriteStep {
                    kind: WriteKind::Delete,
                    writes,
                });
            }
        }
        steps
    }

    /// Whether the plan writes nothing
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// `(inserted, updated, deleted)` row counts
    pub fn counts(&self) -> (usize, usize, usize) {
        self.writes.iter().fold((0, 0, 0), |(i, u, d), w| {
            (i + w.inserts.len(), u + w.updates.len(), d + w.deletes.len())
        })
    }

    /// Record the plan's effect once the destination commit succeeded.
    pub fn commit_to(&self, tracker: &mut RowTracker) {
        for w in &self.writes {
            tracker.insert(&w.table.name, w.inserts.iter().map(|(id, _)| id.clone()));
            tracker.remove(&w.table.name, &w.deletes);
        }
    }
}
