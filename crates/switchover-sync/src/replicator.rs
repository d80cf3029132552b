//! Logical replication from the main database to the next one
//!
//! A replication session moves through five operations, each driven by the
//! cluster leader:
//!
//! 1. [`reset`](LogicalReplicator::reset): take the session lock, remove
//!    change tracking and empty the destination
//! 2. [`start`](LogicalReplicator::start): install tracking, disable
//!    destination triggers, switch the state to `in_progress` and wait out
//!    transactions that began before tracking
//! 3. [`full_initial_sync`](LogicalReplicator::full_initial_sync): copy every
//!    table from one consistent snapshot
//! 4. [`logical_sync`](LogicalReplicator::logical_sync): apply tracked
//!    changes, repeatable
//! 5. [`final_sync`](LogicalReplicator::final_sync): apply the rest under
//!    the exclusive switchover lock and commit `use_next_db`
//!
//! # Example
//!
//! ```rust,ignore
//! use switchover_sync::prelude::*;
//!
//! let mut repl = LogicalReplicator::connect(ReplicatorConfig::default(), &main, &next).await?;
//! let cancel = CancellationToken::new();
//! repl.reset().await?;
//! repl.start(&cancel).await?;
//! repl.full_initial_sync(&cancel).await?;
//! while repl.logical_sync(&cancel).await?.changes > 100 {}
//! repl.final_sync(&cancel).await?;
//! ```

use futures::future::try_join_all;
use futures::TryStreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, GenericClient, IsolationLevel, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchover_db::lock::{
    LOCK_SQL, SWITCHOVER_LOCK_ID, SYNC_SESSION_LOCK_ID, TRY_LOCK_SQL, UNLOCK_SQL,
};
use switchover_db::state::{self, SwitchoverState};
use switchover_db::ConnectionConfig;

use crate::catalog;
use crate::changelog::{self, ChangeEntry};
use crate::config::ReplicatorConfig;
use crate::error::{pg_err, Result, SyncError};
use crate::observability::SyncMetrics;
use crate::plan::{self, ApplyPlan, ChangedRows, FetchedRows, WriteKind};
use crate::sequence::{self, SequenceValue};
use crate::table::{json_batches, truncate_sql, JsonBatcher, Table};
use crate::tracker::RowTracker;

const DEFER_CONSTRAINTS_SQL: &str = "SET CONSTRAINTS ALL DEFERRED";
const NOW_SQL: &str = "SELECT now()";
const RESET_LOCK_TIMEOUT_SQL: &str = "RESET lock_timeout";
const ACTIVE_TX_SQL: &str = r#"
SELECT count(*)
FROM pg_stat_activity
WHERE state <> 'idle'
    AND backend_type = 'client backend'
    AND xact_start <= $1
    AND pid <> pg_backend_pid()
"#;
const FLIP_SQL: &str =
    "UPDATE switchover_state SET current_state = 'use_next_db' WHERE current_state = 'in_progress'";

/// Receives human readable progress lines.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Change log entries consumed
    pub changes: usize,
    /// Rows inserted on the destination
    pub inserted: usize,
    /// Rows overwritten on the destination
    pub updated: usize,
    /// Rows deleted from the destination
    pub deleted: usize,
    /// Sequences copied
    pub sequences: usize,
}

impl fmt::Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} changes ({} inserted, {} updated, {} deleted), {} sequences",
            self.changes, self.inserted, self.updated, self.deleted, self.sequences
        )
    }
}

/// Everything read from the main database in one pass.
struct PassInput {
    sequences: Vec<SequenceValue>,
    entries: Vec<ChangeEntry>,
    changed: ChangedRows,
    fetched: FetchedRows,
}

impl PassInput {
    fn change_ids(&self) -> Vec<i64> {
        self.entries.iter().map(|e| e.id).collect()
    }
}

/// Replicates one main database into one next database.
///
/// Owns a dedicated session on each side. The main-side session holds the
/// replication session lock from [`reset`](Self::reset) until it is dropped.
pub struct LogicalReplicator {
    config: ReplicatorConfig,
    src: Client,
    dst: Client,
    tables: Vec<Table>,
    sequences: Vec<String>,
    tracker: Option<RowTracker>,
    has_lock: bool,
    tracking: bool,
    progress: Option<ProgressFn>,
}

impl fmt::Debug for LogicalReplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalReplicator")
            .field("config", &self.config)
            .field("tables", &self.tables.len())
            .field("sequences", &self.sequences.len())
            .field("has_lock", &self.has_lock)
            .field("tracking", &self.tracking)
            .field("initial_sync_done", &self.tracker.is_some())
            .finish()
    }
}

impl LogicalReplicator {
    /// Wrap existing sessions to the main (`src`) and next (`dst`) databases.
    pub fn new(config: ReplicatorConfig, src: Client, dst: Client) -> Self {
        Self {
            config,
            src,
            dst,
            tables: Vec::new(),
            sequences: Vec::new(),
            tracker: None,
            has_lock: false,
            tracking: false,
            progress: None,
        }
    }

    /// Open dedicated sessions to both databases.
    pub async fn connect(
        config: ReplicatorConfig,
        main: &ConnectionConfig,
        next: &ConnectionConfig,
    ) -> Result<Self> {
        let src = switchover_db::postgres::connect_client(main).await?;
        let dst = switchover_db::postgres::connect_client(next).await?;
        Ok(Self::new(config, src, dst))
    }

    /// Report progress through `progress`
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Replace the progress receiver
    pub fn set_progress(&mut self, progress: Option<ProgressFn>) {
        self.progress = progress;
    }

    /// Configuration in use
    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Tables of the running session, in dependency order
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Whether the initial copy has completed
    pub fn is_initial_sync_done(&self) -> bool {
        self.tracker.is_some()
    }

    /// Number of change log entries not yet applied.
    pub async fn pending_changes(&self) -> Result<usize> {
        Ok(changelog::pending_changes(&self.src).await?.max(0) as usize)
    }

    // ========================================================================
    // Reset
    // ========================================================================

    /// Take the session lock and return both databases to a clean slate.
    ///
    /// Fails with [`SyncError::NoLock`] if another session holds the lock,
    /// and refuses to touch a destination that is already authoritative.
    pub async fn reset(&mut self) -> Result<()> {
        if !self.has_lock {
            let locked: bool = self
                .src
                .query_one(TRY_LOCK_SQL, &[&SYNC_SESSION_LOCK_ID])
                .await
                .map_err(pg_err(TRY_LOCK_SQL))?
                .try_get(0)?;
            if !locked {
                return Err(SyncError::NoLock);
            }
            self.has_lock = true;
        }

        if state::read_state(&self.src).await? == SwitchoverState::UseNextDb {
            return Err(SyncError::precondition(
                "switchover already committed; the next database is authoritative",
            ));
        }

        report(&self.progress, "disabling change tracking");
        changelog::disable_change_log(&mut self.src).await?;

        let dst_tables = catalog::scan_tables(&self.dst, &self.config.exclude_tables).await?;
        if let Some(sql) = truncate_sql(&dst_tables) {
            report(&self.progress, "truncating destination tables");
            self.dst.batch_execute(&sql).await.map_err(pg_err(&sql))?;
        }

        self.tables.clear();
        self.sequences.clear();
        self.tracker = None;
        self.tracking = false;
        info!("Replication reset, {} destination tables truncated", dst_tables.len());
        Ok(())
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Begin change tracking.
    ///
    /// Returns once no transaction that started before tracking is still
    /// running, so the initial snapshot cannot miss an untracked write.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        if !self.has_lock {
            return Err(SyncError::precondition("reset must succeed before start"));
        }

        let tables = catalog::scan_tables(&self.src, &self.config.exclude_tables).await?;
        let sequences = sequence::scan_sequences(&self.src).await?;
        info!(
            tables = tables.len(),
            sequences = sequences.len(),
            "Starting change tracking"
        );

        changelog::install(&self.src).await?;
        changelog::install_triggers(&self.src, &tables).await?;
        for table in &tables {
            let sql = table.disable_triggers_sql();
            self.dst.batch_execute(&sql).await.map_err(pg_err(&sql))?;
        }
        changelog::enable(&self.src).await?;

        self.tables = tables;
        self.sequences = sequences;
        self.tracking = true;
        self.wait_for_active_transactions(cancel).await
    }

    async fn wait_for_active_transactions(&self, cancel: &CancellationToken) -> Result<()> {
        let since: chrono::DateTime<chrono::Utc> = self
            .src
            .query_one(NOW_SQL, &[])
            .await
            .map_err(pg_err(NOW_SQL))?
            .try_get(0)?;

        loop {
            let active: i64 = self
                .src
                .query_one(ACTIVE_TX_SQL, &[&since])
                .await
                .map_err(pg_err(ACTIVE_TX_SQL))?
                .try_get(0)?;
            if active == 0 {
                return Ok(());
            }

            report(
                &self.progress,
                &format!("waiting for {active} transactions older than change tracking"),
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(self.config.active_tx_poll()) => {}
            }
        }
    }

    // ========================================================================
    // Initial sync
    // ========================================================================

    /// Copy every table from a single serializable snapshot.
    ///
    /// Both sides commit only after every table is copied; a serialization
    /// failure on the main side aborts the destination transaction too.
    pub async fn full_initial_sync(&mut self, cancel: &CancellationToken) -> Result<usize> {
        if !self.tracking {
            return Err(SyncError::precondition("start must succeed before the initial sync"));
        }
        let started = Instant::now();
        let Self {
            config,
            src,
            dst,
            tables,
            tracker,
            progress,
            ..
        } = self;

        let src_tx = src
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .read_only(true)
            .deferrable(true)
            .start()
            .await?;
        let dst_tx = dst.transaction().await?;
        dst_tx
            .batch_execute(DEFER_CONSTRAINTS_SQL)
            .await
            .map_err(pg_err(DEFER_CONSTRAINTS_SQL))?;

        let mut total = 0;
        for (i, table) in tables.iter().enumerate() {
            check_cancelled(cancel)?;
            report(
                progress,
                &format!("copying {} ({}/{})", table.name, i + 1, tables.len()),
            );
            let rows = copy_table(&src_tx, &dst_tx, table, config.batch_bytes, cancel).await?;
            debug!(table = %table.name, rows, "Copied table");
            SyncMetrics::add_initial_rows(&table.name, rows);
            total += rows;
        }

        src_tx.commit().await?;
        dst_tx.commit().await?;

        report(progress, "loading destination row ids");
        *tracker = Some(RowTracker::load(&*dst, tables).await?);

        SyncMetrics::record_duration("initial", started.elapsed());
        info!(
            rows = total,
            tables = tables.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Initial sync complete"
        );
        Ok(total)
    }

    // ========================================================================
    // Logical sync
    // ========================================================================

    /// Apply every change tracked so far.
    ///
    /// The main-side snapshot is read-only; applied change log entries are
    /// deleted only after the destination committed.
    pub async fn logical_sync(&mut self, cancel: &CancellationToken) -> Result<SyncStats> {
        let started = Instant::now();
        let Self {
            config,
            src,
            dst,
            tables,
            sequences,
            tracker,
            progress,
            ..
        } = self;
        let tracker = tracker
            .as_mut()
            .ok_or_else(|| SyncError::precondition("initial sync has not completed"))?;
        check_cancelled(cancel)?;

        let src_tx = src
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .read_only(true)
            .deferrable(true)
            .start()
            .await?;
        let input = read_pass(&src_tx, tables, sequences).await?;
        src_tx.commit().await?;

        check_cancelled(cancel)?;
        let plan = ApplyPlan::build(tables, &input.changed, &input.fetched, tracker);
        let stats = pass_stats(&input, &plan);
        if stats.changes > 0 {
            report(progress, &format!("applying {stats}"));
        }

        let dst_tx = dst.transaction().await?;
        apply_pass(&dst_tx, &input, &plan, config.batch_bytes).await?;
        dst_tx.commit().await?;
        plan.commit_to(tracker);

        changelog::delete_changes(&*src, &input.change_ids()).await?;

        SyncMetrics::add_applied_rows("logical", stats.inserted, stats.updated, stats.deleted);
        SyncMetrics::record_duration("logical", started.elapsed());
        debug!(%stats, "Logical sync pass complete");
        Ok(stats)
    }

    // ========================================================================
    // Final sync
    // ========================================================================

    /// Apply the remaining changes and commit the switchover.
    ///
    /// Holds the exclusive switchover lock for the whole pass, so no routed
    /// connection can use the main database while the last changes are
    /// applied. The destination commits first; the `use_next_db` state
    /// commits last and only if the destination succeeded.
    pub async fn final_sync(&mut self, cancel: &CancellationToken) -> Result<SyncStats> {
        if self.tracker.is_none() {
            return Err(SyncError::precondition("initial sync has not completed"));
        }
        check_cancelled(cancel)?;

        let started = Instant::now();
        self.lock_switchover().await?;
        report(&self.progress, "holding exclusive switchover lock");

        let result = self.final_pass(cancel).await;
        self.unlock_switchover().await;

        let stats = result?;
        info!(%stats, elapsed_ms = started.elapsed().as_millis() as u64, "Switchover committed, next database is authoritative");
        Ok(stats)
    }

    /// Take the exclusive switchover lock as a session lock, outside any
    /// transaction.
    ///
    /// The final pass's snapshot must be taken after the lock is granted:
    /// routed connections may commit writes while the lock is awaited.
    async fn lock_switchover(&self) -> Result<()> {
        let timeout_sql = format!("SET lock_timeout = {}", self.config.final_lock_timeout_ms);
        self.src
            .batch_execute(&timeout_sql)
            .await
            .map_err(pg_err(&timeout_sql))?;
        let locked = self
            .src
            .execute(LOCK_SQL, &[&SWITCHOVER_LOCK_ID])
            .await
            .map_err(pg_err(LOCK_SQL));
        let restored = self
            .src
            .batch_execute(RESET_LOCK_TIMEOUT_SQL)
            .await
            .map_err(pg_err(RESET_LOCK_TIMEOUT_SQL));

        match (locked, restored) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => {
                self.unlock_switchover().await;
                Err(e)
            }
            (Ok(_), Ok(())) => Ok(()),
        }
    }

    async fn unlock_switchover(&self) {
        // a broken session drops its advisory locks with it
        if let Err(e) = self.src.execute(UNLOCK_SQL, &[&SWITCHOVER_LOCK_ID]).await {
            warn!("Failed to release the exclusive switchover lock: {}", e);
        }
    }

    async fn final_pass(&mut self, cancel: &CancellationToken) -> Result<SyncStats> {
        let started = Instant::now();
        let Self {
            config,
            src,
            dst,
            tables,
            sequences,
            tracker,
            progress,
            ..
        } = self;
        let tracker = tracker
            .as_mut()
            .ok_or_else(|| SyncError::precondition("initial sync has not completed"))?;

        let src_tx = src
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await?;
        let input = read_pass(&src_tx, tables, sequences).await?;
        check_cancelled(cancel)?;

        let plan = ApplyPlan::build(tables, &input.changed, &input.fetched, tracker);
        let stats = pass_stats(&input, &plan);
        report(progress, &format!("applying final {stats}"));

        let dst_tx = dst.transaction().await?;
        apply_pass(&dst_tx, &input, &plan, config.batch_bytes).await?;
        for table in tables.iter() {
            let sql = table.enable_triggers_sql();
            dst_tx.batch_execute(&sql).await.map_err(pg_err(&sql))?;
        }
        dst_tx.commit().await?;
        plan.commit_to(tracker);

        if let Err(e) = commit_flip(src_tx, &input).await {
            // main stays authoritative; keep destination triggers quiet for the next pass
            for table in tables.iter() {
                if let Err(err) = dst.batch_execute(&table.disable_triggers_sql()).await {
                    warn!(table = %table.name, "Failed to disable destination triggers: {}", err);
                }
            }
            return Err(e);
        }

        SyncMetrics::add_applied_rows("final", stats.inserted, stats.updated, stats.deleted);
        SyncMetrics::record_duration("final", started.elapsed());
        SyncMetrics::set_pending(0);
        Ok(stats)
    }
}

// ============================================================================
// Pass helpers
// ============================================================================

fn report(progress: &Option<ProgressFn>, message: &str) {
    debug!("{}", message);
    if let Some(progress) = progress {
        progress(message);
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

fn pass_stats(input: &PassInput, plan: &ApplyPlan<'_>) -> SyncStats {
    let (inserted, updated, deleted) = plan.counts();
    SyncStats {
        changes: input.entries.len(),
        inserted,
        updated,
        deleted,
        sequences: input.sequences.len(),
    }
}

/// Read sequences, the change log and the current contents of every
/// changed row within one main-side transaction.
async fn read_pass(
    src_tx: &Transaction<'_>,
    tables: &[Table],
    sequences: &[String],
) -> Result<PassInput> {
    let state = state::read_state(src_tx).await?;
    if state != SwitchoverState::InProgress {
        return Err(SyncError::precondition(format!(
            "switchover state is {state}, expected in_progress"
        )));
    }

    let sequences = sequence::read_values(src_tx, sequences).await?;
    let entries = changelog::read_changes(src_tx).await?;
    let changed = plan::group_changes(&entries, tables)?;
    let fetched = fetch_rows(src_tx, tables, &changed).await?;
    SyncMetrics::set_pending(entries.len());

    Ok(PassInput {
        sequences,
        entries,
        changed,
        fetched,
    })
}

/// Fetch changed rows of every table, pipelined into one round trip.
async fn fetch_rows<C: GenericClient + Sync>(
    client: &C,
    tables: &[Table],
    changed: &ChangedRows,
) -> Result<FetchedRows> {
    let mut requests = Vec::new();
    for table in tables {
        if let Some(ids) = changed.get(&table.name) {
            let ids = table.id_type.parse_ids(&table.name, ids)?;
            requests.push((table, table.select_rows_by_id_sql(), ids));
        }
    }

    let params: Vec<[&(dyn ToSql + Sync); 1]> = requests
        .iter()
        .map(|(_, _, ids)| [ids.as_param()])
        .collect();
    let results = try_join_all(
        requests
            .iter()
            .zip(&params)
            .map(|((_, sql, _), p)| client.query(sql.as_str(), p)),
    )
    .await?;

    let mut fetched = FetchedRows::new();
    for ((table, _, _), rows) in requests.iter().zip(results) {
        let by_id = fetched.entry(table.name.clone()).or_default();
        for row in rows {
            by_id.insert(row.try_get(0)?, row.try_get(1)?);
        }
    }
    Ok(fetched)
}

/// Write sequences and planned rows into the destination transaction.
async fn apply_pass(
    dst_tx: &Transaction<'_>,
    input: &PassInput,
    plan: &ApplyPlan<'_>,
    batch_bytes: usize,
) -> Result<()> {
    dst_tx
        .batch_execute(DEFER_CONSTRAINTS_SQL)
        .await
        .map_err(pg_err(DEFER_CONSTRAINTS_SQL))?;
    sequence::write_values(dst_tx, &input.sequences).await?;

    for step in plan.steps() {
        let table = step.writes.table;
        match step.kind {
            WriteKind::Insert | WriteKind::Update => {
                let rows = if step.kind == WriteKind::Insert {
                    &step.writes.inserts
                } else {
                    &step.writes.updates
                };
                let sql = table.upsert_sql();
                for (batch, _) in json_batches(rows.iter().map(|(_, json)| json), batch_bytes) {
                    dst_tx
                        .execute(sql.as_str(), &[&batch])
                        .await
                        .map_err(pg_err(&sql))?;
                }
            }
            WriteKind::Delete => {
                let sql = table.delete_sql();
                let ids = table.id_type.parse_ids(&table.name, &step.writes.deletes)?;
                dst_tx
                    .execute(sql.as_str(), &[ids.as_param()])
                    .await
                    .map_err(pg_err(&sql))?;
            }
        }
    }
    Ok(())
}

/// Delete the applied entries and switch to `use_next_db` in the
/// transaction holding the exclusive lock.
async fn commit_flip(src_tx: Transaction<'_>, input: &PassInput) -> Result<()> {
    changelog::delete_changes(&src_tx, &input.change_ids()).await?;
    let flipped = src_tx.execute(FLIP_SQL, &[]).await.map_err(pg_err(FLIP_SQL))?;
    if flipped != 1 {
        return Err(SyncError::precondition(
            "switchover state changed during the final sync",
        ));
    }
    src_tx.commit().await?;
    Ok(())
}

/// Stream one table out of the snapshot into the destination in JSON batches.
async fn copy_table(
    src_tx: &Transaction<'_>,
    dst_tx: &Transaction<'_>,
    table: &Table,
    batch_bytes: usize,
    cancel: &CancellationToken,
) -> Result<usize> {
    let select = table.select_all_sql();
    let insert = table.insert_sql();
    let params: &[String] = &[];
    let mut stream = Box::pin(
        src_tx
            .query_raw(select.as_str(), params)
            .await
            .map_err(pg_err(&select))?,
    );

    let mut batcher = JsonBatcher::new(batch_bytes);
    let mut copied = 0;
    while let Some(row) = stream.try_next().await? {
        let json: &str = row.try_get(0)?;
        if let Some((batch, rows)) = batcher.push(json) {
            check_cancelled(cancel)?;
            dst_tx
                .execute(insert.as_str(), &[&batch])
                .await
                .map_err(pg_err(&insert))?;
            copied += rows;
        }
    }
    if let Some((batch, rows)) = batcher.finish() {
        dst_tx
            .execute(insert.as_str(), &[&batch])
            .await
            .map_err(pg_err(&insert))?;
        copied += rows;
    }
    Ok(copied)
}
