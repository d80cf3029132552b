//! Replication metrics

use std::time::Duration;

/// Replicator metrics, labelled by phase (`initial`, `logical`, `final`).
pub struct SyncMetrics;

impl SyncMetrics {
    /// Rows copied during the initial sync
    pub fn add_initial_rows(table: &str, rows: usize) {
        metrics::counter!("switchover_sync_initial_rows_total", "table" => table.to_string())
            .increment(rows as u64);
    }

    /// Rows written by a sync pass
    pub fn add_applied_rows(phase: &'static str, inserted: usize, updated: usize, deleted: usize) {
        metrics::counter!("switchover_sync_rows_total", "phase" => phase, "op" => "insert")
            .increment(inserted as u64);
        metrics::counter!("switchover_sync_rows_total", "phase" => phase, "op" => "update")
            .increment(updated as u64);
        metrics::counter!("switchover_sync_rows_total", "phase" => phase, "op" => "delete")
            .increment(deleted as u64);
    }

    /// Duration of a sync phase
    pub fn record_duration(phase: &'static str, elapsed: Duration) {
        metrics::histogram!("switchover_sync_duration_seconds", "phase" => phase)
            .record(elapsed.as_secs_f64());
    }

    /// Change log entries left after the last pass
    pub fn set_pending(entries: usize) {
        metrics::gauge!("switchover_sync_pending_changes").set(entries as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        SyncMetrics::add_initial_rows("users", 10);
        SyncMetrics::add_applied_rows("logical", 1, 2, 3);
        SyncMetrics::record_duration("final", Duration::from_millis(20));
        SyncMetrics::set_pending(0);
    }
}
