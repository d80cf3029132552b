//! Replicator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for a replication session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    /// Approximate size of one JSON insert batch during the initial copy
    pub batch_bytes: usize,
    /// Interval between checks for transactions older than change tracking
    pub active_tx_poll_ms: u64,
    /// `lock_timeout` for the final sync's exclusive switchover lock
    pub final_lock_timeout_ms: u64,
    /// Additional tables never to replicate
    pub exclude_tables: Vec<String>,
    /// Logical sync passes before pausing regardless of backlog
    pub max_sync_passes: usize,
    /// Backlog small enough to pause the application for the final sync
    pub pause_threshold: usize,
    /// Logical sync passes after pausing, before the final sync
    pub exec_passes: usize,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            batch_bytes: 1024 * 1024,
            active_tx_poll_ms: 1000,
            final_lock_timeout_ms: 30_000,
            exclude_tables: Vec::new(),
            max_sync_passes: 10,
            pause_threshold: 100,
            exec_passes: 3,
        }
    }
}

impl ReplicatorConfig {
    /// Set the initial copy batch size
    pub fn with_batch_bytes(mut self, bytes: usize) -> Self {
        self.batch_bytes = bytes;
        self
    }

    /// Set the active transaction poll interval
    pub fn with_active_tx_poll(mut self, interval: Duration) -> Self {
        self.active_tx_poll_ms = interval.as_millis() as u64;
        self
    }

    /// Set the final sync lock timeout
    pub fn with_final_lock_timeout(mut self, timeout: Duration) -> Self {
        self.final_lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Skip an additional table
    pub fn with_excluded_table(mut self, table: impl Into<String>) -> Self {
        self.exclude_tables.push(table.into());
        self
    }

    /// Set the backlog threshold for pausing
    pub fn with_pause_threshold(mut self, rows: usize) -> Self {
        self.pause_threshold = rows;
        self
    }

    /// Set the pass limits before and after pausing
    pub fn with_passes(mut self, before_pause: usize, after_pause: usize) -> Self {
        self.max_sync_passes = before_pause;
        self.exec_passes = after_pause;
        self
    }

    /// Active transaction poll interval
    pub fn active_tx_poll(&self) -> Duration {
        Duration::from_millis(self.active_tx_poll_ms)
    }

    /// Final sync lock timeout
    pub fn final_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.final_lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicatorConfig::default();
        assert_eq!(config.batch_bytes, 1 << 20);
        assert_eq!(config.final_lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.active_tx_poll(), Duration::from_secs(1));
    }

    #[test]
    fn test_builder() {
        let config = ReplicatorConfig::default()
            .with_batch_bytes(4096)
            .with_final_lock_timeout(Duration::from_secs(5))
            .with_excluded_table("audit_log")
            .with_passes(2, 1);
        assert_eq!(config.batch_bytes, 4096);
        assert_eq!(config.final_lock_timeout_ms, 5000);
        assert_eq!(config.exclude_tables, vec!["audit_log"]);
        assert_eq!((config.max_sync_passes, config.exec_passes), (2, 1));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ReplicatorConfig = serde_json::from_str(r#"{"batch_bytes": 10}"#).unwrap();
        assert_eq!(config.batch_bytes, 10);
        assert_eq!(config.pause_threshold, 100);
    }
}
