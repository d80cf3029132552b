//! Router and pool metrics
//!
//! Lightweight counters and histograms recorded through the `metrics` crate.
//! Without an installed recorder every call is a no-op.

use std::time::Duration;

// ============================================================================
// Router Metrics
// ============================================================================

/// Connection router metrics
pub struct RouterMetrics;

impl RouterMetrics {
    /// The process observed the flip to the next database
    pub fn increment_flips() {
        metrics::counter!("switchover_router_flips_total").increment(1);
    }

    /// Time spent waiting for the shared switchover lock
    pub fn record_lock_wait(wait: Duration) {
        metrics::histogram!("switchover_router_lock_wait_seconds").record(wait.as_secs_f64());
    }
}

// ============================================================================
// Pool Metrics
// ============================================================================

/// Routing pool metrics
pub struct PoolMetrics;

impl PoolMetrics {
    /// A connection was checked out
    pub fn increment_checkouts() {
        metrics::counter!("switchover_pool_checkouts_total").increment(1);
    }

    /// A connection was discarded instead of reused
    pub fn increment_discards() {
        metrics::counter!("switchover_pool_discards_total").increment(1);
    }

    /// Current number of open connections
    pub fn set_open_connections(count: usize) {
        metrics::gauge!("switchover_pool_open_connections").set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        RouterMetrics::increment_flips();
        RouterMetrics::record_lock_wait(Duration::from_millis(5));
        PoolMetrics::increment_checkouts();
        PoolMetrics::increment_discards();
        PoolMetrics::set_open_connections(3);
    }
}
