//! Cluster metrics

/// Message log and coordinator metrics
pub struct ClusterMetrics;

impl ClusterMetrics {
    /// A message was appended by this node
    pub fn increment_appended(kind: &'static str) {
        metrics::counter!("switchover_messages_appended_total", "type" => kind).increment(1);
    }

    /// A message was read from the log by this node
    pub fn increment_observed(kind: &'static str) {
        metrics::counter!("switchover_messages_observed_total", "type" => kind).increment(1);
    }

    /// This node broadcast a cancel because of an unexpected message
    pub fn increment_divergences() {
        metrics::counter!("switchover_cluster_divergences_total").increment(1);
    }

    /// A task finished, successfully or not
    pub fn increment_tasks(task: &'static str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        metrics::counter!("switchover_cluster_tasks_total", "task" => task, "outcome" => outcome)
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        ClusterMetrics::increment_appended("hello");
        ClusterMetrics::increment_observed("reset");
        ClusterMetrics::increment_divergences();
        ClusterMetrics::increment_tasks("sync", false);
    }
}
