//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ClusterError, Result};

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Whether this node may become leader and run the replicator
    pub can_exec: bool,
    /// Delay between leader election and `reset-end`
    pub reset_delay_ms: u64,
    /// Upper bound for the local pause hook
    pub pause_timeout_ms: u64,
    /// Minimum interval between `status` messages
    pub status_throttle_ms: u64,
    /// Message log poll interval
    pub log_poll_ms: u64,
    /// How long `ping` waits for acknowledgements
    pub ping_timeout_ms: u64,
    /// How long operator commands wait to see their own message
    pub command_timeout_ms: u64,
    /// Log position to start reading after; the current tail when unset
    pub resume_from: Option<i64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            can_exec: true,
            reset_delay_ms: 3_000,
            pause_timeout_ms: 30_000,
            status_throttle_ms: 1_000,
            log_poll_ms: 250,
            ping_timeout_ms: 5_000,
            command_timeout_ms: 30_000,
            resume_from: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_can_exec(mut self, can_exec: bool) -> Self {
        self.can_exec = can_exec;
        self
    }

    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_pause_timeout(mut self, timeout: Duration) -> Self {
        self.pause_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_status_throttle(mut self, interval: Duration) -> Self {
        self.status_throttle_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_log_poll(mut self, interval: Duration) -> Self {
        self.log_poll_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_resume_from(mut self, position: i64) -> Self {
        self.resume_from = Some(position);
        self
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }

    pub fn status_throttle(&self) -> Duration {
        Duration::from_millis(self.status_throttle_ms)
    }

    pub fn log_poll(&self) -> Duration {
        Duration::from_millis(self.log_poll_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Reject intervals the coordinator loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.status_throttle_ms == 0 {
            return Err(ClusterError::InvalidConfig(
                "status throttle must be positive".into(),
            ));
        }
        if self.log_poll_ms == 0 {
            return Err(ClusterError::InvalidConfig(
                "log poll interval must be positive".into(),
            ));
        }
        if self.resume_from.is_some_and(|p| p < 0) {
            return Err(ClusterError::InvalidConfig(
                "resume position must not be negative".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert!(config.can_exec);
        assert_eq!(config.reset_delay(), Duration::from_secs(3));
        assert_eq!(config.pause_timeout(), Duration::from_secs(30));
        assert_eq!(config.status_throttle(), Duration::from_secs(1));
        assert_eq!(config.log_poll(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = CoordinatorConfig::default()
            .with_can_exec(false)
            .with_reset_delay(Duration::from_millis(100))
            .with_resume_from(42);
        assert!(!config.can_exec);
        assert_eq!(config.reset_delay_ms, 100);
        assert_eq!(config.resume_from, Some(42));
    }

    #[test]
    fn test_validate_rejects_zero_poll() {
        let config = CoordinatorConfig::default().with_log_poll(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ClusterError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_config_deserializes() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"can_exec": false, "ping_timeout_ms": 100}"#).unwrap();
        assert!(!config.can_exec);
        assert_eq!(config.ping_timeout(), Duration::from_millis(100));
        assert_eq!(config.reset_delay_ms, 3_000);
    }
}
