//! Routing connection pool for switchover-db
//!
//! Connection pooling on top of a [`ConnectionProvider`]:
//! - Semaphore-bounded pool size with acquire timeout
//! - Lifetime and idle-time recycling
//! - Provider release before a connection goes idle, re-check on reuse
//! - Pause/resume for the switchover's stop-the-world window
//!
//! # Example
//!
//! ```rust,ignore
//! use switchover_db::prelude::*;
//!
//! let pool = RoutingPool::new(
//!     PoolConfig::default().with_max_size(10),
//!     Arc::new(RoutedProvider::new(main, next)),
//! );
//!
//! let conn = pool.get().await?;
//! conn.execute("SELECT 1", &[]).await?;
//! // Connection is released and returned to the pool when dropped
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::connection::ConnectionProvider;
use crate::error::{Error, Result};
use crate::lifecycle::PauseResumer;
use crate::observability::PoolMetrics;
use crate::postgres::PgConnection;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            idle_timeout: Duration::from_secs(600),  // 10 minutes
        }
    }
}

impl PoolConfig {
    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Number of times pool was exhausted
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Connections dropped by the provider on release or reuse
    pub discarded: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub discarded: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a provider-requested discard
    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }
}

// ============================================================================
// PooledConnection
// ============================================================================

/// A connection borrowed from the pool
pub struct PooledConnection {
    conn: Option<PgConnection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<RoutingPool>,
}

impl PooledConnection {
    /// Get the underlying connection
    pub fn connection(&self) -> &PgConnection {
        self.conn.as_ref().expect("connection already returned")
    }

    /// Get mutable reference to the underlying connection
    pub fn connection_mut(&mut self) -> &mut PgConnection {
        self.conn.as_mut().expect("connection already returned")
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = tokio_postgres::Client;

    fn deref(&self) -> &Self::Target {
        self.connection().client()
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection_mut().client_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            let permit = self.permit.take();
            tokio::spawn(async move {
                pool.return_connection(conn).await;
                drop(permit);
            });
        }
    }
}

// ============================================================================
// RoutingPool
// ============================================================================

/// Connection pool whose connections come from a [`ConnectionProvider`].
///
/// Idle connections are stored LIFO. Before a connection goes idle the
/// provider releases whatever it holds for the checkout (the routed provider
/// drops its shared switchover lock), and before an idle connection is handed
/// out again the provider re-checks it, since the flip may have happened in
/// between.
pub struct RoutingPool {
    config: PoolConfig,
    provider: Arc<dyn ConnectionProvider>,
    idle: Mutex<Vec<PgConnection>>,
    semaphore: Arc<Semaphore>,
    total_connections: AtomicUsize,
    checked_out: AtomicUsize,
    returned: Notify,
    paused: watch::Sender<bool>,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
    self_ref: Weak<Self>,
}

impl RoutingPool {
    /// Create a new pool. Connections are opened lazily.
    pub fn new(config: PoolConfig, provider: Arc<dyn ConnectionProvider>) -> Arc<Self> {
        let (paused, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            config,
            provider,
            total_connections: AtomicUsize::new(0),
            checked_out: AtomicUsize::new(0),
            returned: Notify::new(),
            paused,
            stats: AtomicPoolStats::new(),
            shutdown: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Name of the provider behind this pool
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Number of open connections
    pub fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    /// Number of connections currently checked out
    pub fn in_use(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }

    /// Whether checkouts are currently paused
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    fn should_recycle(&self, conn: &PgConnection) -> bool {
        conn.is_closed()
            || conn.is_expired(self.config.max_lifetime)
            || conn.idle_time() > self.config.idle_timeout
    }

    fn discard(&self, conn: PgConnection) {
        drop(conn);
        let open = self
            .total_connections
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        self.stats.record_closed();
        PoolMetrics::set_open_connections(open);
    }

    async fn wait_unpaused(&self) -> Result<()> {
        let mut rx = self.paused.subscribe();
        tokio::time::timeout(self.config.acquire_timeout, rx.wait_for(|paused| !*paused))
            .await
            .map_err(|_| {
                self.stats.record_exhausted();
                Error::PoolExhausted {
                    message: "pool paused for switchover".to_string(),
                }
            })?
            .map_err(|_| Error::internal("pause channel closed"))?;
        Ok(())
    }

    fn release_slot(&self) {
        self.checked_out.fetch_sub(1, Ordering::SeqCst);
        self.returned.notify_waiters();
    }

    /// Get a connection from the pool
    pub async fn get(&self) -> Result<PooledConnection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted {
                message: "pool is shut down".to_string(),
            });
        }

        let start = Instant::now();
        // A checkout counts as in use before the pause flag is re-read, so a
        // concurrent pause either sees it or it sees the pause.
        loop {
            self.wait_unpaused().await?;
            self.checked_out.fetch_add(1, Ordering::SeqCst);
            if !self.is_paused() {
                break;
            }
            self.release_slot();
        }

        match self.checkout(start).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.release_slot();
                Err(e)
            }
        }
    }

    async fn checkout(&self, start: Instant) -> Result<PooledConnection> {
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.stats.record_exhausted();
            Error::PoolExhausted {
                message: format!(
                    "timeout waiting for connection ({}ms)",
                    self.config.acquire_timeout.as_millis()
                ),
            }
        })?
        .map_err(|_| Error::PoolExhausted {
            message: "pool semaphore closed".to_string(),
        })?;

        let pool = self.self_ref.upgrade().ok_or_else(|| Error::PoolExhausted {
            message: "pool has been dropped".to_string(),
        })?;

        let mut conn = None;
        loop {
            let entry = self.idle.lock().await.pop();
            let Some(entry) = entry else { break };
            if self.should_recycle(&entry) {
                self.discard(entry);
                continue;
            }
            match self.provider.reacquire(entry).await {
                Ok(Some(c)) => {
                    conn = Some(c);
                    break;
                }
                Ok(None) => {
                    // the provider dropped the connection itself
                    self.total_connections.fetch_sub(1, Ordering::AcqRel);
                    self.stats.record_closed();
                    self.stats.record_discarded();
                    PoolMetrics::increment_discards();
                }
                Err(e) => {
                    warn!(provider = self.provider.name(), "Idle connection failed re-check: {}", e);
                    self.total_connections.fetch_sub(1, Ordering::AcqRel);
                    self.stats.record_closed();
                    self.stats.record_discarded();
                    PoolMetrics::increment_discards();
                }
            }
        }

        let mut conn = match conn {
            Some(c) => c,
            None => {
                let c = self.provider.acquire().await?;
                let open = self.total_connections.fetch_add(1, Ordering::AcqRel) + 1;
                self.stats.record_created();
                PoolMetrics::set_open_connections(open);
                c
            }
        };
        conn.touch();

        self.stats
            .record_acquisition(start.elapsed().as_millis() as u64);
        PoolMetrics::increment_checkouts();

        Ok(PooledConnection {
            conn: Some(conn),
            permit: Some(permit),
            pool,
        })
    }

    async fn return_connection(&self, mut conn: PgConnection) {
        let keep = if self.shutdown.load(Ordering::Acquire) || conn.is_closed() {
            false
        } else if let Err(e) = self.provider.release(&mut conn).await {
            warn!(provider = self.provider.name(), "Failed to release connection: {}", e);
            self.stats.record_discarded();
            PoolMetrics::increment_discards();
            false
        } else {
            !self.is_paused()
        };

        if keep {
            conn.touch();
            self.idle.lock().await.push(conn);
        } else {
            self.discard(conn);
        }

        self.release_slot();
    }

    async fn close_idle(&self) -> usize {
        let drained: Vec<PgConnection> = self.idle.lock().await.drain(..).collect();
        let count = drained.len();
        for conn in drained {
            self.discard(conn);
        }
        count
    }

    /// Close all idle connections and refuse further checkouts.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        let closed = self.close_idle().await;
        debug!(closed, "Routing pool closed");
        Ok(())
    }
}

#[async_trait]
impl PauseResumer for RoutingPool {
    async fn pause(&self) -> Result<()> {
        self.paused.send_replace(true);
        info!(in_use = self.in_use(), "Pausing routing pool");

        loop {
            let notified = self.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_use() == 0 {
                break;
            }
            notified.await;
        }

        let closed = self.close_idle().await;
        info!(closed, "Routing pool paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        if self.paused.send_replace(false) {
            info!("Routing pool resumed");
        }
        Ok(())
    }
}
