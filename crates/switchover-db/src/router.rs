//! Connection routing across a switchover
//!
//! Two [`ConnectionProvider`] implementations:
//!
//! - [`DirectProvider`] always connects to one fixed database. Used for the
//!   replicator's own sessions and for single-database deployments.
//! - [`RoutedProvider`] sits between the application and both databases.
//!   Every connection it hands out either points at the next database
//!   (once the flip has been observed) or points at the main database while
//!   holding the shared switchover lock, which keeps the final sync from
//!   committing underneath a request in flight.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchover_db::prelude::*;
//!
//! let provider = Arc::new(RoutedProvider::new(
//!     ConnectionConfig::new("postgres://app@old-db/app"),
//!     ConnectionConfig::new("postgres://app@new-db/app"),
//! ));
//! let pool = RoutingPool::new(PoolConfig::default(), provider);
//! let conn = pool.get().await?;
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionConfig, ConnectionProvider, Target};
use crate::error::{Error, Result};
use crate::lock::{LOCK_SHARED_SQL, SWITCHOVER_LOCK_ID, UNLOCK_SHARED_SQL};
use crate::observability::RouterMetrics;
use crate::postgres::{self, PgConnection};
use crate::state::{self, SwitchoverState};

// ============================================================================
// DirectProvider
// ============================================================================

/// Provider that always connects to a single database.
#[derive(Debug, Clone)]
pub struct DirectProvider {
    config: ConnectionConfig,
    target: Target,
}

impl DirectProvider {
    /// Create a provider for `config`, labelling its connections with `target`.
    pub fn new(config: ConnectionConfig, target: Target) -> Self {
        Self { config, target }
    }

    /// Connection configuration in use
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionProvider for DirectProvider {
    async fn acquire(&self) -> Result<PgConnection> {
        postgres::connect(&self.config, self.target).await
    }

    async fn release(&self, _conn: &mut PgConnection) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

// ============================================================================
// RoutedProvider
// ============================================================================

/// Provider that follows the switchover state from main to next.
///
/// Once a flip has been observed the provider never consults the main
/// database again.
#[derive(Debug)]
pub struct RoutedProvider {
    main: ConnectionConfig,
    next: ConnectionConfig,
    flipped: AtomicBool,
}

impl RoutedProvider {
    /// Create a router between the main and next databases.
    pub fn new(main: ConnectionConfig, next: ConnectionConfig) -> Self {
        Self {
            main,
            next,
            flipped: AtomicBool::new(false),
        }
    }

    /// Whether this process has observed the flip
    pub fn is_flipped(&self) -> bool {
        self.flipped.load(Ordering::Acquire)
    }

    fn mark_flipped(&self) {
        if !self.flipped.swap(true, Ordering::AcqRel) {
            info!("Switchover observed, routing new connections to the next database");
            RouterMetrics::increment_flips();
        }
    }

    async fn connect_next(&self) -> Result<PgConnection> {
        postgres::connect(&self.next, Target::Next).await
    }

    /// Take the shared lock on a main-database connection and check the
    /// state. Returns `false` (with the lock released) once the flip has
    /// committed.
    async fn lock_and_check(&self, conn: &mut PgConnection) -> Result<bool> {
        let start = Instant::now();
        conn.client()
            .execute(LOCK_SHARED_SQL, &[&SWITCHOVER_LOCK_ID])
            .await
            .map_err(|e| Error::from_pg(e, LOCK_SHARED_SQL))?;
        conn.set_shared_lock(true);
        RouterMetrics::record_lock_wait(start.elapsed());

        match state::read_state(conn.client()).await {
            Ok(SwitchoverState::UseNextDb) => {
                self.unlock(conn).await?;
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(e) => {
                if let Err(unlock_err) = self.unlock(conn).await {
                    warn!("Failed to release shared switchover lock: {}", unlock_err);
                }
                Err(e)
            }
        }
    }

    async fn unlock(&self, conn: &mut PgConnection) -> Result<()> {
        conn.client()
            .execute(UNLOCK_SHARED_SQL, &[&SWITCHOVER_LOCK_ID])
            .await
            .map_err(|e| Error::from_pg(e, UNLOCK_SHARED_SQL))?;
        conn.set_shared_lock(false);
        Ok(())
    }
}

#[async_trait]
impl ConnectionProvider for RoutedProvider {
    async fn acquire(&self) -> Result<PgConnection> {
        if self.is_flipped() {
            return self.connect_next().await;
        }

        let mut conn = postgres::connect(&self.main, Target::Main).await?;
        if self.lock_and_check(&mut conn).await? {
            return Ok(conn);
        }

        drop(conn);
        self.mark_flipped();
        self.connect_next().await
    }

    async fn release(&self, conn: &mut PgConnection) -> Result<()> {
        if conn.holds_shared_lock() {
            self.unlock(conn).await?;
        }
        Ok(())
    }

    async fn reacquire(&self, mut conn: PgConnection) -> Result<Option<PgConnection>> {
        if conn.target() == Target::Next {
            return Ok(Some(conn));
        }
        if self.is_flipped() {
            debug!("Discarding idle main-database connection after flip");
            return Ok(None);
        }
        if self.lock_and_check(&mut conn).await? {
            return Ok(Some(conn));
        }
        self.mark_flipped();
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "routed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_is_sticky() {
        let router = RoutedProvider::new(
            ConnectionConfig::new("postgres://localhost/main"),
            ConnectionConfig::new("postgres://localhost/next"),
        );
        assert!(!router.is_flipped());

        router.mark_flipped();
        assert!(router.is_flipped());

        router.mark_flipped();
        assert!(router.is_flipped());
    }

    #[test]
    fn test_provider_names() {
        let direct = DirectProvider::new(ConnectionConfig::new("postgres://localhost/a"), Target::Main);
        let routed = RoutedProvider::new(
            ConnectionConfig::new("postgres://localhost/a"),
            ConnectionConfig::new("postgres://localhost/b"),
        );
        assert_eq!(direct.name(), "direct");
        assert_eq!(routed.name(), "routed");
        assert_eq!(direct.config().url, "postgres://localhost/a");
    }

    #[tokio::test]
    async fn test_flipped_router_skips_main_database() {
        // main is unreachable; a flipped router must not touch it
        let router = RoutedProvider::new(
            ConnectionConfig::new("host=127.0.0.1 port=1 user=x dbname=x").with_connect_timeout(200),
            ConnectionConfig::new("postgres://host:notaport/next"),
        );
        router.mark_flipped();

        let err = router.acquire().await.unwrap_err();
        // the next-database config is invalid, proving it was the one used
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
    }
}
