//! PostgreSQL connection handling for switchover-db
//!
//! Wraps a `tokio_postgres::Client` with the bookkeeping the routing pool
//! needs: which database it points at, its age, and whether it currently
//! holds the shared switchover lock.

use std::time::{Duration, Instant};

use crate::connection::{ConnectionConfig, Target};
use crate::error::{Error, Result};

/// A live PostgreSQL connection.
pub struct PgConnection {
    client: tokio_postgres::Client,
    target: Target,
    created_at: Instant,
    last_used: Instant,
    shared_lock: bool,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("target", &self.target)
            .field("age", &self.age())
            .field("shared_lock", &self.shared_lock)
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client, target: Target) -> Self {
        let now = Instant::now();
        Self {
            client,
            target,
            created_at: now,
            last_used: now,
            shared_lock: false,
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    /// Get the underlying client mutably (needed for transactions)
    pub fn client_mut(&mut self) -> &mut tokio_postgres::Client {
        &mut self.client
    }

    /// Consume the wrapper, returning the client
    pub fn into_client(self) -> tokio_postgres::Client {
        self.client
    }

    /// Database this connection points at
    pub fn target(&self) -> Target {
        self.target
    }

    /// Get the age of this connection (time since creation)
    #[inline]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Check if connection is older than the specified max lifetime
    #[inline]
    pub fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.age() > max_lifetime
    }

    /// Get time since last checkout or return
    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Update last used timestamp
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Whether the driver task has shut down
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Whether this session holds the shared switchover lock
    pub fn holds_shared_lock(&self) -> bool {
        self.shared_lock
    }

    pub(crate) fn set_shared_lock(&mut self, held: bool) {
        self.shared_lock = held;
    }
}

/// Open a raw client for the given configuration.
///
/// The connection driver runs on its own task; driver failures are logged.
pub async fn connect_client(config: &ConnectionConfig) -> Result<tokio_postgres::Client> {
    let mut pg_config: tokio_postgres::Config = config.url.parse().map_err(|e| {
        Error::config(format!(
            "invalid connection string {}: {}",
            config.redacted_url(),
            e
        ))
    })?;
    pg_config.connect_timeout(config.connect_timeout());
    if let Some(name) = &config.application_name {
        pg_config.application_name(name);
    }

    let (client, connection) = pg_config
        .connect(tokio_postgres::NoTls)
        .await
        .map_err(|e| {
            Error::connection_with_source(
                format!("failed to connect to {}", config.redacted_url()),
                e,
            )
        })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Open a connection pointing at `target`.
pub async fn connect(config: &ConnectionConfig, target: Target) -> Result<PgConnection> {
    let client = connect_client(config).await?;
    Ok(PgConnection::new(client, target))
}
