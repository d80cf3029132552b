//! Test fixtures
//!
//! One PostgreSQL container per test. A switchover needs two databases, so
//! [`TestPostgres::switchover_pair`] creates `main_db` and `next_db` inside
//! the same server, gives both the application schema and installs the
//! switchover bookkeeping.

use anyhow::Result;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use switchover_db::ConnectionConfig;

const USER: &str = "testuser";
const PASSWORD: &str = "testpass";
const ADMIN_DB: &str = "testdb";

/// Application schema shared by both databases.
///
/// `alerts` references `users` with a cascading delete, and its bigserial id
/// gives the sequence sync something to copy.
pub const APP_SCHEMA: &str = r#"
CREATE TABLE users (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE alerts (
    id BIGSERIAL PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    message TEXT NOT NULL,
    severity INTEGER NOT NULL DEFAULT 1,
    acknowledged BOOLEAN NOT NULL DEFAULT false
);
"#;

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL test container
pub struct TestPostgres {
    pub container: testcontainers::ContainerAsync<testcontainers_modules::postgres::Postgres>,
    pub host: String,
    pub port: u16,
}

impl TestPostgres {
    /// Start a PostgreSQL container
    pub async fn start() -> Result<Self> {
        use testcontainers::{runners::AsyncRunner, ImageExt};
        use testcontainers_modules::postgres::Postgres;

        let container = Postgres::default()
            .with_tag("16-alpine")
            .with_env_var("POSTGRES_DB", ADMIN_DB)
            .with_env_var("POSTGRES_USER", USER)
            .with_env_var("POSTGRES_PASSWORD", PASSWORD)
            .start()
            .await?;

        // Retry port retrieval to handle testcontainers race condition
        let host = container.get_host().await?.to_string();
        let mut port = None;
        for i in 0..10 {
            match container.get_host_port_ipv4(5432).await {
                Ok(p) => {
                    port = Some(p);
                    break;
                }
                Err(e) => {
                    tracing::debug!(
                        "Waiting for PostgreSQL port exposure (attempt {}): {}",
                        i + 1,
                        e
                    );
                    sleep(Duration::from_millis(100 * (i + 1) as u64)).await;
                }
            }
        }
        let port =
            port.ok_or_else(|| anyhow::anyhow!("PostgreSQL port not exposed after retries"))?;

        let pg = Self {
            container,
            host,
            port,
        };
        pg.wait_for_postgres().await?;
        Ok(pg)
    }

    async fn wait_for_postgres(&self) -> Result<()> {
        for i in 0..30 {
            match tokio_postgres::connect(&self.url(ADMIN_DB), tokio_postgres::NoTls).await {
                Ok((client, connection)) => {
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            tracing::error!("PostgreSQL connection error: {}", e);
                        }
                    });
                    if client.simple_query("SELECT 1").await.is_ok() {
                        info!("PostgreSQL ready after {} attempts", i + 1);
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::debug!("Waiting for PostgreSQL (attempt {}): {}", i + 1, e);
                }
            }
            sleep(Duration::from_millis(500)).await;
        }

        anyhow::bail!("PostgreSQL did not become ready in time")
    }

    /// Connection URL for `dbname` on this server
    pub fn url(&self, dbname: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            USER, PASSWORD, self.host, self.port, dbname
        )
    }

    /// Switchover connection configuration for `dbname`
    pub fn config(&self, dbname: &str) -> ConnectionConfig {
        ConnectionConfig::new(self.url(dbname)).with_application_name("switchover-tests")
    }

    /// Get a tokio-postgres connection to the admin database
    pub async fn connect(&self) -> Result<tokio_postgres::Client> {
        self.connect_to(ADMIN_DB).await
    }

    /// Get a tokio-postgres connection to `dbname`
    pub async fn connect_to(&self, dbname: &str) -> Result<tokio_postgres::Client> {
        let (client, connection) =
            tokio_postgres::connect(&self.url(dbname), tokio_postgres::NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(client)
    }

    /// Create an empty database
    pub async fn create_database(&self, dbname: &str) -> Result<()> {
        let client = self.connect().await?;
        client
            .batch_execute(&format!("CREATE DATABASE {dbname}"))
            .await?;
        Ok(())
    }

    /// Create `main_db` and `next_db` with the application schema and the
    /// switchover bookkeeping installed on both.
    pub async fn switchover_pair(&self) -> Result<SwitchoverPair> {
        let pair = SwitchoverPair {
            main: self.config("main_db"),
            next: self.config("next_db"),
        };

        for dbname in ["main_db", "next_db"] {
            self.create_database(dbname).await?;
            self.connect_to(dbname).await?.batch_execute(APP_SCHEMA).await?;
        }
        switchoverd::install(&pair.main, &pair.next).await?;

        info!("Switchover database pair created");
        Ok(pair)
    }
}

// ============================================================================
// Database pair
// ============================================================================

/// The two databases of a switchover
#[derive(Debug, Clone)]
pub struct SwitchoverPair {
    pub main: ConnectionConfig,
    pub next: ConnectionConfig,
}

impl SwitchoverPair {
    pub async fn connect_main(&self) -> Result<tokio_postgres::Client> {
        Ok(switchover_db::postgres::connect_client(&self.main).await?)
    }

    pub async fn connect_next(&self) -> Result<tokio_postgres::Client> {
        Ok(switchover_db::postgres::connect_client(&self.next).await?)
    }
}

// ============================================================================
// Data helpers
// ============================================================================

/// Insert `alerts_per_user.len()` users, each with the given number of
/// alerts. Returns the user ids in insertion order.
pub async fn seed_users(
    client: &tokio_postgres::Client,
    alerts_per_user: &[usize],
) -> Result<Vec<uuid::Uuid>> {
    let mut users = Vec::with_capacity(alerts_per_user.len());
    for (i, alerts) in alerts_per_user.iter().enumerate() {
        let id = uuid::Uuid::new_v4();
        client
            .execute(
                "INSERT INTO users (id, name) VALUES ($1, $2)",
                &[&id, &format!("user_{i}")],
            )
            .await?;
        for n in 0..*alerts {
            client
                .execute(
                    "INSERT INTO alerts (user_id, message, severity) VALUES ($1, $2, $3)",
                    &[&id, &format!("alert {n} for user_{i}"), &((n % 3) as i32 + 1)],
                )
                .await?;
        }
        users.push(id);
    }
    Ok(users)
}

/// Every row of `table` as one JSON document, ordered by id.
///
/// Equal documents on both databases mean byte-identical row payloads.
pub async fn table_json(client: &tokio_postgres::Client, table: &str) -> Result<String> {
    let row = client
        .query_one(
            &format!("SELECT coalesce(jsonb_agg(t ORDER BY t.id), '[]'::jsonb)::text FROM {table} t"),
            &[],
        )
        .await?;
    Ok(row.get(0))
}

/// Number of rows in `table`
pub async fn count_rows(client: &tokio_postgres::Client, table: &str) -> Result<i64> {
    let row = client
        .query_one(&format!("SELECT count(*) FROM {table}"), &[])
        .await?;
    Ok(row.get(0))
}

/// Current switchover state of the database behind `client`
pub async fn switchover_state(client: &tokio_postgres::Client) -> Result<String> {
    let row = client
        .query_one("SELECT current_state::text FROM switchover_state", &[])
        .await?;
    Ok(row.get(0))
}
