//! The switchover state value
//!
//! A single row in `switchover_state` decides whether change tracking is
//! active and, after the flip, which database is authoritative.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_postgres::GenericClient;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Bookkeeping schema: the state enum, the single-row state table and a
/// per-database identity. Safe to run repeatedly.
pub const STATE_SCHEMA: &str = r#"
DO $$ BEGIN
    CREATE TYPE enum_switchover_state AS ENUM ('idle', 'in_progress', 'use_next_db');
EXCEPTION WHEN duplicate_object THEN NULL;
END $$;

CREATE TABLE IF NOT EXISTS switchover_state (
    ok BOOLEAN PRIMARY KEY DEFAULT true CHECK (ok),
    current_state enum_switchover_state NOT NULL DEFAULT 'idle',
    db_id UUID NOT NULL DEFAULT md5(random()::text || clock_timestamp()::text)::uuid
);

INSERT INTO switchover_state (ok) VALUES (true) ON CONFLICT DO NOTHING;
"#;

const READ_STATE_SQL: &str = "SELECT current_state::text FROM switchover_state";
const DATABASE_INFO_SQL: &str = "SELECT db_id, version() FROM switchover_state";
const CONNECTIONS_SQL: &str = r#"
SELECT coalesce(application_name, ''), count(*)
FROM pg_stat_activity
WHERE datname = current_database()
    AND backend_type = 'client backend'
GROUP BY 1
ORDER BY 2 DESC, 1
"#;

/// Global switchover state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchoverState {
    /// No switchover running; change tracking inactive
    Idle,
    /// Change tracking active; main database still authoritative
    InProgress,
    /// Flip committed; next database is authoritative
    UseNextDb,
}

impl SwitchoverState {
    /// Database enum label
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::UseNextDb => "use_next_db",
        }
    }
}

impl fmt::Display for SwitchoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwitchoverState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(Self::Idle),
            "in_progress" => Ok(Self::InProgress),
            "use_next_db" => Ok(Self::UseNextDb),
            other => Err(Error::schema(format!("unknown switchover state: {other}"))),
        }
    }
}

/// Identity of one database taking part in a switchover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Stable per-database id from `switchover_state.db_id`
    pub id: Uuid,
    /// Server version string
    pub version: String,
    /// Client sessions on this database by application name, busiest first
    #[serde(default)]
    pub connections: Vec<ConnectionCount>,
}

/// Number of client sessions sharing one `application_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCount {
    pub application_name: String,
    pub count: i64,
}

/// Create the state enum and table if missing.
pub async fn install(client: &tokio_postgres::Client) -> Result<()> {
    client
        .batch_execute(STATE_SCHEMA)
        .await
        .map_err(|e| Error::from_pg(e, STATE_SCHEMA))
}

/// Read the current switchover state.
pub async fn read_state<C: GenericClient + Sync>(client: &C) -> Result<SwitchoverState> {
    let row = client
        .query_opt(READ_STATE_SQL, &[])
        .await
        .map_err(|e| Error::from_pg(e, READ_STATE_SQL))?
        .ok_or_else(|| Error::schema("switchover_state has no row"))?;
    let value: String = row.try_get(0)?;
    value.parse()
}

/// Read database identity, server version and who is connected.
pub async fn database_info<C: GenericClient + Sync>(client: &C) -> Result<DatabaseInfo> {
    let row = client
        .query_opt(DATABASE_INFO_SQL, &[])
        .await
        .map_err(|e| Error::from_pg(e, DATABASE_INFO_SQL))?
        .ok_or_else(|| Error::schema("switchover_state has no row"))?;
    Ok(DatabaseInfo {
        id: row.try_get(0)?,
        version: row.try_get(1)?,
        connections: connection_counts(client).await?,
    })
}

/// Client sessions on the current database, grouped by application name.
///
/// Includes the calling session.
pub async fn connection_counts<C: GenericClient + Sync>(
    client: &C,
) -> Result<Vec<ConnectionCount>> {
    client
        .query(CONNECTIONS_SQL, &[])
        .await
        .map_err(|e| Error::from_pg(e, CONNECTIONS_SQL))?
        .iter()
        .map(|row| -> Result<ConnectionCount> {
            Ok(ConnectionCount {
                application_name: row.try_get(0)?,
                count: row.try_get(1)?,
            })
        })
        .collect()
}
