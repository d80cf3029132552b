//! Change tracking on the main database
//!
//! A row-level trigger on every replicated table appends `(op, table, row id,
//! transaction id, command id)` to `change_log` while the switchover state is
//! `in_progress`. Only identities are recorded; the replicator fetches the
//! current row contents when it applies the change.
//!
//! | step | statement |
//! |------|-----------|
//! | install | `change_log` table and `fn_process_change_log()` |
//! | triggers | `zz_99_change_log_<table>` after insert/update/delete, per row |
//! | enable | `idle` → `in_progress`, exactly one row |
//! | disable | drop triggers, function and table, `in_progress` → `idle` |

use tokio_postgres::{Client, GenericClient};
use tracing::{debug, info};

use crate::error::{pg_err, Result, SyncError};
use crate::table::{quote_ident, Table};

/// Prefix of every change tracking trigger. Sorts last among a table's
/// triggers so earlier triggers' writes are seen.
pub const TRIGGER_PREFIX: &str = "zz_99_change_log_";

const CHANGE_LOG_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS change_log (
    id BIGSERIAL PRIMARY KEY,
    op TEXT NOT NULL,
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    tx_id BIGINT,
    cmd_id cid,
    row_data JSONB
)
"#;

const CHANGE_LOG_FUNCTION_SQL: &str = r#"
CREATE OR REPLACE FUNCTION fn_process_change_log() RETURNS TRIGGER AS $$
DECLARE
    cur_state enum_switchover_state := 'idle';
BEGIN
    SELECT INTO cur_state current_state FROM switchover_state;
    IF cur_state != 'in_progress' THEN
        RETURN NULL;
    END IF;

    IF TG_OP = 'DELETE' THEN
        INSERT INTO change_log (op, table_name, row_id, tx_id, cmd_id)
        VALUES (TG_OP, TG_TABLE_NAME, cast(OLD.id AS TEXT), txid_current(), OLD.cmax);
    ELSE
        IF TG_OP = 'UPDATE' AND OLD.id IS DISTINCT FROM NEW.id THEN
            INSERT INTO change_log (op, table_name, row_id, tx_id, cmd_id)
            VALUES (TG_OP, TG_TABLE_NAME, cast(OLD.id AS TEXT), txid_current(), NEW.cmin);
        END IF;
        INSERT INTO change_log (op, table_name, row_id, tx_id, cmd_id)
        VALUES (TG_OP, TG_TABLE_NAME, cast(NEW.id AS TEXT), txid_current(), NEW.cmin);
    END IF;

    RETURN NULL;
END;
$$ LANGUAGE plpgsql
"#;

const LIST_TRIGGERS_SQL: &str = r#"
SELECT tgname::text, cls.relname::text
FROM pg_catalog.pg_trigger trg
JOIN pg_catalog.pg_class cls ON cls.oid = trg.tgrelid
JOIN pg_catalog.pg_namespace ns ON ns.oid = cls.relnamespace
WHERE ns.nspname = 'public'
    AND NOT trg.tgisinternal
    AND starts_with(trg.tgname, 'zz_99_change_log_')
"#;

const ENABLE_SQL: &str =
    "UPDATE switchover_state SET current_state = 'in_progress' WHERE current_state = 'idle'";
const DISABLE_SQL: &str =
    "UPDATE switchover_state SET current_state = 'idle' WHERE current_state = 'in_progress'";

const READ_CHANGES_SQL: &str = "SELECT id, table_name, row_id FROM change_log ORDER BY id";
const DELETE_CHANGES_SQL: &str = "DELETE FROM change_log WHERE id = ANY($1)";
const COUNT_CHANGES_SQL: &str = "SELECT count(*) FROM change_log";

/// Trigger name for `table`
pub fn trigger_name(table: &str) -> String {
    format!("{TRIGGER_PREFIX}{table}")
}

fn create_trigger_sql(table: &Table) -> String {
    let trigger = quote_ident(&trigger_name(&table.name));
    format!(
        "DROP TRIGGER IF EXISTS {trigger} ON {table};\n\
         CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE OR DELETE ON {table} \
         FOR EACH ROW EXECUTE PROCEDURE fn_process_change_log();",
        table = table.quoted(),
    )
}

/// One tracked change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Change log sequence number
    pub id: i64,
    /// Table the row belongs to
    pub table: String,
    /// Row id as text
    pub row_id: String,
}

/// Create the change log table and trigger function.
pub async fn install(client: &Client) -> Result<()> {
    client
        .batch_execute(CHANGE_LOG_TABLE_SQL)
        .await
        .map_err(pg_err(CHANGE_LOG_TABLE_SQL))?;
    client
        .batch_execute(CHANGE_LOG_FUNCTION_SQL)
        .await
        .map_err(pg_err(CHANGE_LOG_FUNCTION_SQL))?;
    Ok(())
}

/// (Re)create the change tracking trigger on every table.
pub async fn install_triggers(client: &Client, tables: &[Table]) -> Result<()> {
    for table in tables {
        let sql = create_trigger_sql(table);
        client.batch_execute(&sql).await.map_err(pg_err(&sql))?;
    }
    debug!("Installed change tracking triggers on {} tables", tables.len());
    Ok(())
}

/// Switch the state from `idle` to `in_progress`.
///
/// Fails if the state was anything but `idle`: tracking already active or
/// a switchover already committed.
pub async fn enable(client: &Client) -> Result<()> {
    let updated = client
        .execute(ENABLE_SQL, &[])
        .await
        .map_err(pg_err(ENABLE_SQL))?;
    if updated != 1 {
        return Err(SyncError::precondition(
            "switchover state is not idle; reset before starting",
        ));
    }
    info!("Change tracking enabled");
    Ok(())
}

/// Install tracking on `tables` and start recording changes.
pub async fn enable_change_log(client: &Client, tables: &[Table]) -> Result<()> {
    install(client).await?;
    install_triggers(client, tables).await?;
    enable(client).await
}

/// Remove all change tracking and return the state to `idle`.
///
/// Drops every tracking trigger found in the catalog (not just those of
/// currently known tables), then the function and the table, in one
/// transaction. A committed `use_next_db` state is left untouched.
pub async fn disable_change_log(client: &mut Client) -> Result<()> {
    let tx = client.transaction().await?;

    let triggers = tx
        .query(LIST_TRIGGERS_SQL, &[])
        .await
        .map_err(pg_err(LIST_TRIGGERS_SQL))?;
    for row in &triggers {
        let trigger: String = row.try_get(0)?;
        let table: String = row.try_get(1)?;
        let sql = format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote_ident(&trigger),
            quote_ident(&table)
        );
        tx.batch_execute(&sql).await.map_err(pg_err(&sql))?;
    }

    let drop_sql = "DROP FUNCTION IF EXISTS fn_process_change_log(); DROP TABLE IF EXISTS change_log";
    tx.batch_execute(drop_sql).await.map_err(pg_err(drop_sql))?;

    let reverted = tx
        .execute(DISABLE_SQL, &[])
        .await
        .map_err(pg_err(DISABLE_SQL))?;
    tx.commit().await?;

    info!(
        triggers = triggers.len(),
        reverted = reverted == 1,
        "Change tracking disabled"
    );
    Ok(())
}

/// Read the whole change log in order.
pub async fn read_changes<C: GenericClient + Sync>(client: &C) -> Result<Vec<ChangeEntry>> {
    client
        .query(READ_CHANGES_SQL, &[])
        .await
        .map_err(pg_err(READ_CHANGES_SQL))?
        .into_iter()
        .map(|row| {
            Ok(ChangeEntry {
                id: row.try_get(0)?,
                table: row.try_get(1)?,
                row_id: row.try_get(2)?,
            })
        })
        .collect()
}

/// Delete applied change log entries.
pub async fn delete_changes<C: GenericClient + Sync>(client: &C, ids: &[i64]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    client
        .execute(DELETE_CHANGES_SQL, &[&ids])
        .await
        .map_err(pg_err(DELETE_CHANGES_SQL))
}

/// Number of entries waiting to be applied.
pub async fn pending_changes<C: GenericClient + Sync>(client: &C) -> Result<i64> {
    let row = client
        .query_one(COUNT_CHANGES_SQL, &[])
        .await
        .map_err(pg_err(COUNT_CHANGES_SQL))?;
    Ok(row.try_get(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::IdType;

    #[test]
    fn test_trigger_name() {
        assert_eq!(trigger_name("users"), "zz_99_change_log_users");
    }

    #[test]
    fn test_create_trigger_sql() {
        let table = Table::new("users", vec!["id".into()], IdType::BigInt).unwrap();
        let sql = create_trigger_sql(&table);
        assert!(sql.starts_with("DROP TRIGGER IF EXISTS \"zz_99_change_log_users\" ON \"users\";"));
        assert!(sql.contains("AFTER INSERT OR UPDATE OR DELETE ON \"users\" FOR EACH ROW"));
        assert!(sql.ends_with("EXECUTE PROCEDURE fn_process_change_log();"));
    }

    #[test]
    fn test_trigger_function_records_identities_only() {
        assert!(CHANGE_LOG_FUNCTION_SQL.contains("cur_state != 'in_progress'"));
        assert!(CHANGE_LOG_FUNCTION_SQL.contains("OLD.cmax"));
        assert!(!CHANGE_LOG_FUNCTION_SQL.contains("row_data"));
    }
}
