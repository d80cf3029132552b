//! Sequence value replication
//!
//! Sequences are copied by value (`last_value`, `is_called`) in every sync
//! pass so ids generated on the next database after the flip never collide
//! with rows copied from the main database.

use futures::future::try_join_all;
use tokio_postgres::types::ToSql;
use tokio_postgres::GenericClient;

use crate::error::{pg_err, Result};
use crate::table::quote_ident;

const SCAN_SEQUENCES_SQL: &str = r#"
SELECT sequence_name::text
FROM information_schema.sequences
WHERE sequence_schema = 'public'
    AND sequence_name <> 'change_log_id_seq'
ORDER BY sequence_name
"#;

const SETVAL_SQL: &str = "SELECT pg_catalog.setval($1::text::regclass, $2, $3)";

/// Current state of one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceValue {
    /// Sequence name in `public`
    pub name: String,
    /// `last_value`
    pub last_value: i64,
    /// Whether `last_value` has already been handed out
    pub is_called: bool,
}

impl SequenceValue {
    /// Name as passed to `setval`
    fn qualified_name(&self) -> String {
        format!("public.{}", quote_ident(&self.name))
    }
}

/// List the sequences to replicate.
pub async fn scan_sequences<C: GenericClient + Sync>(client: &C) -> Result<Vec<String>> {
    client
        .query(SCAN_SEQUENCES_SQL, &[])
        .await
        .map_err(pg_err(SCAN_SEQUENCES_SQL))?
        .into_iter()
        .map(|row| Ok(row.try_get(0)?))
        .collect()
}

/// Read the value of every sequence. Queries are pipelined.
pub async fn read_values<C: GenericClient + Sync>(
    client: &C,
    names: &[String],
) -> Result<Vec<SequenceValue>> {
    let queries: Vec<String> = names
        .iter()
        .map(|name| {
            format!(
                "SELECT last_value, is_called FROM public.{}",
                quote_ident(name)
            )
        })
        .collect();

    let rows = try_join_all(queries.iter().map(|sql| client.query_one(sql.as_str(), &[]))).await?;

    names
        .iter()
        .zip(rows)
        .map(|(name, row)| {
            Ok(SequenceValue {
                name: name.clone(),
                last_value: row.try_get(0)?,
                is_called: row.try_get(1)?,
            })
        })
        .collect()
}

/// Apply sequence values. Queries are pipelined.
pub async fn write_values<C: GenericClient + Sync>(
    client: &C,
    values: &[SequenceValue],
) -> Result<()> {
    let names: Vec<String> = values.iter().map(SequenceValue::qualified_name).collect();
    let params: Vec<[&(dyn ToSql + Sync); 3]> = values
        .iter()
        .zip(&names)
        .map(|(value, name)| [name as &(dyn ToSql + Sync), &value.last_value, &value.is_called])
        .collect();
    try_join_all(params.iter().map(|p| client.query_one(SETVAL_SQL, p)))
        .await
        .map_err(pg_err(SETVAL_SQL))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_name() {
        let value = SequenceValue {
            name: "users_id_seq".into(),
            last_value: 10,
            is_called: true,
        };
        assert_eq!(value.qualified_name(), "public.\"users_id_seq\"");
    }

    #[test]
    fn test_scan_excludes_change_log_sequence() {
        assert!(SCAN_SEQUENCES_SQL.contains("<> 'change_log_id_seq'"));
    }
}
