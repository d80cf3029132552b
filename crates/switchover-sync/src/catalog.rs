//! Table catalog scanning and dependency ordering
//!
//! Tables are read from `information_schema` for the `public` schema and
//! ordered so that every table comes after the tables it references through
//! non-deferrable foreign keys. Bookkeeping tables are never replicated.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchover_sync::catalog;
//!
//! let tables = catalog::scan_tables(&client, &[]).await?;
//! for table in &tables {
//!     println!("{} depends on {:?}", table.name, table.deps);
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use tokio_postgres::GenericClient;
use tracing::debug;

use crate::error::{pg_err, Result, SyncError};
use crate::table::{IdType, Table};

/// Tables owned by the switchover machinery itself.
pub const BOOKKEEPING_TABLES: &[&str] = &[
    "switchover_state",
    "switchover_log",
    "change_log",
    "schema_migrations",
];

const COLUMNS_SQL: &str = r#"
SELECT col.table_name::text, col.column_name::text, col.data_type::text, col.udt_name::text
FROM information_schema.columns col
JOIN information_schema.tables tbl
    ON tbl.table_schema = col.table_schema
    AND tbl.table_name = col.table_name
    AND tbl.table_type = 'BASE TABLE'
WHERE col.table_schema = 'public'
ORDER BY col.table_name, col.ordinal_position
"#;

const FOREIGN_KEYS_SQL: &str = r#"
SELECT src.relname::text, dst.relname::text
FROM pg_catalog.pg_constraint con
JOIN pg_catalog.pg_class src ON src.oid = con.conrelid
JOIN pg_catalog.pg_class dst ON dst.oid = con.confrelid
JOIN pg_catalog.pg_namespace ns ON ns.oid = con.connamespace
WHERE con.contype = 'f'
    AND NOT con.condeferrable
    AND ns.nspname = 'public'
"#;

/// One row of the column scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Owning table
    pub table: String,
    /// Column name
    pub column: String,
    /// `information_schema` data type
    pub data_type: String,
    /// Underlying type name
    pub udt_name: String,
}

/// Read every replicable table in `public`, ordered by dependency.
///
/// `exclude` names extra tables to skip on top of [`BOOKKEEPING_TABLES`].
pub async fn scan_tables<C>(client: &C, exclude: &[String]) -> Result<Vec<Table>>
where
    C: GenericClient + Sync,
{
    let columns = client
        .query(COLUMNS_SQL, &[])
        .await
        .map_err(pg_err(COLUMNS_SQL))?
        .into_iter()
        .map(|row| {
            Ok(ColumnInfo {
                table: row.try_get(0)?,
                column: row.try_get(1)?,
                data_type: row.try_get(2)?,
                udt_name: row.try_get(3)?,
            })
        })
        .collect::<std::result::Result<Vec<_>, tokio_postgres::Error>>()?;

    let foreign_keys = client
        .query(FOREIGN_KEYS_SQL, &[])
        .await
        .map_err(pg_err(FOREIGN_KEYS_SQL))?
        .into_iter()
        .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
        .collect::<std::result::Result<Vec<(String, String)>, tokio_postgres::Error>>()?;

    let tables = build_tables(columns, &foreign_keys, exclude)?;
    debug!("Scanned {} tables", tables.len());
    order_tables(tables)
}

fn is_excluded(name: &str, exclude: &[String]) -> bool {
    BOOKKEEPING_TABLES.contains(&name) || exclude.iter().any(|e| e == name)
}

/// Assemble tables from scanned columns and `(table, referenced)` pairs.
///
/// Self references and references to tables outside the replicated set do
/// not constrain the order and are dropped.
pub fn build_tables(
    columns: Vec<ColumnInfo>,
    foreign_keys: &[(String, String)],
    exclude: &[String],
) -> Result<Vec<Table>> {
    let mut grouped: BTreeMap<String, (Vec<String>, Option<IdType>)> = BTreeMap::new();
    for col in columns {
        if is_excluded(&col.table, exclude) {
            continue;
        }
        let entry = grouped.entry(col.table).or_default();
        if col.column == "id" {
            entry.1 = Some(IdType::from_column_type(&col.data_type, &col.udt_name));
        }
        entry.0.push(col.column);
    }

    let names: BTreeSet<String> = grouped.keys().cloned().collect();
    let mut tables = Vec::with_capacity(grouped.len());
    for (name, (columns, id_type)) in grouped {
        let id_type = id_type.ok_or_else(|| SyncError::MissingIdColumn {
            table: name.clone(),
        })?;
        let mut table = Table::new(name, columns, id_type)?;
        for (src, dst) in foreign_keys {
            if *src == table.name && *dst != table.name && names.contains(dst) {
                table.deps.insert(dst.clone());
            }
        }
        tables.push(table);
    }
    Ok(tables)
}

/// Order tables so every table follows all of its dependencies.
///
/// Among tables that are ready at the same time the lexically smallest name
/// goes first, so the order is stable across nodes.
pub fn order_tables(tables: Vec<Table>) -> Result<Vec<Table>> {
    let mut remaining: BTreeMap<String, Table> =
        tables.into_iter().map(|t| (t.name.clone(), t)).collect();
    let mut placed: BTreeSet<String> = BTreeSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let next = remaining
            .values()
            .find(|t| {
                t.deps
                    .iter()
                    .all(|d| placed.contains(d) || (!remaining.contains_key(d) && d != &t.name))
            })
            .map(|t| t.name.clone());

        let Some(name) = next else {
            return Err(SyncError::CircularDependency {
                tables: remaining.into_keys().collect(),
            });
        };
        if let Some(table) = remaining.remove(&name) {
            placed.insert(name);
            ordered.push(table);
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn col(table: &str, column: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            table: table.into(),
            column: column.into(),
            data_type: data_type.into(),
            udt_name: data_type.into(),
        }
    }

    fn table(name: &str, deps: &[&str]) -> Table {
        deps.iter().fold(
            Table::new(name, vec!["id".into()], IdType::BigInt).unwrap(),
            |t, d| t.with_dep(*d),
        )
    }

    fn names(tables: &[Table]) -> Vec<&str> {
        tables.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_build_tables_skips_bookkeeping() {
        let columns = vec![
            col("change_log", "id", "bigint"),
            col("switchover_state", "ok", "boolean"),
            col("users", "id", "uuid"),
            col("users", "name", "text"),
            col("audit", "id", "bigint"),
        ];
        let tables = build_tables(columns, &[], &["audit".to_string()]).unwrap();
        assert_eq!(names(&tables), vec!["users"]);
        assert_eq!(tables[0].id_type, IdType::Uuid);
        assert_eq!(tables[0].columns, vec!["id", "name"]);
    }

    #[test]
    fn test_build_tables_requires_id() {
        let columns = vec![col("events", "ts", "timestamp with time zone")];
        let err = build_tables(columns, &[], &[]).unwrap_err();
        assert!(matches!(err, SyncError::MissingIdColumn { table } if table == "events"));
    }

    #[test]
    fn test_build_tables_filters_foreign_keys() {
        let columns = vec![
            col("users", "id", "uuid"),
            col("posts", "id", "bigint"),
            col("posts", "author_id", "uuid"),
        ];
        let fks = vec![
            ("posts".to_string(), "users".to_string()),
            ("posts".to_string(), "posts".to_string()),
            ("posts".to_string(), "switchover_state".to_string()),
        ];
        let tables = build_tables(columns, &fks, &[]).unwrap();
        let posts = tables.iter().find(|t| t.name == "posts").unwrap();
        assert_eq!(posts.deps.iter().collect::<Vec<_>>(), vec!["users"]);
    }

    #[test]
    fn test_order_tables_dependencies_first() {
        let tables = vec![
            table("comments", &["posts", "users"]),
            table("posts", &["users"]),
            table("users", &[]),
            table("tags", &[]),
        ];
        let ordered = order_tables(tables).unwrap();
        assert_eq!(names(&ordered), vec!["tags", "users", "posts", "comments"]);
    }

    #[test]
    fn test_order_tables_detects_cycle() {
        let tables = vec![table("a", &["b"]), table("b", &["a"]), table("c", &[])];
        let err = order_tables(tables).unwrap_err();
        match err {
            SyncError::CircularDependency { tables } => assert_eq!(tables, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_order_tables_self_reference_is_cycle_free_after_build() {
        // self references are dropped by build_tables; if one slips through
        // it is reported rather than looping
        let err = order_tables(vec![table("tree", &["tree"])]).unwrap_err();
        assert!(matches!(err, SyncError::CircularDependency { .. }));
    }

    proptest! {
        #[test]
        fn prop_order_respects_every_edge(
            edges in proptest::collection::vec((0usize..12, 0usize..12), 0..40)
        ) {
            // only edges from a higher index to a lower one, so the graph is acyclic
            let mut tables: Vec<Table> = (0..12).map(|i| table(&format!("t{i:02}"), &[])).collect();
            for (a, b) in edges {
                if a > b {
                    let dep = tables[b].name.clone();
                    tables[a].deps.insert(dep);
                }
            }

            let ordered = order_tables(tables.clone()).unwrap();
            prop_assert_eq!(ordered.len(), tables.len());

            let position = |name: &str| ordered.iter().position(|t| t.name == name).unwrap();
            for t in &ordered {
                for dep in &t.deps {
                    prop_assert!(position(dep.as_str()) < position(t.name.as_str()));
                }
            }
        }

        #[test]
        fn prop_order_is_deterministic(
            edges in proptest::collection::vec((0usize..8, 0usize..8), 0..20),
            rotate in 0usize..8,
        ) {
            let mut tables: Vec<Table> = (0..8).map(|i| table(&format!("t{i}"), &[])).collect();
            for (a, b) in edges {
                if a > b {
                    let dep = tables[b].name.clone();
                    tables[a].deps.insert(dep);
                }
            }
            let mut shuffled = tables.clone();
            shuffled.rotate_left(rotate);

            let a = order_tables(tables).unwrap();
            let b = order_tables(shuffled).unwrap();
            prop_assert_eq!(names(&a), names(&b));
        }
    }
}
