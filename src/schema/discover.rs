//! Live introspection against `information_schema`.
//!
//! Produces a [`DbInfo`] snapshot which [`super::Schema::new`] turns into the
//! catalog. Tests build the snapshot directly through [`DbInfo::build`] and
//! never touch a database.

use serde::{Deserialize, Serialize};

use crate::db::{bool_value, text_value, Pool};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbInfo {
    pub schema: String,
    pub tables: Vec<DbTable>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbTable {
    pub schema: String,
    pub name: String,
    pub columns: Vec<DbColumn>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbColumn {
    pub name: String,
    pub sql_type: String,
    pub not_null: bool,
    pub is_array: bool,
    pub has_default: bool,
    pub primary_key: bool,
    pub fk_table: Option<String>,
    pub fk_column: Option<String>,
}

/// One row per column, with primary/foreign key facts joined in from the
/// constraint tables. Ordered so a table's columns arrive together.
const COLUMNS_SQL: &str = r#"
SELECT
    col.table_schema,
    col.table_name,
    col.column_name,
    CASE WHEN col.data_type = 'ARRAY' THEN col.udt_name ELSE col.data_type END,
    (col.is_nullable = 'NO'),
    (col.data_type = 'ARRAY'),
    (col.column_default IS NOT NULL),
    (pk.column_name IS NOT NULL),
    fk.foreign_table_name,
    fk.foreign_column_name
FROM information_schema.columns col
LEFT JOIN (
    SELECT kcu.table_schema, kcu.table_name, kcu.column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON kcu.constraint_name = tc.constraint_name
     AND kcu.table_schema = tc.table_schema
    WHERE tc.constraint_type = 'PRIMARY KEY'
) pk ON pk.table_schema = col.table_schema
    AND pk.table_name = col.table_name
    AND pk.column_name = col.column_name
LEFT JOIN (
    SELECT
        kcu.table_schema,
        kcu.table_name,
        kcu.column_name,
        ccu.table_name AS foreign_table_name,
        ccu.column_name AS foreign_column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON kcu.constraint_name = tc.constraint_name
     AND kcu.table_schema = tc.table_schema
    JOIN information_schema.constraint_column_usage ccu
      ON ccu.constraint_name = tc.constraint_name
     AND ccu.table_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY'
) fk ON fk.table_schema = col.table_schema
    AND fk.table_name = col.table_name
    AND fk.column_name = col.column_name
WHERE col.table_schema NOT IN ('information_schema', 'pg_catalog')
ORDER BY col.table_schema, col.table_name, col.ordinal_position
"#;

/// Read the catalog from the live database, dropping anything on the
/// blocklist (table names or `table.column` pairs).
pub async fn discover(pool: &dyn Pool, blocklist: &[String]) -> Result<DbInfo> {
    let mut conn = pool.acquire().await?;
    let rows = conn.query(COLUMNS_SQL, &[]).await?;

    let mut info = DbInfo::default();
    for row in &rows.rows {
        if row.values.len() < 10 {
            return Err(Error::Execution("introspection row too short".into()));
        }
        let schema = text_value(&row.values[0])?;
        let table = text_value(&row.values[1])?;
        if blocked(blocklist, &table, None) {
            continue;
        }
        let column = text_value(&row.values[2])?;
        if blocked(blocklist, &table, Some(&column)) {
            continue;
        }

        if info.schema.is_empty() {
            info.schema = schema.clone();
        }
        if info.tables.last().map(|t| t.name != table).unwrap_or(true) {
            info.tables.push(DbTable {
                schema,
                name: table,
                columns: Vec::new(),
            });
        }

        let fk_table = text_value(&row.values[8])?;
        let fk_column = text_value(&row.values[9])?;
        info.tables.last_mut().unwrap().columns.push(DbColumn {
            name: column,
            sql_type: text_value(&row.values[3])?,
            not_null: bool_value(&row.values[4]),
            is_array: bool_value(&row.values[5]),
            has_default: bool_value(&row.values[6]),
            primary_key: bool_value(&row.values[7]),
            fk_table: (!fk_table.is_empty()).then_some(fk_table),
            fk_column: (!fk_column.is_empty()).then_some(fk_column),
        });
    }

    if info.tables.is_empty() {
        return Err(Error::Config("no tables found in database".into()));
    }
    Ok(info)
}

fn blocked(blocklist: &[String], table: &str, column: Option<&str>) -> bool {
    blocklist.iter().any(|b| match (b.split_once('.'), column) {
        (Some((bt, bc)), Some(col)) => bt == table && bc == col,
        (None, None) => b == table,
        (None, Some(_)) => b == table,
        _ => false,
    })
}

/// Fluent construction of a [`DbInfo`] fixture.
pub struct DbInfoBuilder {
    info: DbInfo,
}

pub struct TableBuilder {
    table: DbTable,
}

impl DbInfo {
    pub fn build(schema: &str) -> DbInfoBuilder {
        DbInfoBuilder {
            info: DbInfo {
                schema: schema.to_string(),
                tables: Vec::new(),
            },
        }
    }
}

impl DbInfoBuilder {
    pub fn table(mut self, name: &str, f: impl FnOnce(TableBuilder) -> TableBuilder) -> Self {
        let builder = TableBuilder {
            table: DbTable {
                schema: self.info.schema.clone(),
                name: name.to_string(),
                columns: Vec::new(),
            },
        };
        self.info.tables.push(f(builder).table);
        self
    }

    pub fn done(self) -> DbInfo {
        self.info
    }
}

impl TableBuilder {
    pub fn col(mut self, name: &str, sql_type: &str) -> Self {
        self.table.columns.push(DbColumn {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            ..Default::default()
        });
        self
    }

    pub fn pk(mut self, name: &str, sql_type: &str) -> Self {
        self.table.columns.push(DbColumn {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            not_null: true,
            has_default: true,
            primary_key: true,
            ..Default::default()
        });
        self
    }

    pub fn fk(mut self, name: &str, sql_type: &str, ref_table: &str, ref_col: &str) -> Self {
        self.table.columns.push(DbColumn {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            fk_table: Some(ref_table.to_string()),
            fk_column: Some(ref_col.to_string()),
            ..Default::default()
        });
        self
    }

    pub fn tsv(mut self, name: &str) -> Self {
        self.table.columns.push(DbColumn {
            name: name.to_string(),
            sql_type: "tsvector".to_string(),
            ..Default::default()
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocklist_matches_tables_and_columns() {
        let bl = vec!["secrets".to_string(), "users.password".to_string()];
        assert!(blocked(&bl, "secrets", None));
        assert!(blocked(&bl, "secrets", Some("anything")));
        assert!(blocked(&bl, "users", Some("password")));
        assert!(!blocked(&bl, "users", Some("email")));
        assert!(!blocked(&bl, "users", None));
    }
}
