//! Database catalog: tables, columns and the relationship graph.
//!
//! Built once from live introspection (or injected [`DbInfo`] in tests) and
//! immutable afterwards; `reload` replaces the whole catalog atomically.

mod discover;

pub use discover::{discover, DbColumn, DbInfo, DbInfoBuilder, DbTable, TableBuilder};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{Config, TableConfig};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub schema: String,
    pub name: String,
    pub singular_name: String,
    pub plural_name: String,
    pub primary_col: Option<String>,
    pub tsv_col: Option<String>,
    pub columns: Vec<Column>,
    #[serde(skip)]
    col_index: HashMap<String, usize>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.col_index.get(name).map(|i| &self.columns[*i])
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.col_index.contains_key(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub sql_type: String,
    pub not_null: bool,
    pub is_array: bool,
    pub has_default: bool,
    /// `(table, column)` this column references.
    pub fk: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelKind {
    /// The child select's table holds the foreign key.
    BelongsTo,
    /// The parent select's table is referenced by the child's foreign key.
    OneToMany,
    OneToManyThrough {
        through: String,
        /// Column on the through table referencing the child side.
        through_local: String,
        /// Column on the through table referencing the parent side.
        through_remote: String,
    },
    Remote(RemoteInfo),
}

/// Directed edge `(child select table, parent select table)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub kind: RelKind,
    /// Column on the child select's table.
    pub col_local: String,
    /// Column on the parent select's table (for remote edges: the synthetic
    /// key field projected into the parent's JSON).
    pub col_remote: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInfo {
    /// URL template; `$id` is replaced with the projected key value.
    pub url: String,
    /// Path inside the remote response to splice in (empty = whole body).
    pub path: Vec<String>,
    /// Fields to keep from the remote payload (empty = all).
    pub fields: Vec<String>,
}

/// Edges for one ordered table pair. More than one entry means several
/// foreign keys join the same pair; each variant is keyed by its foreign-key
/// column and must be selected through a configured alias.
type RelEntry = Vec<(String, Relation)>;

/// What a GraphQL field name resolved to.
pub struct Resolved<'a> {
    pub table: &'a Table,
    pub singular: bool,
    /// Foreign-key column pinned by an alias, for ambiguous relationships.
    pub via: Option<&'a str>,
}

struct FieldTarget {
    table_idx: usize,
    singular: bool,
    via: Option<String>,
}

pub struct Schema {
    pub db_schema: String,
    tables: Vec<Table>,
    by_name: HashMap<String, usize>,
    fields: HashMap<String, FieldTarget>,
    rels: HashMap<(String, String), RelEntry>,
}

impl Schema {
    /// Assemble the catalog from introspection output and configuration
    /// (aliases, remote edges, name overrides).
    pub fn new(info: DbInfo, conf: &Config) -> Result<Schema> {
        if info.tables.is_empty() {
            return Err(Error::Config("no tables found in database".into()));
        }

        let mut schema = Schema {
            db_schema: info.schema.clone(),
            tables: Vec::with_capacity(info.tables.len()),
            by_name: HashMap::new(),
            fields: HashMap::new(),
            rels: HashMap::new(),
        };

        for t in &info.tables {
            let tconf = conf.table(&t.name);
            schema.add_table(t, tconf);
        }
        schema.add_foreign_keys();
        schema.add_through_edges();

        for tconf in &conf.tables {
            if let Some(real) = &tconf.table {
                schema.add_alias(tconf, real)?;
            }
            for remote in &tconf.remotes {
                schema.add_remote(&tconf.name, remote)?;
            }
        }

        Ok(schema)
    }

    fn add_table(&mut self, t: &DbTable, tconf: Option<&TableConfig>) {
        let (mut singular, mut plural) = english_forms(&t.name);
        if let Some(tc) = tconf {
            if let Some(s) = &tc.singular {
                singular = s.clone();
            }
            if let Some(p) = &tc.plural {
                plural = p.clone();
            }
        }

        let columns: Vec<Column> = t
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                sql_type: c.sql_type.clone(),
                not_null: c.not_null,
                is_array: c.is_array,
                has_default: c.has_default,
                fk: c
                    .fk_table
                    .as_ref()
                    .zip(c.fk_column.as_ref())
                    .map(|(t, c)| (t.clone(), c.clone())),
            })
            .collect();
        let col_index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();

        let primary_col = t
            .columns
            .iter()
            .find(|c| c.primary_key)
            .map(|c| c.name.clone());
        let tsv_col = t
            .columns
            .iter()
            .find(|c| c.sql_type == "tsvector")
            .map(|c| c.name.clone());

        let idx = self.tables.len();
        self.tables.push(Table {
            schema: t.schema.clone(),
            name: t.name.clone(),
            singular_name: singular.clone(),
            plural_name: plural.clone(),
            primary_col,
            tsv_col,
            columns,
            col_index,
        });

        self.by_name.insert(t.name.clone(), idx);
        self.fields.insert(
            plural,
            FieldTarget {
                table_idx: idx,
                singular: false,
                via: None,
            },
        );
        self.fields.insert(
            singular,
            FieldTarget {
                table_idx: idx,
                singular: true,
                via: None,
            },
        );
    }

    fn add_foreign_keys(&mut self) {
        let mut edges = Vec::new();
        for t in &self.tables {
            for c in &t.columns {
                let Some((ref_table, ref_col)) = &c.fk else {
                    continue;
                };
                if !self.by_name.contains_key(ref_table) {
                    continue;
                }
                edges.push((t.name.clone(), c.name.clone(), ref_table.clone(), ref_col.clone()));
            }
        }
        for (child, fk_col, parent, parent_col) in edges {
            self.set_rel(
                child.clone(),
                parent.clone(),
                fk_col.clone(),
                Relation {
                    kind: RelKind::BelongsTo,
                    col_local: fk_col.clone(),
                    col_remote: parent_col.clone(),
                },
            );
            self.set_rel(
                parent,
                child,
                fk_col.clone(),
                Relation {
                    kind: RelKind::OneToMany,
                    col_local: parent_col,
                    col_remote: fk_col,
                },
            );
        }
    }

    /// A table with exactly two foreign keys acts as a join table between the
    /// two referenced tables.
    fn add_through_edges(&mut self) {
        let mut throughs = Vec::new();
        for t in &self.tables {
            let fks: Vec<&Column> = t.columns.iter().filter(|c| c.fk.is_some()).collect();
            if fks.len() != 2 {
                continue;
            }
            let (a_col, b_col) = (fks[0], fks[1]);
            let (a_table, a_ref) = a_col.fk.clone().unwrap();
            let (b_table, b_ref) = b_col.fk.clone().unwrap();
            if a_table == b_table {
                continue;
            }
            throughs.push((
                t.name.clone(),
                (a_table, a_ref, a_col.name.clone()),
                (b_table, b_ref, b_col.name.clone()),
            ));
        }

        for (through, a, b) in throughs {
            for ((child, child_col, t_local), (parent, parent_col, t_remote)) in
                [(a.clone(), b.clone()), (b, a)]
            {
                self.set_rel(
                    child,
                    parent,
                    t_local.clone(),
                    Relation {
                        kind: RelKind::OneToManyThrough {
                            through: through.clone(),
                            through_local: t_local,
                            through_remote: t_remote,
                        },
                        col_local: child_col,
                        col_remote: parent_col,
                    },
                );
            }
        }
    }

    fn set_rel(&mut self, child: String, parent: String, via: String, rel: Relation) {
        let entry = self.rels.entry((child, parent)).or_default();
        if !entry.iter().any(|(_, r)| *r == rel) {
            entry.push((via, rel));
        }
    }

    fn add_alias(&mut self, tconf: &TableConfig, real: &str) -> Result<()> {
        let idx = *self
            .by_name
            .get(real)
            .ok_or_else(|| Error::UnknownTable(real.to_string()))?;
        let (singular, _) = english_forms(&tconf.name);
        let is_singular = singular == tconf.name && tconf.name != self.tables[idx].plural_name;
        self.fields.insert(
            tconf.name.clone(),
            FieldTarget {
                table_idx: idx,
                singular: is_singular,
                via: tconf.fk_column.clone(),
            },
        );
        Ok(())
    }

    fn add_remote(&mut self, table: &str, remote: &crate::config::RemoteConfig) -> Result<()> {
        let t = self.get_table(table)?;
        if !t.has_column(&remote.id_column) {
            return Err(Error::Config(format!(
                "remote {}: column {} not found on {}",
                remote.name, remote.id_column, table
            )));
        }
        let key_field = format!("__{}_{}", remote.name, remote.id_column);
        let rel = Relation {
            kind: RelKind::Remote(RemoteInfo {
                url: remote.url.clone(),
                path: remote.path.clone(),
                fields: remote.fields.clone(),
            }),
            col_local: remote.id_column.clone(),
            col_remote: key_field,
        };
        self.rels
            .insert((remote.name.clone(), table.to_string()), vec![(remote.id_column.clone(), rel)]);
        // The remote field resolves to no real table; lowering treats it as a
        // child select against the parent and the SQL stage skips it.
        Ok(())
    }

    pub fn get_table(&self, name: &str) -> Result<&Table> {
        self.by_name
            .get(name)
            .map(|i| &self.tables[*i])
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    /// Resolve a GraphQL field name to a table, reporting whether the field's
    /// form implies a single row.
    pub fn resolve_field(&self, field: &str) -> Option<Resolved<'_>> {
        self.fields.get(field).map(|t| Resolved {
            table: &self.tables[t.table_idx],
            singular: t.singular,
            via: t.via.as_deref(),
        })
    }

    pub fn get_rel(&self, child: &str, parent: &str, via: Option<&str>) -> Result<&Relation> {
        let entry = self
            .rels
            .get(&(child.to_string(), parent.to_string()))
            .ok_or_else(|| {
                Error::UnknownField(format!("no relationship between {child} and {parent}"))
            })?;
        match (entry.as_slice(), via) {
            ([(_, rel)], _) => Ok(rel),
            (list, Some(col)) if list.iter().any(|(v, _)| v == col) => {
                Ok(&list.iter().find(|(v, _)| v == col).unwrap().1)
            }
            _ => Err(Error::AmbiguousRelation {
                child: child.to_string(),
                parent: parent.to_string(),
            }),
        }
    }

    pub fn primary_col(&self, table: &str) -> Result<Option<&str>> {
        Ok(self.get_table(table)?.primary_col.as_deref())
    }

    pub fn tsv_col(&self, table: &str) -> Result<Option<&str>> {
        Ok(self.get_table(table)?.tsv_col.as_deref())
    }
}

/// Naive English singular/plural pair for a table name. Config overrides win
/// whenever the heuristic guesses wrong.
fn english_forms(name: &str) -> (String, String) {
    if let Some(stem) = name.strip_suffix("ies") {
        (format!("{stem}y"), name.to_string())
    } else if let Some(stem) = name.strip_suffix('s') {
        (stem.to_string(), name.to_string())
    } else {
        (name.to_string(), format!("{name}s"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;

    pub(crate) fn test_info() -> DbInfo {
        DbInfo::build("public")
            .table("users", |t| {
                t.pk("id", "bigint")
                    .col("email", "text")
                    .col("phone", "text")
                    .col("stripe_id", "text")
            })
            .table("posts", |t| {
                t.pk("id", "bigint")
                    .col("title", "text")
                    .col("body", "text")
                    .fk("user_id", "bigint", "users", "id")
                    .tsv("tsv")
            })
            .table("chats", |t| t.pk("id", "bigint").col("body", "text"))
            .table("tags", |t| t.pk("id", "bigint").col("name", "text"))
            .table("post_tags", |t| {
                t.fk("post_id", "bigint", "posts", "id")
                    .fk("tag_id", "bigint", "tags", "id")
            })
            .done()
    }

    #[test]
    fn field_resolution_singular_plural() {
        let schema = Schema::new(test_info(), &Config::default()).unwrap();

        let users = schema.resolve_field("users").unwrap();
        assert!(!users.singular);
        let user = schema.resolve_field("user").unwrap();
        assert!(user.singular);
        assert_eq!(user.table.name, "users");
        assert!(schema.resolve_field("tigers").is_none());
    }

    #[test]
    fn foreign_keys_make_both_edges() {
        let schema = Schema::new(test_info(), &Config::default()).unwrap();

        let down = schema.get_rel("posts", "users", None).unwrap();
        assert_eq!(down.kind, RelKind::BelongsTo);
        assert_eq!(down.col_local, "user_id");
        assert_eq!(down.col_remote, "id");

        let up = schema.get_rel("users", "posts", None).unwrap();
        assert_eq!(up.kind, RelKind::OneToMany);
        assert_eq!(up.col_local, "id");
        assert_eq!(up.col_remote, "user_id");
    }

    #[test]
    fn through_table_links_outer_tables() {
        let schema = Schema::new(test_info(), &Config::default()).unwrap();
        let rel = schema.get_rel("tags", "posts", None).unwrap();
        match &rel.kind {
            RelKind::OneToManyThrough {
                through,
                through_local,
                through_remote,
            } => {
                assert_eq!(through, "post_tags");
                assert_eq!(through_local, "tag_id");
                assert_eq!(through_remote, "post_id");
            }
            other => panic!("expected through relation, got {other:?}"),
        }
        assert_eq!(rel.col_local, "id");
        assert_eq!(rel.col_remote, "id");
    }

    #[test]
    fn tsv_column_is_detected() {
        let schema = Schema::new(test_info(), &Config::default()).unwrap();
        assert_eq!(schema.tsv_col("posts").unwrap(), Some("tsv"));
        assert_eq!(schema.tsv_col("users").unwrap(), None);
    }

    #[test]
    fn unknown_relationship_reports_both_tables() {
        let schema = Schema::new(test_info(), &Config::default()).unwrap();
        let err = schema.get_rel("chats", "users", None).unwrap_err();
        assert!(err.to_string().contains("chats"));
    }

    #[test]
    fn ambiguous_fk_requires_alias() {
        let info = DbInfo::build("public")
            .table("users", |t| t.pk("id", "bigint").col("name", "text"))
            .table("messages", |t| {
                t.pk("id", "bigint")
                    .fk("sender_id", "bigint", "users", "id")
                    .fk("recipient_id", "bigint", "users", "id")
            })
            .done();
        let mut conf = Config::default();
        conf.tables.push(TableConfig {
            name: "sender".into(),
            table: Some("users".into()),
            fk_column: Some("sender_id".into()),
            ..Default::default()
        });
        let schema = Schema::new(info, &conf).unwrap();

        let err = schema.get_rel("users", "messages", None).unwrap_err();
        assert!(matches!(err, Error::AmbiguousRelation { .. }));

        // The alias pins the edge to one foreign key.
        let sender = schema.resolve_field("sender").unwrap();
        assert_eq!(sender.via, Some("sender_id"));
        let rel = schema.get_rel("users", "messages", sender.via).unwrap();
        assert_eq!(rel.col_remote, "sender_id");
    }
}
