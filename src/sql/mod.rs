//! SQL back end: renders QCode to one statement returning one JSON value.
//!
//! The statement shape is fixed:
//!
//! ```sql
//! SELECT json_object_agg('<root-field>', <payload>) FROM ( … ) AS "done_1337"
//! ```
//!
//! with every nested select inlined as a `LEFT OUTER JOIN LATERAL`. User
//! values never appear in the text; they become positional placeholders
//! recorded in [`Metadata`] in first-use order.

pub mod dialect;
mod gen_expr;
mod gen_mutation;
mod gen_query;

pub use dialect::Dialect;

use serde::{Deserialize, Serialize};

use crate::qcode::QCode;
use crate::role::Roles;
use crate::schema::Schema;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Placeholder slots; `$1` is `params[0]`. Binding by this order yields a
    /// well-formed execution.
    pub params: Vec<Param>,
    /// Selects the engine must materialize via remote joins.
    pub remotes: Vec<usize>,
    /// `Cache-Control` directive for the response, from configuration.
    pub cache_control: Option<String>,
    /// Present when the root select pages by cursor: the sibling JSON key
    /// carrying the page's end cursor.
    pub cursor_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub sql_type: String,
}

pub struct Compiler {
    dialect: Dialect,
    cache_header: Option<String>,
}

impl Compiler {
    pub fn new(dialect: Dialect, cache_header: Option<String>) -> Compiler {
        Compiler {
            dialect,
            cache_header,
        }
    }

    /// Render one statement. Compiling the same QCode twice yields
    /// byte-identical SQL; nothing here depends on iteration order of any
    /// unordered container.
    pub fn compile(&self, qc: &QCode, schema: &Schema) -> Result<(String, Metadata)> {
        if qc.selects.is_empty() {
            return Err(Error::parse("empty query"));
        }

        let mut ctx = Ctx {
            w: String::with_capacity(512),
            qc,
            schema,
            md: Metadata {
                params: Vec::new(),
                remotes: qc.remotes.clone(),
                cache_control: self.cache_header.clone(),
                cursor_field: None,
            },
        };

        if qc.kind.is_mutation() {
            if !self.dialect.supports_mutations() {
                return Err(Error::UnsupportedOperation(format!(
                    "{}: mutations not supported",
                    self.dialect
                )));
            }
            gen_mutation::render_mutation(&mut ctx)?;
        } else {
            gen_query::render_query(&mut ctx)?;
        }

        log::debug!("compiled {} {:?}", qc.kind, qc.name);
        Ok((ctx.w, ctx.md))
    }
}

/// Build the role-resolution statement evaluated once per request when ABAC
/// is on. Role `match` expressions are checked in declaration order.
pub fn render_role_statement(roles: &Roles, roles_query: &str) -> Result<(String, Metadata)> {
    if !roles_query.contains("$user_id") {
        return Err(Error::Config("roles_query: $user_id variable missing".into()));
    }

    let mut md = Metadata::default();
    let mut w = String::with_capacity(256);

    w.push_str("SELECT (CASE WHEN EXISTS (");
    render_var_text(&mut w, &mut md, roles_query);
    w.push_str(") THEN (SELECT (CASE");
    for role in roles.matchers() {
        w.push_str(" WHEN ");
        w.push_str(role.match_expr.as_deref().unwrap_or_default());
        w.push_str(" THEN '");
        w.push_str(&role.name);
        w.push('\'');
    }
    w.push_str(" ELSE 'user' END) FROM (");
    render_var_text(&mut w, &mut md, roles_query);
    w.push_str(") AS \"_gqlc_auth_roles_query\" LIMIT 1) ELSE 'anon' END) ");
    w.push_str("FROM (VALUES (1)) AS \"_gqlc_auth_filler\" LIMIT 1");

    Ok((w, md))
}

/// Copy `text` replacing `$name` references with positional placeholders.
fn render_var_text(w: &mut String, md: &mut Metadata, text: &str) {
    let mut rest = text;
    while let Some(pos) = rest.find('$') {
        w.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        let len = rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(rest.len());
        if len == 0 {
            w.push('$');
            continue;
        }
        let name = &rest[..len];
        let idx = param_index(md, name, "text");
        w.push('$');
        w.push_str(&idx.to_string());
        rest = &rest[len..];
    }
    w.push_str(rest);
}

/// Register (or reuse) a named placeholder; returns its 1-based index.
fn param_index(md: &mut Metadata, name: &str, sql_type: &str) -> usize {
    if let Some(i) = md.params.iter().position(|p| p.name == name) {
        return i + 1;
    }
    md.params.push(Param {
        name: name.to_string(),
        sql_type: sql_type.to_string(),
    });
    md.params.len()
}

/// Shared rendering state for one statement.
pub(crate) struct Ctx<'a> {
    w: String,
    qc: &'a QCode,
    schema: &'a Schema,
    md: Metadata,
}

impl<'a> Ctx<'a> {
    fn push(&mut self, s: &str) {
        self.w.push_str(s);
    }

    fn push_num(&mut self, n: usize) {
        self.w.push_str(&n.to_string());
    }

    /// `$N` placeholder, deduplicated by name.
    fn param(&mut self, name: &str, sql_type: &str) {
        let idx = param_index(&mut self.md, name, sql_type);
        self.w.push('$');
        self.push_num(idx);
    }

    fn quoted(&mut self, ident: &str) {
        self.w.push('"');
        self.w.push_str(ident);
        self.w.push('"');
    }

    /// `"table"."col"`
    fn col_with_table(&mut self, table: &str, col: &str) {
        self.quoted(table);
        self.w.push('.');
        self.quoted(col);
    }

    /// `"table_id"."col"`
    fn col_with_table_id(&mut self, table: &str, id: usize, col: &str) {
        self.w.push('"');
        self.w.push_str(table);
        self.w.push('_');
        self.w.push_str(&id.to_string());
        self.w.push_str("\".\"");
        self.w.push_str(col);
        self.w.push('"');
    }

    /// ` AS "alias"`
    fn alias(&mut self, alias: &str) {
        self.push(" AS ");
        self.quoted(alias);
    }

    /// `"table_id_col_suffix"`: the aliases order-by columns travel under.
    fn table_id_col_suffix(&mut self, table: &str, id: usize, col: &str, suffix: &str) {
        self.w.push('"');
        self.w.push_str(table);
        self.w.push('_');
        self.w.push_str(&id.to_string());
        self.w.push('_');
        self.w.push_str(col);
        self.w.push_str(suffix);
        self.w.push('"');
    }
}

/// Escape a string literal for direct inclusion in SQL text.
pub(crate) fn escape_str(s: &str) -> String {
    s.replace('\'', "''")
}

/// Cast target for a column's declared SQL type. Types we do not recognize
/// degrade to text, which Postgres can cast onward itself.
pub(crate) fn cast_type(sql_type: &str) -> &str {
    match sql_type {
        "bigint" | "int8" => "bigint",
        "integer" | "int" | "int4" => "integer",
        "smallint" | "int2" => "smallint",
        "numeric" | "decimal" => "numeric",
        "real" | "float4" => "real",
        "double precision" | "float8" => "double precision",
        "boolean" | "bool" => "boolean",
        "json" => "json",
        "jsonb" => "jsonb",
        "uuid" => "uuid",
        "date" => "date",
        "timestamp without time zone" | "timestamp" => "timestamp",
        "timestamp with time zone" | "timestamptz" => "timestamptz",
        _ => "text",
    }
}
