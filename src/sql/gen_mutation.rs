//! Mutation rendering.
//!
//! Every mutation is a CTE chain feeding the standard query shape, so one
//! round trip both writes and returns the shaped payload:
//!
//! ```sql
//! WITH "_gqlc_input" AS (SELECT ($1) :: json AS j),
//!      "<table>" AS (<INSERT|UPDATE|DELETE> … RETURNING "<table>".*)
//!      [, sibling connect CTEs]
//! SELECT json_object_agg(…) FROM (…) AS "done_1337"
//! ```
//!
//! The tail select reads from the CTE, which shadows the real table.

use crate::parser::ast::Value;
use crate::qcode::{Connect, MutationData, QKind};
use crate::schema::Table;
use crate::{Error, Result};

use super::gen_expr::render_where;
use super::gen_query::render_query;
use super::{cast_type, escape_str, Ctx};

const INPUT_CTE: &str = "_gqlc_input";

pub(super) fn render_mutation(ctx: &mut Ctx) -> Result<()> {
    let sel = &ctx.qc.selects[0];
    let table = ctx.schema.get_table(&sel.table)?;
    let kind = ctx.qc.kind;

    let data = match (&sel.mutation, kind) {
        (_, QKind::Delete) => None,
        (Some(data), _) => Some(data.clone()),
        (None, _) => return Err(Error::parse(format!("{kind} needs a payload"))),
    };

    ctx.push("WITH ");

    if let Some(data) = &data {
        if let Some(var) = &data.var {
            ctx.quoted(INPUT_CTE);
            ctx.push(" AS (SELECT (");
            ctx.param(var, "json");
            ctx.push(") :: json AS j), ");
        }
    }

    ctx.quoted(&table.name);
    ctx.push(" AS (");
    match kind {
        QKind::Insert | QKind::Upsert => {
            render_insert(ctx, table, data.as_ref().expect("checked above"), kind)?
        }
        QKind::Update => render_update(ctx, table, data.as_ref().expect("checked above"))?,
        QKind::Delete => render_delete(ctx, table)?,
        _ => unreachable!("caller dispatches on mutation kinds"),
    }
    ctx.push(")");

    if let Some(data) = &data {
        for connect in data.connects.iter().filter(|c| c.one_to_many) {
            render_sibling_connect(ctx, table, connect)?;
        }
    }

    ctx.push(" ");
    render_query(ctx)
}

fn render_insert(ctx: &mut Ctx, table: &Table, data: &MutationData, kind: QKind) -> Result<()> {
    ctx.push("INSERT INTO ");
    ctx.quoted(&table.name);
    ctx.push(" (");
    let mut first = true;
    for col in &data.cols {
        if !first {
            ctx.push(", ");
        }
        first = false;
        ctx.quoted(col);
    }
    for connect in data.connects.iter().filter(|c| !c.one_to_many) {
        if connect.disconnect {
            return Err(Error::parse("disconnect is only valid in an update"));
        }
        if !first {
            ctx.push(", ");
        }
        first = false;
        ctx.quoted(&connect.fk_col);
    }
    ctx.push(") ");

    if data.var.is_some() {
        ctx.push("SELECT ");
        render_json_values(ctx, table, data)?;
        ctx.push(" FROM ");
        ctx.quoted(INPUT_CTE);
        ctx.push(" i");
    } else {
        ctx.push("VALUES (");
        render_literal_values(ctx, table, data)?;
        ctx.push(")");
    }

    if kind == QKind::Upsert {
        let pk = table.primary_col.as_deref().ok_or_else(|| {
            Error::Config(format!("upsert needs a primary key on {}", table.name))
        })?;
        ctx.push(" ON CONFLICT (");
        ctx.quoted(pk);
        let update_cols: Vec<&String> = data.cols.iter().filter(|c| c.as_str() != pk).collect();
        if update_cols.is_empty() {
            ctx.push(") DO NOTHING");
        } else {
            ctx.push(") DO UPDATE SET ");
            for (i, col) in update_cols.iter().enumerate() {
                if i != 0 {
                    ctx.push(", ");
                }
                ctx.quoted(col);
                ctx.push(" = EXCLUDED.");
                ctx.quoted(col);
            }
        }
    }

    render_returning(ctx, table);
    Ok(())
}

fn render_update(ctx: &mut Ctx, table: &Table, data: &MutationData) -> Result<()> {
    ctx.push("UPDATE ");
    ctx.quoted(&table.name);
    ctx.push(" SET ");

    let mut first = true;
    if data.var.is_some() {
        for col in &data.cols {
            if !first {
                ctx.push(", ");
            }
            first = false;
            ctx.quoted(col);
            ctx.push(" = ");
            render_json_value(ctx, table, col);
        }
    } else {
        for (col, value) in &data.values {
            if !first {
                ctx.push(", ");
            }
            first = false;
            ctx.quoted(col);
            ctx.push(" = ");
            render_literal_value(ctx, table, col, value)?;
        }
    }

    for connect in data.connects.iter().filter(|c| !c.one_to_many) {
        if !first {
            ctx.push(", ");
        }
        first = false;
        ctx.quoted(&connect.fk_col);
        if connect.disconnect {
            ctx.push(" = NULL");
        } else {
            ctx.push(" = ");
            render_connect_subselect(ctx, connect)?;
        }
    }

    if first {
        return Err(Error::parse("update writes no columns"));
    }

    if data.var.is_some() {
        ctx.push(" FROM ");
        ctx.quoted(INPUT_CTE);
        ctx.push(" i");
    }

    render_mutation_where(ctx, table)?;
    render_returning(ctx, table);
    Ok(())
}

fn render_delete(ctx: &mut Ctx, table: &Table) -> Result<()> {
    ctx.push("DELETE FROM ");
    ctx.quoted(&table.name);
    render_mutation_where(ctx, table)?;
    render_returning(ctx, table);
    Ok(())
}

fn render_mutation_where(ctx: &mut Ctx, table: &Table) -> Result<()> {
    let sel = &ctx.qc.selects[0];
    if let Some(where_) = &sel.where_ {
        ctx.push(" WHERE (");
        render_where(ctx, &sel.table, table, where_)?;
        ctx.push(")");
    }
    Ok(())
}

fn render_returning(ctx: &mut Ctx, table: &Table) {
    ctx.push(" RETURNING ");
    ctx.quoted(&table.name);
    ctx.push(".*");
}

/// `CAST(i.j->>'col' AS type)` for each written column, in payload order.
fn render_json_values(ctx: &mut Ctx, table: &Table, data: &MutationData) -> Result<()> {
    let mut first = true;
    for col in &data.cols {
        if !first {
            ctx.push(", ");
        }
        first = false;
        render_json_value(ctx, table, col);
    }
    for connect in data.connects.iter().filter(|c| !c.one_to_many) {
        if !first {
            ctx.push(", ");
        }
        first = false;
        render_connect_subselect(ctx, connect)?;
    }
    Ok(())
}

fn render_json_value(ctx: &mut Ctx, table: &Table, col: &str) {
    let sql_type = table
        .column(col)
        .map(|c| cast_type(&c.sql_type))
        .unwrap_or("text");
    match sql_type {
        "json" | "jsonb" => {
            ctx.push("(i.j->'");
            ctx.push(&escape_str(col));
            ctx.push("') :: ");
            ctx.push(sql_type);
        }
        _ => {
            ctx.push("CAST(i.j->>'");
            ctx.push(&escape_str(col));
            ctx.push("' AS ");
            ctx.push(sql_type);
            ctx.push(")");
        }
    }
}

fn render_literal_values(ctx: &mut Ctx, table: &Table, data: &MutationData) -> Result<()> {
    let mut first = true;
    for (col, value) in &data.values {
        if !first {
            ctx.push(", ");
        }
        first = false;
        render_literal_value(ctx, table, col, value)?;
    }
    for connect in data.connects.iter().filter(|c| !c.one_to_many) {
        if !first {
            ctx.push(", ");
        }
        first = false;
        render_connect_subselect(ctx, connect)?;
    }
    Ok(())
}

fn render_literal_value(ctx: &mut Ctx, table: &Table, col: &str, value: &Value) -> Result<()> {
    match value {
        Value::Null => ctx.push("NULL"),
        Value::Bool(b) => ctx.push(if *b { "true" } else { "false" }),
        Value::Int(i) => ctx.push(&i.to_string()),
        Value::Float(f) => ctx.push(&f.to_string()),
        Value::Str(s) | Value::Enum(s) => {
            ctx.push("'");
            ctx.push(&escape_str(s));
            ctx.push("'");
        }
        Value::Var(name) => {
            let sql_type = table
                .column(col)
                .map(|c| c.sql_type.clone())
                .unwrap_or_else(|| "text".to_string());
            ctx.param(name, &sql_type);
        }
        other => {
            return Err(Error::parse(format!(
                "unsupported value for column {col}: {other:?}"
            )))
        }
    }
    Ok(())
}

/// `(SELECT "key" FROM "related" WHERE (…) LIMIT ('1') :: integer)`
fn render_connect_subselect(ctx: &mut Ctx, connect: &Connect) -> Result<()> {
    let related = ctx.schema.get_table(&connect.table)?;
    ctx.push("(SELECT ");
    ctx.quoted(&connect.key_col);
    ctx.push(" FROM ");
    ctx.quoted(&connect.table);
    ctx.push(" WHERE (");
    render_where(ctx, &connect.table, related, &connect.filter)?;
    ctx.push(") LIMIT ('1') :: integer)");
    Ok(())
}

/// One-to-many connects run as sibling CTEs that point the related rows'
/// foreign key at the freshly mutated row.
fn render_sibling_connect(ctx: &mut Ctx, table: &Table, connect: &Connect) -> Result<()> {
    let related = ctx.schema.get_table(&connect.table)?;

    ctx.push(", ");
    ctx.quoted(&connect.table);
    ctx.push(" AS (UPDATE ");
    ctx.quoted(&connect.table);
    ctx.push(" SET ");
    ctx.quoted(&connect.fk_col);
    if connect.disconnect {
        ctx.push(" = NULL");
    } else {
        ctx.push(" = (SELECT ");
        ctx.quoted(&connect.key_col);
        ctx.push(" FROM ");
        ctx.quoted(&table.name);
        ctx.push(" LIMIT ('1') :: integer)");
    }
    ctx.push(" WHERE (");
    render_where(ctx, &connect.table, related, &connect.filter)?;
    ctx.push(")");
    render_returning(ctx, related);
    ctx.push(")");
    Ok(())
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use crate::config::Config;
    use crate::parser;
    use crate::qcode::tests::test_compiler;
    use crate::schema::Schema;
    use crate::sql::{Compiler, Dialect};

    fn plan_mutation(src: &str, vars: Option<serde_json::Value>) -> String {
        let conf = Config::default();
        let doc = parser::parse(src).unwrap();
        let qc = test_compiler(&conf)
            .compile(&doc.operations[0], "user", vars.as_ref(), None)
            .unwrap();
        let schema = Schema::new(crate::schema::tests::test_info(), &conf).unwrap();
        Compiler::new(Dialect::Postgres, None)
            .compile(&qc, &schema)
            .unwrap()
            .0
    }

    #[test]
    fn insert_literal_payload() {
        assert_snapshot!(
            plan_mutation(
                r#"mutation { users(insert: { email: "a@x", phone: $phone }) { id email } }"#,
                None,
            ),
            @r###"WITH "users" AS (INSERT INTO "users" ("email", "phone") VALUES ('a@x', $1) RETURNING "users".*) SELECT json_object_agg('users', "users") FROM (SELECT coalesce(json_agg("sel_json_0"), '[]') AS "users" FROM (SELECT row_to_json((SELECT "sel_0" FROM (SELECT "users_0"."id" AS "id", "users_0"."email" AS "email") AS "sel_0")) AS "sel_json_0" FROM (SELECT "users"."id", "users"."email" FROM "users" LIMIT ('20') :: integer) AS "users_0") AS "sel_json_agg_0") AS "done_1337""###
        );
    }

    #[test]
    fn insert_variable_payload_uses_json_input() {
        let sql = plan_mutation(
            "mutation { users(insert: $data) { id } }",
            Some(serde_json::json!({ "data": { "email": "a@x", "phone": "1" } })),
        );
        assert!(sql.starts_with(r#"WITH "_gqlc_input" AS (SELECT ($1) :: json AS j), "users" AS (INSERT INTO "users" ("email", "phone") SELECT CAST(i.j->>'email' AS text), CAST(i.j->>'phone' AS text) FROM "_gqlc_input" i RETURNING "users".*)"#));
    }

    #[test]
    fn update_with_where() {
        let sql = plan_mutation(
            r#"mutation { users(update: { phone: "2" }, where: { id: { eq: $id } }) { id phone } }"#,
            None,
        );
        assert!(sql.contains(
            r#""users" AS (UPDATE "users" SET "phone" = '2' WHERE ((("users"."id") = $1)) RETURNING "users".*)"#
        ));
    }

    #[test]
    fn delete_needs_no_payload() {
        let sql = plan_mutation(
            "mutation { users(delete: true, where: { id: { eq: $id } }) { id } }",
            None,
        );
        assert!(sql.starts_with(
            r#"WITH "users" AS (DELETE FROM "users" WHERE ((("users"."id") = $1)) RETURNING "users".*)"#
        ));
    }

    #[test]
    fn upsert_conflicts_on_primary_key() {
        let sql = plan_mutation(
            r#"mutation { users(upsert: { id: 1, email: "a@x" }) { id } }"#,
            None,
        );
        assert!(sql.contains(r#"ON CONFLICT ("id") DO UPDATE SET "email" = EXCLUDED."email""#));
    }

    #[test]
    fn belongs_to_connect_inlines_subselect() {
        let sql = plan_mutation(
            r#"mutation { posts(insert: { title: "t", user: { connect: { id: 5 } } }) { id } }"#,
            None,
        );
        assert!(sql.contains(
            r#"INSERT INTO "posts" ("title", "user_id") VALUES ('t', (SELECT "id" FROM "users" WHERE ((("users"."id") = 5)) LIMIT ('1') :: integer))"#
        ));
    }

    #[test]
    fn one_to_many_connect_emits_sibling_cte() {
        let sql = plan_mutation(
            r#"mutation { users(update: { phone: "3", posts: { connect: { id: { eq: 9 } } } }, where: { id: { eq: 1 } }) { id } }"#,
            None,
        );
        assert!(sql.contains(
            r#", "posts" AS (UPDATE "posts" SET "user_id" = (SELECT "id" FROM "users" LIMIT ('1') :: integer) WHERE ((("posts"."id") = 9)) RETURNING "posts".*)"#
        ));
    }

    #[test]
    fn mysql_rejects_mutations() {
        let conf = Config::default();
        let doc = parser::parse(r#"mutation { users(insert: { email: "a@x" }) { id } }"#).unwrap();
        let qc = test_compiler(&conf)
            .compile(&doc.operations[0], "user", None, None)
            .unwrap();
        let schema = Schema::new(crate::schema::tests::test_info(), &conf).unwrap();
        let err = Compiler::new(Dialect::Mysql, None)
            .compile(&qc, &schema)
            .unwrap_err();
        assert_eq!(err.to_string(), "mysql: mutations not supported");
    }
}
