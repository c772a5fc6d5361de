//! Select-tree rendering.
//!
//! A non-recursive walk drives the output: every select is visited twice,
//! once to open its subquery and once to close it, with children rendered in
//! between as `LEFT OUTER JOIN LATERAL` blocks. Each select body is a
//! three-layer sandwich: `json_agg` over `row_to_json` over the base select
//! that touches the real table. Singular selects skip the `json_agg` layer.

use crate::qcode::{agg_split, CursorDir, OrderDir, Scalar, Select};
use crate::schema::{RelKind, Table};
use crate::{Error, Result};

use super::gen_expr::render_where;
use super::{cast_type, escape_str, Ctx};

/// Work items for the select walk.
enum WorkItem {
    Enter(usize),
    Leave(usize),
}

pub(super) fn render_query(ctx: &mut Ctx) -> Result<()> {
    let root = &ctx.qc.selects[0];

    if root.paging.cursor.is_some() && !root.singular {
        // Cursor roots carry a sibling key with the page's end cursor, so
        // the envelope is built explicitly instead of aggregated.
        let cursor_field = format!("{}_cursor", root.field_name);
        ctx.push("SELECT json_build_object('");
        ctx.push(&escape_str(&root.field_name));
        ctx.push("', ");
        ctx.quoted(&root.table);
        ctx.push(", '");
        ctx.push(&escape_str(&cursor_field));
        ctx.push("', \"__cursor\") FROM (");
        ctx.md.cursor_field = Some(cursor_field);
    } else {
        ctx.push("SELECT json_object_agg('");
        ctx.push(&escape_str(&root.field_name));
        ctx.push("', ");
        if root.singular {
            ctx.push("\"sel_json_0\"");
        } else {
            ctx.quoted(&root.table);
        }
        ctx.push(") FROM (");
    }

    render_selects(ctx)?;

    ctx.push(")");
    ctx.alias("done_1337");
    Ok(())
}

/// The shared walk; mutation rendering reuses it for the RETURNING shape.
pub(super) fn render_selects(ctx: &mut Ctx) -> Result<()> {
    let mut stack = vec![WorkItem::Leave(0), WorkItem::Enter(0)];

    while let Some(item) = stack.pop() {
        match item {
            WorkItem::Enter(id) => {
                let sel = &ctx.qc.selects[id];
                let table = ctx.schema.get_table(&sel.table)?;

                if id != 0 {
                    ctx.push(" LEFT OUTER JOIN LATERAL (");
                }
                render_select(ctx, sel, table)?;

                for &cid in sel.children.iter().rev() {
                    if ctx.qc.selects[cid].skip.is_none() {
                        stack.push(WorkItem::Leave(cid));
                        stack.push(WorkItem::Enter(cid));
                    }
                }
            }
            WorkItem::Leave(id) => {
                let sel = &ctx.qc.selects[id];
                if !sel.singular {
                    ctx.push(")");
                    ctx.push(" AS \"sel_json_agg_");
                    ctx.push_num(id);
                    ctx.push("\"");
                }
                if id != 0 {
                    ctx.push(")");
                    ctx.push(" AS \"");
                    ctx.push(&sel.table);
                    ctx.push("_");
                    ctx.push_num(id);
                    ctx.push("_join\" ON ('true')");
                }
            }
        }
    }

    Ok(())
}

/// Columns the base select must carry for its children's sake: join keys and
/// remote-join projections.
struct ChildCol {
    col: String,
    /// Remote key columns surface in the JSON under this alias.
    remote_alias: Option<String>,
}

fn process_children(ctx: &Ctx, sel: &Select) -> Result<Vec<ChildCol>> {
    let mut cols: Vec<ChildCol> = Vec::new();
    let mut seen = |cols: &[ChildCol], name: &str| {
        sel.cols.iter().any(|c| c.name == name) || cols.iter().any(|c| c.col == name)
    };

    for &cid in &sel.children {
        let child = &ctx.qc.selects[cid];
        match child.skip {
            None => {
                let rel = ctx
                    .schema
                    .get_rel(&child.table, &sel.table, child.via.as_deref())?;
                if !seen(&cols, &rel.col_remote) {
                    cols.push(ChildCol {
                        col: rel.col_remote.clone(),
                        remote_alias: None,
                    });
                }
            }
            Some(crate::qcode::Skip::Remote) => {
                let rel = ctx.schema.get_rel(&child.table, &sel.table, None)?;
                if !seen(&cols, &rel.col_local) {
                    cols.push(ChildCol {
                        col: rel.col_local.clone(),
                        remote_alias: Some(rel.col_remote.clone()),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(cols)
}

fn render_select(ctx: &mut Ctx, sel: &Select, table: &Table) -> Result<()> {
    let child_cols = process_children(ctx, sel)?;
    let has_order = !sel.order_by.is_empty();
    let cursored = sel.paging.cursor.is_some() && !sel.singular;

    if !sel.singular {
        ctx.push("SELECT coalesce(json_agg(\"sel_json_");
        ctx.push_num(sel.id);
        ctx.push("\"");
        if has_order {
            render_order_by_aliases(ctx, sel);
        }
        ctx.push("), '[]')");
        ctx.alias(&sel.table);
        if cursored {
            ctx.push(", (array_agg(\"__cur_");
            ctx.push_num(sel.id);
            ctx.push("\"");
            if has_order {
                render_order_by_aliases(ctx, sel);
            }
            ctx.push("))[count(*)::int] AS \"__cursor\"");
        }
        ctx.push(" FROM (");
    }

    // row_to_json layer.
    ctx.push("SELECT ");
    if !sel.distinct_on.is_empty() {
        ctx.push("DISTINCT ON (");
        for (i, col) in sel.distinct_on.iter().enumerate() {
            if i != 0 {
                ctx.push(", ");
            }
            ctx.col_with_table_id(&sel.table, sel.id, col);
        }
        ctx.push(") ");
    }
    ctx.push("row_to_json((SELECT \"sel_");
    ctx.push_num(sel.id);
    ctx.push("\" FROM (SELECT ");

    let mut first = true;
    render_columns(ctx, sel, &child_cols, &mut first);
    render_joined_columns(ctx, sel, &mut first);
    if first {
        // Every column was dropped; keep the statement well-formed.
        ctx.push("true AS \"_\"");
    }

    ctx.push(")");
    ctx.push(" AS \"sel_");
    ctx.push_num(sel.id);
    ctx.push("\"))");
    ctx.push(" AS \"sel_json_");
    ctx.push_num(sel.id);
    ctx.push("\"");

    if has_order {
        for (col, _) in &sel.order_by {
            ctx.push(", ");
            ctx.col_with_table_id(&sel.table, sel.id, col);
            ctx.push(" AS ");
            ctx.table_id_col_suffix(&sel.table, sel.id, col, "_ob");
        }
    }
    if cursored {
        ctx.push(", concat_ws(','");
        for (col, _) in &sel.order_by {
            ctx.push(", ");
            ctx.col_with_table_id(&sel.table, sel.id, col);
        }
        ctx.push(") AS \"__cur_");
        ctx.push_num(sel.id);
        ctx.push("\"");
    }

    render_base_select(ctx, sel, table, &child_cols)
}

fn render_columns(ctx: &mut Ctx, sel: &Select, child_cols: &[ChildCol], first: &mut bool) {
    for col in &sel.cols {
        sep(ctx, first);
        ctx.col_with_table_id(&sel.table, sel.id, &col.name);
        ctx.alias(&col.field_name);
    }
    for cc in child_cols {
        let Some(alias) = &cc.remote_alias else {
            continue;
        };
        sep(ctx, first);
        ctx.col_with_table_id(&sel.table, sel.id, &cc.col);
        ctx.alias(alias);
    }
}

fn render_joined_columns(ctx: &mut Ctx, sel: &Select, first: &mut bool) {
    for &cid in &sel.children {
        let child = &ctx.qc.selects[cid];
        if child.skip.is_some() {
            continue;
        }
        sep(ctx, first);
        if child.singular {
            ctx.push("\"sel_json_");
            ctx.push_num(cid);
            ctx.push("\"");
        } else {
            ctx.push("\"");
            ctx.push(&child.table);
            ctx.push("_");
            ctx.push_num(cid);
            ctx.push("_join\".\"");
            ctx.push(&child.table);
            ctx.push("\"");
        }
        ctx.alias(&child.field_name);
    }
}

fn render_base_select(
    ctx: &mut Ctx,
    sel: &Select,
    table: &Table,
    child_cols: &[ChildCol],
) -> Result<()> {
    let is_root = sel.parent.is_none();
    let mut is_agg = false;
    let mut group_cols: Vec<&str> = Vec::new();

    ctx.push(" FROM (SELECT ");

    let mut first = true;
    for col in &sel.cols {
        let name = col.name.as_str();

        if table.has_column(name) {
            sep(ctx, &mut first);
            ctx.col_with_table(&table.name, name);
            group_cols.push(name);
            continue;
        }

        if sel.search.is_some() && name == "search_rank" {
            let Some(tsv) = table.tsv_col.as_deref() else {
                continue;
            };
            sep(ctx, &mut first);
            ctx.push("ts_rank(");
            ctx.col_with_table(&table.name, tsv);
            ctx.push(", to_tsquery(");
            render_search_arg(ctx, sel)?;
            ctx.push("))");
            ctx.alias(name);
            continue;
        }

        if sel.search.is_some() {
            if let Some(target) = name.strip_prefix("search_headline_") {
                if !table.has_column(target) {
                    continue;
                }
                sep(ctx, &mut first);
                ctx.push("ts_headline(");
                ctx.col_with_table(&table.name, target);
                ctx.push(", to_tsquery(");
                render_search_arg(ctx, sel)?;
                ctx.push("))");
                ctx.alias(name);
                continue;
            }
        }

        if let Some((func, target)) = agg_split(name) {
            if sel.functions && table.has_column(target) {
                sep(ctx, &mut first);
                ctx.push(func);
                ctx.push("(");
                ctx.col_with_table(&table.name, target);
                ctx.push(")");
                ctx.alias(name);
                is_agg = true;
                continue;
            }
        }

        // Unknown name with no allow-list in force: echoed back so clients
        // notice the typo instead of silently losing the field.
        sep(ctx, &mut first);
        ctx.push("'");
        ctx.push(&escape_str(name));
        ctx.push(" not defined'");
        ctx.alias(&col.field_name);
    }

    for cc in child_cols {
        sep(ctx, &mut first);
        ctx.col_with_table(&table.name, &cc.col);
    }
    if first {
        ctx.push("true AS \"_\"");
    }

    ctx.push(" FROM ");
    ctx.quoted(&table.name);

    // Relationship, filters and keyset predicate share one WHERE.
    let mut opened = false;
    if !is_root {
        render_join_table(ctx, sel)?;
        ctx.push(" WHERE (");
        opened = true;
        render_relationship(ctx, sel)?;
    }

    if let Some(where_) = &sel.where_ {
        if opened {
            ctx.push(" AND ");
        } else {
            ctx.push(" WHERE (");
            opened = true;
        }
        render_where(ctx, &sel.table, table, where_)?;
    }

    if sel.paging.cursor.is_some() {
        if opened {
            ctx.push(" AND ");
        } else {
            ctx.push(" WHERE (");
            opened = true;
        }
        render_cursor_predicate(ctx, sel, table)?;
    }

    if opened {
        ctx.push(")");
    }

    if is_agg && !group_cols.is_empty() {
        ctx.push(" GROUP BY ");
        for (i, col) in group_cols.iter().enumerate() {
            if i != 0 {
                ctx.push(", ");
            }
            ctx.col_with_table(&table.name, col);
        }
    }

    if !sel.order_by.is_empty() {
        ctx.push(" ORDER BY ");
        for (i, (col, dir)) in sel.order_by.iter().enumerate() {
            if i != 0 {
                ctx.push(", ");
            }
            ctx.col_with_table(&table.name, col);
            ctx.push(" ");
            ctx.push(order_sql(*dir));
        }
    }

    render_paging(ctx, sel);

    ctx.push(")");
    ctx.push(" AS \"");
    ctx.push(&sel.table);
    ctx.push("_");
    ctx.push_num(sel.id);
    ctx.push("\"");
    Ok(())
}

fn render_join_table(ctx: &mut Ctx, sel: &Select) -> Result<()> {
    let parent = &ctx.qc.selects[sel.parent.expect("child select has a parent")];
    let rel = ctx
        .schema
        .get_rel(&sel.table, &parent.table, sel.via.as_deref())?;
    let RelKind::OneToManyThrough {
        through,
        through_remote,
        ..
    } = &rel.kind
    else {
        return Ok(());
    };

    ctx.push(" LEFT OUTER JOIN ");
    ctx.quoted(through);
    ctx.push(" ON ((");
    ctx.col_with_table(through, through_remote);
    ctx.push(") = (");
    ctx.col_with_table_id(&parent.table, parent.id, &rel.col_remote);
    ctx.push("))");
    Ok(())
}

fn render_relationship(ctx: &mut Ctx, sel: &Select) -> Result<()> {
    let parent = &ctx.qc.selects[sel.parent.expect("child select has a parent")];
    let rel = ctx
        .schema
        .get_rel(&sel.table, &parent.table, sel.via.as_deref())?;

    match &rel.kind {
        RelKind::BelongsTo | RelKind::OneToMany => {
            ctx.push("((");
            ctx.col_with_table(&sel.table, &rel.col_local);
            ctx.push(") = (");
            ctx.col_with_table_id(&parent.table, parent.id, &rel.col_remote);
            ctx.push("))");
        }
        RelKind::OneToManyThrough {
            through,
            through_local,
            ..
        } => {
            ctx.push("((");
            ctx.col_with_table(&sel.table, &rel.col_local);
            ctx.push(") = (");
            ctx.col_with_table(through, through_local);
            ctx.push("))");
        }
        RelKind::Remote(_) => {
            return Err(Error::RemoteJoinFailed(format!(
                "remote select {} reached the SQL renderer",
                sel.field_name
            )))
        }
    }
    Ok(())
}

/// The keyset test `(($N) :: text IS NULL OR ROW(keys) > ROW(decoded))`
/// against the bound cursor. A NULL cursor selects the first page.
fn render_cursor_predicate(ctx: &mut Ctx, sel: &Select, table: &Table) -> Result<()> {
    let dir = sel.paging.cursor.expect("caller checked");
    if sel.order_by.is_empty() {
        return Err(Error::Config(format!(
            "cursor paging on {} needs an ordering or a primary key",
            sel.table
        )));
    }

    ctx.push("(((");
    ctx.param("cursor", "text");
    ctx.push(") :: text IS NULL) OR (ROW(");
    for (i, (col, _)) in sel.order_by.iter().enumerate() {
        if i != 0 {
            ctx.push(", ");
        }
        ctx.col_with_table(&table.name, col);
    }

    // Direction of the first key decides the comparator; `before` flips it.
    let descending = sel.order_by[0].1.descending();
    let forward = matches!(dir, CursorDir::Forward);
    ctx.push(if forward != descending { ") > ROW(" } else { ") < ROW(" });

    for (i, (col, _)) in sel.order_by.iter().enumerate() {
        if i != 0 {
            ctx.push(", ");
        }
        let sql_type = table
            .column(col)
            .map(|c| cast_type(&c.sql_type))
            .unwrap_or("text");
        ctx.push("(split_part(");
        ctx.param("cursor", "text");
        ctx.push(", ',', ");
        ctx.push_num(i + 1);
        ctx.push(")) :: ");
        ctx.push(sql_type);
    }
    ctx.push(")))");
    Ok(())
}

fn render_search_arg(ctx: &mut Ctx, sel: &Select) -> Result<()> {
    match &sel.search {
        Some(crate::qcode::Operand::Var(name)) => ctx.param(name, "text"),
        Some(crate::qcode::Operand::Scalar(Scalar::Str(q))) => {
            ctx.push("'");
            ctx.push(&escape_str(q));
            ctx.push("'");
        }
        other => {
            return Err(Error::parse(format!(
                "search argument must be a string or variable, got {other:?}"
            )))
        }
    }
    Ok(())
}

fn render_order_by_aliases(ctx: &mut Ctx, sel: &Select) {
    ctx.push(" ORDER BY ");
    for (i, (col, dir)) in sel.order_by.iter().enumerate() {
        if i != 0 {
            ctx.push(", ");
        }
        ctx.table_id_col_suffix(&sel.table, sel.id, col, "_ob");
        ctx.push(" ");
        ctx.push(order_sql(*dir));
    }
}

fn order_sql(dir: OrderDir) -> &'static str {
    match dir {
        OrderDir::Asc => "ASC",
        OrderDir::Desc => "DESC",
        OrderDir::AscNullsFirst => "ASC NULLS FIRST",
        OrderDir::AscNullsLast => "ASC NULLS LAST",
        OrderDir::DescNullsFirst => "DESC NULLS FIRST",
        OrderDir::DescNullsLast => "DESC NULLS LAST",
    }
}

fn render_paging(ctx: &mut Ctx, sel: &Select) {
    if sel.paging.no_limit {
        // Explicit override.
    } else if let Some(limit) = sel.paging.limit {
        ctx.push(" LIMIT ('");
        ctx.push(&limit.to_string());
        ctx.push("') :: integer");
    } else if sel.singular {
        ctx.push(" LIMIT ('1') :: integer");
    }

    if let Some(offset) = sel.paging.offset {
        ctx.push(" OFFSET ('");
        ctx.push(&offset.to_string());
        ctx.push("') :: integer");
    }
}

fn sep(ctx: &mut Ctx, first: &mut bool) {
    if !*first {
        ctx.push(", ");
    }
    *first = false;
}
