//! Where-clause rendering.
//!
//! A work-stack traversal mirrors the lowered tree without recursion: logical
//! nodes push their children interleaved with the operator text, leaves render
//! in place.

use crate::qcode::{ColRef, Expr, ExprOp, Operand, Scalar};
use crate::schema::Table;
use crate::{Error, Result};

use super::{escape_str, Ctx};

enum Frame<'a> {
    Expr(&'a Expr),
    Text(&'static str),
}

/// Render a filter tree. `qualifier` prefixes plain column references; it is
/// the select's table (base selects reference the raw table, not the aliased
/// subquery).
pub(super) fn render_where(ctx: &mut Ctx, qualifier: &str, table: &Table, expr: &Expr) -> Result<()> {
    let mut stack = vec![Frame::Expr(expr)];

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Text(t) => ctx.push(t),
            Frame::Expr(Expr::And(children)) => {
                push_logical(ctx, &mut stack, children, " AND ");
            }
            Frame::Expr(Expr::Or(children)) => {
                push_logical(ctx, &mut stack, children, " OR ");
            }
            Frame::Expr(Expr::Not(inner)) => {
                stack.push(Frame::Expr(inner));
                stack.push(Frame::Text("NOT "));
            }
            Frame::Expr(Expr::Op { col, op, val }) => {
                render_op(ctx, qualifier, table, col, *op, val)?;
            }
        }
    }

    Ok(())
}

fn push_logical<'a>(
    ctx: &mut Ctx,
    stack: &mut Vec<Frame<'a>>,
    children: &'a [Expr],
    joiner: &'static str,
) {
    ctx.push("(");
    stack.push(Frame::Text(")"));
    for (i, child) in children.iter().enumerate().rev() {
        stack.push(Frame::Expr(child));
        if i > 0 {
            stack.push(Frame::Text(joiner));
        }
    }
}

fn render_op(
    ctx: &mut Ctx,
    qualifier: &str,
    table: &Table,
    col: &ColRef,
    op: ExprOp,
    val: &Operand,
) -> Result<()> {
    // Column prefix. `eq_id` and `tsquery` reference catalog columns the
    // query never named, so they open their own parenthesis.
    match op {
        ExprOp::EqId => {
            let pk = table.primary_col.as_deref().ok_or_else(|| {
                Error::Config(format!("no primary key column defined for {}", table.name))
            })?;
            ctx.push("((");
            ctx.col_with_table(&table.name, pk);
            ctx.push(") =");
            render_val(ctx, table, pk, val)?;
            ctx.push(")");
            return Ok(());
        }
        ExprOp::TsQuery => {
            let tsv = table.tsv_col.as_deref().ok_or_else(|| {
                Error::Config(format!("no tsv column defined for {}", table.name))
            })?;
            ctx.push("((\"");
            ctx.push(tsv);
            ctx.push("\") @@ to_tsquery(");
            render_tsquery_arg(ctx, val)?;
            ctx.push("))");
            return Ok(());
        }
        _ => {}
    }

    if col.nested {
        ctx.push("((\"");
        ctx.push(&col.col);
        ctx.push("\") ");
    } else {
        ctx.push("((");
        ctx.col_with_table(qualifier, &col.col);
        ctx.push(") ");
    }

    if op == ExprOp::IsNull {
        let truthy = matches!(val, Operand::Scalar(Scalar::Bool(true)))
            || matches!(val, Operand::Scalar(Scalar::Str(s)) if s.eq_ignore_ascii_case("true"));
        ctx.push(if truthy { "IS NULL)" } else { "IS NOT NULL)" });
        return Ok(());
    }

    ctx.push(sql_op(op));
    render_val(ctx, table, &col.col, val)?;
    ctx.push(")");
    Ok(())
}

fn sql_op(op: ExprOp) -> &'static str {
    use ExprOp::*;
    match op {
        Eq => "=",
        Neq => "!=",
        Gte => ">=",
        Lte => "<=",
        Gt => ">",
        Lt => "<",
        In => "IN",
        NotIn => "NOT IN",
        Like => "LIKE",
        NotLike => "NOT LIKE",
        ILike => "ILIKE",
        NotILike => "NOT ILIKE",
        Similar => "SIMILAR TO",
        NotSimilar => "NOT SIMILAR TO",
        Contains => "@>",
        ContainedIn => "<@",
        HasKey => "?",
        HasKeyAny => "?|",
        HasKeyAll => "?&",
        // Handled before the table arm.
        IsNull | EqId | TsQuery => unreachable!("rendered separately"),
    }
}

fn render_val(ctx: &mut Ctx, table: &Table, col: &str, val: &Operand) -> Result<()> {
    ctx.push(" ");
    match val {
        Operand::Var(name) => {
            let sql_type = table
                .column(col)
                .map(|c| c.sql_type.clone())
                .unwrap_or_else(|| "text".to_string());
            ctx.param(name, &sql_type);
        }
        Operand::Scalar(s) => render_scalar(ctx, s),
        Operand::List(items) => {
            ctx.push("(");
            for (i, item) in items.iter().enumerate() {
                if i != 0 {
                    ctx.push(", ");
                }
                render_scalar(ctx, item);
            }
            ctx.push(")");
        }
    }
    Ok(())
}

fn render_scalar(ctx: &mut Ctx, s: &Scalar) {
    match s {
        Scalar::Null => ctx.push("null"),
        Scalar::Bool(b) => ctx.push(if *b { "true" } else { "false" }),
        Scalar::Int(i) => ctx.push(&i.to_string()),
        Scalar::Float(f) => ctx.push(&escape_str(f)),
        Scalar::Str(v) => {
            ctx.push("'");
            ctx.push(&escape_str(v));
            ctx.push("'");
        }
    }
}

fn render_tsquery_arg(ctx: &mut Ctx, val: &Operand) -> Result<()> {
    match val {
        Operand::Var(name) => ctx.param(name, "text"),
        Operand::Scalar(Scalar::Str(q)) => {
            ctx.push("'");
            ctx.push(&escape_str(q));
            ctx.push("'");
        }
        other => {
            return Err(Error::parse(format!(
                "search expects a string or variable, got {other:?}"
            )))
        }
    }
    Ok(())
}
