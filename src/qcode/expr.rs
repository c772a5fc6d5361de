//! Filter-expression tree and the lowering of `where` arguments into it.

use serde::{Deserialize, Serialize};

use crate::parser::ast::Value;
use crate::schema::Table;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Op {
        col: ColRef,
        op: ExprOp,
        val: Operand,
    },
}

/// Column reference inside a filter. `nested` marks a column addressed
/// through a nested path; it renders bare, without a table qualifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColRef {
    pub col: String,
    pub nested: bool,
}

impl ColRef {
    fn plain(col: &str) -> ColRef {
        ColRef {
            col: col.to_string(),
            nested: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
    Like,
    NotLike,
    ILike,
    NotILike,
    Similar,
    NotSimilar,
    Contains,
    ContainedIn,
    HasKey,
    HasKeyAny,
    HasKeyAll,
    IsNull,
    /// Compares the table's primary-key column; the column reference is
    /// filled in by the renderer.
    EqId,
    /// Full-text match against the table's tsvector column.
    TsQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Scalar(Scalar),
    List(Vec<Scalar>),
    /// Named variable, bound positionally at execution time.
    Var(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    /// Kept as source text; it is only ever written back out.
    Float(String),
    Str(String),
}

impl Expr {
    /// Conjunction that flattens nested `And`s and drops the wrapper for a
    /// single clause.
    pub fn and(mut exprs: Vec<Expr>) -> Option<Expr> {
        match exprs.len() {
            0 => None,
            1 => Some(exprs.remove(0)),
            _ => Some(Expr::And(exprs)),
        }
    }
}

/// Lower a `where:` argument value against `table`.
pub fn lower_where(table: &Table, value: &Value) -> Result<Expr> {
    let Value::Object(fields) = value else {
        return Err(Error::parse(format!(
            "where on {} must be an object",
            table.name
        )));
    };
    let clauses = fields
        .iter()
        .map(|(key, val)| lower_clause(table, key, val))
        .collect::<Result<Vec<_>>>()?;
    Expr::and(clauses).ok_or_else(|| Error::parse("empty where clause"))
}

fn lower_clause(table: &Table, key: &str, value: &Value) -> Result<Expr> {
    match key {
        "and" | "or" => {
            let children = match value {
                Value::List(items) => items
                    .iter()
                    .map(|v| lower_where(table, v))
                    .collect::<Result<Vec<_>>>()?,
                Value::Object(fields) => fields
                    .iter()
                    .map(|(k, v)| lower_clause(table, k, v))
                    .collect::<Result<Vec<_>>>()?,
                _ => return Err(Error::parse(format!("{key} expects a list or object"))),
            };
            Ok(if key == "and" {
                Expr::And(children)
            } else {
                Expr::Or(children)
            })
        }
        "not" => Ok(Expr::Not(Box::new(lower_where(table, value)?))),
        _ => lower_column(table, key, value, false),
    }
}

fn lower_column(table: &Table, col: &str, value: &Value, nested: bool) -> Result<Expr> {
    if !nested && !table.has_column(col) {
        // A key that is not a column introduces a nested path; every leaf
        // below it references its column bare.
        if let Value::Object(fields) = value {
            let clauses = fields
                .iter()
                .map(|(k, v)| lower_column(table, k, v, true))
                .collect::<Result<Vec<_>>>()?;
            return Expr::and(clauses)
                .ok_or_else(|| Error::parse(format!("empty nested filter under {col}")));
        }
        return Err(Error::UnknownField(format!(
            "{} has no column {col}",
            table.name
        )));
    }

    let col_ref = ColRef {
        col: col.to_string(),
        nested,
    };

    match value {
        Value::Object(ops) => {
            let clauses = ops
                .iter()
                .map(|(op_name, op_val)| {
                    let op = parse_op(op_name)?;
                    Ok(Expr::Op {
                        col: col_ref.clone(),
                        op,
                        val: lower_operand(op, op_val)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Expr::and(clauses).ok_or_else(|| Error::parse(format!("empty filter on {col}")))
        }
        // Scalar shorthand: `{ id: 3 }` means equality.
        other => Ok(Expr::Op {
            col: col_ref,
            op: ExprOp::Eq,
            val: lower_operand(ExprOp::Eq, other)?,
        }),
    }
}

/// `id:` argument shorthand on a singular field.
pub fn eq_id(value: &Value) -> Result<Expr> {
    Ok(Expr::Op {
        col: ColRef::plain(""),
        op: ExprOp::EqId,
        val: lower_operand(ExprOp::EqId, value)?,
    })
}

/// `search:` argument.
pub fn tsquery(value: &Value) -> Result<Expr> {
    Ok(Expr::Op {
        col: ColRef::plain(""),
        op: ExprOp::TsQuery,
        val: lower_operand(ExprOp::TsQuery, value)?,
    })
}

fn parse_op(name: &str) -> Result<ExprOp> {
    use ExprOp::*;
    Ok(match name {
        "eq" | "equals" => Eq,
        "neq" | "not_equals" => Neq,
        "gt" | "greater_than" => Gt,
        "lt" | "lesser_than" => Lt,
        "gte" | "greater_or_equals" => Gte,
        "lte" | "lesser_or_equals" => Lte,
        "in" => In,
        "nin" | "not_in" => NotIn,
        "like" => Like,
        "nlike" | "not_like" => NotLike,
        "ilike" => ILike,
        "nilike" | "not_ilike" => NotILike,
        "similar" => Similar,
        "nsimilar" | "not_similar" => NotSimilar,
        "contains" => Contains,
        "contained_in" => ContainedIn,
        "has_key" => HasKey,
        "has_key_any" => HasKeyAny,
        "has_key_all" => HasKeyAll,
        "is_null" => IsNull,
        other => return Err(Error::parse(format!("unknown filter operator: {other}"))),
    })
}

fn lower_operand(op: ExprOp, value: &Value) -> Result<Operand> {
    match value {
        Value::Var(name) => Ok(Operand::Var(name.clone())),
        Value::List(items) => {
            let scalars = items
                .iter()
                .map(lower_scalar)
                .collect::<Result<Vec<_>>>()?;
            Ok(Operand::List(scalars))
        }
        other => {
            if matches!(op, ExprOp::In | ExprOp::NotIn) {
                return Err(Error::parse("in/not_in expect a list or variable"));
            }
            Ok(Operand::Scalar(lower_scalar(other)?))
        }
    }
}

fn lower_scalar(value: &Value) -> Result<Scalar> {
    Ok(match value {
        Value::Null => Scalar::Null,
        Value::Bool(b) => Scalar::Bool(*b),
        Value::Int(i) => Scalar::Int(*i),
        Value::Float(f) => Scalar::Float(f.to_string()),
        Value::Str(s) | Value::Enum(s) => Scalar::Str(s.clone()),
        other => return Err(Error::parse(format!("unsupported filter value: {other:?}"))),
    })
}
