//! QCode: the intermediate query code.
//!
//! Lowering turns a parsed (fragment-free) GraphQL operation into a flat,
//! pre-order list of [`Select`]s with filters, ordering, paging and the
//! caller's role already applied. The SQL back end renders QCode without ever
//! looking at the GraphQL document again.

pub mod expr;

use std::collections::HashSet;
use std::sync::Arc;

pub use expr::{ColRef, Expr, ExprOp, Operand, Scalar};

use serde::{Deserialize, Serialize};

use crate::parser::ast::{Field, OpKind, Operation, Selection, Value};
use crate::role::{Op, Roles};
use crate::schema::{RelKind, Schema};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum QKind {
    Query,
    Subscription,
    Insert,
    Update,
    Upsert,
    Delete,
}

impl QKind {
    pub fn is_mutation(&self) -> bool {
        matches!(self, QKind::Insert | QKind::Update | QKind::Upsert | QKind::Delete)
    }

    fn role_op(&self) -> Op {
        match self {
            QKind::Query | QKind::Subscription => Op::Query,
            QKind::Insert | QKind::Upsert => Op::Insert,
            QKind::Update => Op::Update,
            QKind::Delete => Op::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QCode {
    pub kind: QKind,
    pub name: Option<String>,
    pub selects: Vec<Select>,
    /// Indices of selects materialized by remote joins instead of SQL.
    pub remotes: Vec<usize>,
    /// Variable declarations from the operation, for argument binding.
    pub vars: Vec<VarDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub ty: String,
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Col {
    pub name: String,
    pub field_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDir {
    Asc,
    Desc,
    AscNullsFirst,
    AscNullsLast,
    DescNullsFirst,
    DescNullsLast,
}

impl OrderDir {
    pub fn descending(&self) -> bool {
        matches!(
            self,
            OrderDir::Desc | OrderDir::DescNullsFirst | OrderDir::DescNullsLast
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Paging {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// Explicit override: render no LIMIT at all.
    pub no_limit: bool,
    /// Keyset paging: emit a `<field>_cursor` sibling and compare against the
    /// bound `$cursor` value.
    pub cursor: Option<CursorDir>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorDir {
    /// `after:` selects rows past the cursor in order direction.
    Forward,
    /// `before:` selects rows preceding the cursor.
    Backward,
}

/// Why a select renders no SQL of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Skip {
    /// The role has no view of this table; the subtree is silently excluded.
    UserNeeded,
    /// Materialized by the remote-join post-processor.
    Remote,
    /// No relationship links this table to its parent.
    NoRelation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub id: usize,
    pub parent: Option<usize>,
    pub table: String,
    pub field_name: String,
    pub cols: Vec<Col>,
    pub where_: Option<Expr>,
    pub order_by: Vec<(String, OrderDir)>,
    pub distinct_on: Vec<String>,
    pub paging: Paging,
    pub search: Option<Operand>,
    pub children: Vec<usize>,
    pub singular: bool,
    /// Aggregate functions permitted for this select.
    pub functions: bool,
    pub skip: Option<Skip>,
    /// Foreign key pinned by an alias, for ambiguous relationships.
    pub via: Option<String>,
    /// Mutation payload; only ever present on the root select.
    pub mutation: Option<MutationData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationData {
    /// Set when the whole payload arrives as one variable bound as JSON.
    pub var: Option<String>,
    /// Literal column values (unused when `var` is set).
    pub values: Vec<(String, Value)>,
    /// Columns the statement writes, in payload order.
    pub cols: Vec<String>,
    /// Nested `connect` / `disconnect` edges.
    pub connects: Vec<Connect>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connect {
    /// The related table.
    pub table: String,
    /// Foreign-key column: on the mutated table for belongs-to, on the
    /// related table for one-to-many.
    pub fk_col: String,
    /// The column the foreign key references on the other side.
    pub key_col: String,
    /// One-to-many edges mutate the related table in a sibling CTE.
    pub one_to_many: bool,
    pub disconnect: bool,
    /// Filter selecting the row(s) to connect, over the related table.
    pub filter: Expr,
}

/// Aggregate prefixes recognized on column names, longest first so
/// `stddev_samp_` wins over `stddev_`.
const AGG_PREFIXES: &[&str] = &[
    "stddev_samp_",
    "stddev_pop_",
    "var_samp_",
    "variance_",
    "var_pop_",
    "stddev_",
    "count_",
    "avg_",
    "max_",
    "min_",
    "sum_",
];

/// Splits `avg_price` into `("avg", "price")`.
pub fn agg_split(name: &str) -> Option<(&str, &str)> {
    AGG_PREFIXES
        .iter()
        .find(|p| name.starts_with(**p) && name.len() > p.len())
        .map(|p| (&name[..p.len() - 1], &name[p.len()..]))
}

#[derive(Debug, Clone)]
pub struct Options {
    pub default_limit: u32,
    pub disable_functions: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            default_limit: 20,
            disable_functions: false,
        }
    }
}

pub struct Compiler {
    schema: Arc<Schema>,
    roles: Arc<Roles>,
    opts: Options,
}

impl Compiler {
    pub fn new(schema: Arc<Schema>, roles: Arc<Roles>, opts: Options) -> Compiler {
        Compiler {
            schema,
            roles,
            opts,
        }
    }

    /// Lower one operation for one role.
    ///
    /// `vars` is the variables JSON available at compile time (request
    /// variables, or the allow-list item's declared variables); mutations
    /// need it to learn the columns a variable payload writes. `order`
    /// optionally substitutes a discrete value for an `order_by: $var`
    /// argument (allow-list metadata).
    pub fn compile(
        &self,
        op: &Operation,
        role: &str,
        vars: Option<&serde_json::Value>,
        order: Option<(&str, &str)>,
    ) -> Result<QCode> {
        let roots: Vec<&Field> = op
            .selection
            .iter()
            .filter_map(|s| match s {
                Selection::Field(f) => Some(f),
                _ => None,
            })
            .filter(|f| include_field(f))
            .collect();

        let root = match roots.as_slice() {
            [root] => *root,
            [] => return Err(Error::parse("empty selection")),
            _ => {
                return Err(Error::UnsupportedOperation(
                    "multiple root fields are not supported; issue one request per root".into(),
                ))
            }
        };

        let kind = match op.kind {
            OpKind::Query => QKind::Query,
            OpKind::Subscription => QKind::Subscription,
            OpKind::Mutation => mutation_kind(root)?,
        };

        let mut qc = QCode {
            kind,
            name: op.name.clone(),
            selects: Vec::new(),
            remotes: Vec::new(),
            vars: op
                .var_defs
                .iter()
                .map(|v| VarDecl {
                    name: v.name.clone(),
                    ty: v.ty.clone(),
                    default: v.default.as_ref().map(|d| d.to_json()),
                })
                .collect(),
        };

        self.lower_select(root, None, role, vars, order, &mut qc)?;

        if qc.selects.is_empty() || qc.selects[0].skip.is_some() {
            return Err(Error::PermissionDenied(format!(
                "role {role} cannot access {}",
                root.name
            )));
        }

        Ok(qc)
    }

    fn lower_select(
        &self,
        field: &Field,
        parent: Option<usize>,
        role: &str,
        vars: Option<&serde_json::Value>,
        order: Option<(&str, &str)>,
        qc: &mut QCode,
    ) -> Result<()> {
        let id = qc.selects.len();

        // Remote edges resolve against the parent, not the catalog.
        if let Some(pid) = parent {
            let parent_table = qc.selects[pid].table.clone();
            if let Ok(rel) = self.schema.get_rel(&field.name, &parent_table, None) {
                if matches!(rel.kind, RelKind::Remote(_)) {
                    qc.selects.push(remote_select(id, pid, field));
                    qc.selects[pid].children.push(id);
                    qc.remotes.push(id);
                    return Ok(());
                }
            }
        }

        let Some(resolved) = self.schema.resolve_field(&field.name) else {
            if parent.is_none() {
                return Err(Error::UnknownField(field.name.clone()));
            }
            // An unrelated child is dropped, never fatal; this mirrors how
            // unknown scalar columns degrade.
            log::debug!("select {} skipped: no such table or alias", field.name);
            qc.selects.push(skipped_select(id, parent, field, Skip::NoRelation));
            if let Some(pid) = parent {
                qc.selects[pid].children.push(id);
            }
            return Ok(());
        };

        let table = resolved.table.clone();

        // A child table with no edge to its parent renders no SQL; it is
        // excluded the same way an unknown child is.
        if let Some(pid) = parent {
            let parent_table = qc.selects[pid].table.clone();
            match self.schema.get_rel(&table.name, &parent_table, resolved.via) {
                Ok(_) => {}
                Err(err @ Error::AmbiguousRelation { .. }) => return Err(err),
                Err(_) => {
                    log::debug!(
                        "select {} skipped: no relationship with {parent_table}",
                        field.name
                    );
                    qc.selects.push(skipped_select(id, parent, field, Skip::NoRelation));
                    qc.selects[pid].children.push(id);
                    return Ok(());
                }
            }
        }

        let mut singular = resolved.singular;
        if field.directive("object").is_some() {
            singular = true;
        }

        let mut kind_op = qc.kind.role_op();
        if parent.is_some() {
            // Only the mutated root writes; nested selects shape the
            // returned payload.
            kind_op = Op::Query;
        }
        let policy = self.roles.policy(role, &table.name, kind_op);
        if policy.blocked {
            return Err(Error::PermissionDenied(format!(
                "role {role} may not {} {}",
                qc.kind, table.name
            )));
        }
        if policy.skipped {
            log::debug!(
                "select {} skipped: requires $user_id or table not added to {} role",
                field.name,
                role
            );
            qc.selects.push(skipped_select(id, parent, field, Skip::UserNeeded));
            if let Some(pid) = parent {
                qc.selects[pid].children.push(id);
            }
            return Ok(());
        }

        let functions = policy.functions && !self.opts.disable_functions;

        let mut sel = Select {
            id,
            parent,
            table: table.name.clone(),
            field_name: field.output_name().to_string(),
            cols: Vec::new(),
            where_: None,
            order_by: Vec::new(),
            distinct_on: Vec::new(),
            paging: Paging::default(),
            search: None,
            children: Vec::new(),
            singular,
            functions,
            skip: None,
            via: resolved.via.map(|v| v.to_string()),
            mutation: None,
        };

        let mut filters: Vec<Expr> = Vec::new();
        if let Some(role_filter) = &policy.filter {
            filters.push(expr::lower_where(&table, &Value::from_json(role_filter))?);
        }

        let mut payload: Option<Value> = None;
        self.lower_args(field, &table, &mut sel, &mut filters, order, qc.kind, &mut payload)?;

        if let Some(value) = payload {
            sel.mutation = Some(self.lower_mutation(&table, &value, &policy, vars)?);
        }

        // Stable ordering: primary key breaks ties, and keyset paging needs
        // a total order even when the query asked for none.
        if let Some(pk) = &table.primary_col {
            if sel.paging.cursor.is_some() && sel.order_by.is_empty() {
                sel.order_by.push((pk.clone(), OrderDir::Asc));
            } else if !sel.order_by.is_empty() && !sel.order_by.iter().any(|(c, _)| c == pk) {
                sel.order_by.push((pk.clone(), OrderDir::Asc));
            }
        }

        sel.where_ = Expr::and(filters);

        // Selected columns are always gated by read permissions, even on a
        // mutation root (the payload is gated by the write policy above).
        let col_allowed = if kind_op == Op::Query {
            policy.allowed.clone()
        } else {
            self.roles.policy(role, &table.name, Op::Query).allowed
        };

        // Children: scalars become columns, objects become child selects.
        let mut child_fields = Vec::new();
        for child in &field.children {
            let Selection::Field(cf) = child else {
                return Err(Error::parse("unresolved fragment in selection"));
            };
            if !include_field(cf) {
                continue;
            }
            if cf.children.is_empty() {
                self.lower_column(cf, &table, &col_allowed, &mut sel);
            } else {
                child_fields.push(cf);
            }
        }

        qc.selects.push(sel);
        if let Some(pid) = parent {
            qc.selects[pid].children.push(id);
        }

        for cf in child_fields {
            self.lower_select(cf, Some(id), role, vars, order, qc)?;
        }

        Ok(())
    }

    /// Resolve a mutation payload into the columns it writes and any nested
    /// `connect`/`disconnect` edges. Variable payloads are resolved against
    /// the compile-time variables so the column list is fixed per statement;
    /// the values themselves still bind at execution time.
    fn lower_mutation(
        &self,
        table: &crate::schema::Table,
        value: &Value,
        policy: &crate::role::Policy,
        vars: Option<&serde_json::Value>,
    ) -> Result<MutationData> {
        let permitted =
            |col: &str| policy.allowed.as_ref().map(|a| a.contains(col)).unwrap_or(true);

        let (var, fields) = match value {
            Value::Var(name) => {
                let payload = vars.and_then(|v| v.get(name)).ok_or_else(|| {
                    Error::parse(format!(
                        "variable ${name} must be known when compiling this mutation"
                    ))
                })?;
                let Value::Object(fields) = Value::from_json(payload) else {
                    return Err(Error::parse(format!("${name} must hold an object")));
                };
                (Some(name.clone()), fields)
            }
            Value::Object(fields) => (None, fields.clone()),
            other => {
                return Err(Error::parse(format!(
                    "mutation payload must be an object or variable, got {other:?}"
                )))
            }
        };

        let mut data = MutationData {
            var,
            ..Default::default()
        };

        for (key, val) in fields {
            if let Some(connect) = self.lower_connect(table, &key, &val)? {
                data.connects.push(connect);
                continue;
            }
            if !table.has_column(&key) || !permitted(&key) {
                log::debug!("mutation column {}.{} dropped", table.name, key);
                continue;
            }
            data.cols.push(key.clone());
            if data.var.is_none() {
                data.values.push((key, val));
            }
        }

        if data.cols.is_empty() && data.connects.is_empty() {
            return Err(Error::PermissionDenied(format!(
                "no writable columns on {}",
                table.name
            )));
        }
        Ok(data)
    }

    /// `{ user: { connect: { id: 5 } } }` inside a mutation payload.
    fn lower_connect(
        &self,
        table: &crate::schema::Table,
        key: &str,
        value: &Value,
    ) -> Result<Option<Connect>> {
        let Value::Object(inner) = value else {
            return Ok(None);
        };
        let (disconnect, filter_val) = match inner.as_slice() {
            [(k, v)] if k == "connect" => (false, v),
            [(k, v)] if k == "disconnect" => (true, v),
            _ => return Ok(None),
        };

        let related = self
            .schema
            .resolve_field(key)
            .ok_or_else(|| Error::UnknownTable(key.to_string()))?
            .table
            .clone();

        // Belongs-to first: the foreign key lives on the mutated table.
        let (fk_col, key_col, one_to_many) =
            match self.schema.get_rel(&table.name, &related.name, None) {
                Ok(rel) if matches!(rel.kind, RelKind::BelongsTo) => {
                    (rel.col_local.clone(), rel.col_remote.clone(), false)
                }
                Ok(rel) if matches!(rel.kind, RelKind::OneToMany) => {
                    (rel.col_remote.clone(), rel.col_local.clone(), true)
                }
                _ => {
                    return Err(Error::UnknownField(format!(
                        "no connectable relationship between {} and {}",
                        table.name, related.name
                    )))
                }
            };

        Ok(Some(Connect {
            table: related.name.clone(),
            fk_col,
            key_col,
            one_to_many,
            disconnect,
            filter: expr::lower_where(&related, filter_val)?,
        }))
    }

    fn lower_column(
        &self,
        field: &Field,
        table: &crate::schema::Table,
        allowed: &Option<HashSet<String>>,
        sel: &mut Select,
    ) {
        let name = &field.name;
        let permitted = |col: &str| allowed.as_ref().map(|a| a.contains(col)).unwrap_or(true);

        if table.has_column(name) {
            if !permitted(name) {
                log::debug!("column {}.{} dropped for role", table.name, name);
                return;
            }
        } else if let Some((_, col)) = agg_split(name) {
            if !sel.functions || !permitted(col) {
                log::debug!("aggregate {} dropped for role", name);
                return;
            }
        } else if name == "search_rank" || name.starts_with("search_headline_") {
            if sel.search.is_none() {
                return;
            }
        } else if allowed.is_some() {
            // With a column allow-list in force, unknown names are dropped
            // instead of echoed back as placeholders.
            return;
        }

        sel.cols.push(Col {
            name: name.clone(),
            field_name: field.output_name().to_string(),
        });
    }

    fn lower_args(
        &self,
        field: &Field,
        table: &crate::schema::Table,
        sel: &mut Select,
        filters: &mut Vec<Expr>,
        order: Option<(&str, &str)>,
        kind: QKind,
        payload: &mut Option<Value>,
    ) -> Result<()> {
        for (name, value) in &field.args {
            match name.as_str() {
                "id" => {
                    if table.primary_col.is_none() {
                        return Err(Error::Config(format!(
                            "no primary key column defined for {}",
                            table.name
                        )));
                    }
                    filters.push(expr::eq_id(value)?);
                    sel.singular = true;
                }
                "where" => filters.push(expr::lower_where(table, value)?),
                "search" => {
                    if table.tsv_col.is_none() {
                        return Err(Error::Config(format!(
                            "no tsv column defined for {}",
                            table.name
                        )));
                    }
                    filters.push(expr::tsquery(value)?);
                    sel.search = Some(match value {
                        Value::Var(v) => Operand::Var(v.clone()),
                        Value::Str(s) => Operand::Scalar(Scalar::Str(s.clone())),
                        other => {
                            return Err(Error::parse(format!(
                                "search expects a string, got {other:?}"
                            )))
                        }
                    });
                }
                "order_by" => sel.order_by = self.lower_order(table, value, order)?,
                "distinct_on" => {
                    sel.distinct_on = match value {
                        Value::List(items) => items
                            .iter()
                            .map(|v| order_col(table, v))
                            .collect::<Result<_>>()?,
                        one => vec![order_col(table, one)?],
                    }
                }
                "limit" | "first" => match value {
                    Value::Int(n) if *n > 0 => sel.paging.limit = Some(*n as u32),
                    Value::Null => sel.paging.no_limit = true,
                    other => return Err(Error::parse(format!("bad limit: {other:?}"))),
                },
                "offset" => match value {
                    Value::Int(n) if *n >= 0 => sel.paging.offset = Some(*n as u32),
                    other => return Err(Error::parse(format!("bad offset: {other:?}"))),
                },
                "after" => match value {
                    Value::Var(_) => sel.paging.cursor = Some(CursorDir::Forward),
                    other => return Err(Error::parse(format!("after expects a variable, got {other:?}"))),
                },
                "before" => match value {
                    Value::Var(_) => sel.paging.cursor = Some(CursorDir::Backward),
                    other => return Err(Error::parse(format!("before expects a variable, got {other:?}"))),
                },
                "insert" | "update" | "upsert" => {
                    debug_assert!(kind.is_mutation());
                    *payload = Some(value.clone());
                }
                "delete" => {
                    // `delete: true` carries no payload.
                }
                other => {
                    return Err(Error::parse(format!("unknown argument: {other}")));
                }
            }
        }

        // Plural selects get the default page size unless told otherwise.
        if !sel.singular && sel.paging.limit.is_none() && !sel.paging.no_limit {
            sel.paging.limit = Some(self.opts.default_limit);
        }

        Ok(())
    }

    fn lower_order(
        &self,
        table: &crate::schema::Table,
        value: &Value,
        order: Option<(&str, &str)>,
    ) -> Result<Vec<(String, OrderDir)>> {
        let value = match value {
            Value::Var(name) => match order {
                Some((var, chosen)) if var == name => {
                    let json: serde_json::Value = serde_json::from_str(chosen)
                        .map_err(|e| Error::Config(format!("bad order value {chosen}: {e}")))?;
                    return self.lower_order(table, &Value::from_json(&json), None);
                }
                _ => {
                    return Err(Error::parse(format!(
                        "order_by variable ${name} has no value; declare it in the \
                         allow-list order metadata"
                    )))
                }
            },
            other => other,
        };

        let Value::Object(fields) = value else {
            return Err(Error::parse("order_by must be an object"));
        };

        fields
            .iter()
            .map(|(col, dir)| {
                if !table.has_column(col) {
                    return Err(Error::UnknownField(format!(
                        "{} has no column {col}",
                        table.name
                    )));
                }
                let dir = match dir.as_str() {
                    Some("asc") => OrderDir::Asc,
                    Some("desc") => OrderDir::Desc,
                    Some("asc_nulls_first") => OrderDir::AscNullsFirst,
                    Some("asc_nulls_last") => OrderDir::AscNullsLast,
                    Some("desc_nulls_first") => OrderDir::DescNullsFirst,
                    Some("desc_nulls_last") => OrderDir::DescNullsLast,
                    _ => return Err(Error::parse(format!("bad order direction on {col}"))),
                };
                Ok((col.clone(), dir))
            })
            .collect()
    }
}

fn mutation_kind(root: &Field) -> Result<QKind> {
    for (arg, _) in &root.args {
        match arg.as_str() {
            "insert" => return Ok(QKind::Insert),
            "update" => return Ok(QKind::Update),
            "upsert" => return Ok(QKind::Upsert),
            "delete" => return Ok(QKind::Delete),
            _ => {}
        }
    }
    Err(Error::parse(
        "mutation needs an insert, update, upsert or delete argument",
    ))
}

fn remote_select(id: usize, parent: usize, field: &Field) -> Select {
    Select {
        id,
        parent: Some(parent),
        table: field.name.clone(),
        field_name: field.output_name().to_string(),
        cols: Vec::new(),
        where_: None,
        order_by: Vec::new(),
        distinct_on: Vec::new(),
        paging: Paging::default(),
        search: None,
        children: Vec::new(),
        singular: true,
        functions: false,
        skip: Some(Skip::Remote),
        via: None,
        mutation: None,
    }
}

fn skipped_select(id: usize, parent: Option<usize>, field: &Field, why: Skip) -> Select {
    Select {
        id,
        parent,
        table: field.name.clone(),
        field_name: field.output_name().to_string(),
        cols: Vec::new(),
        where_: None,
        order_by: Vec::new(),
        distinct_on: Vec::new(),
        paging: Paging::default(),
        search: None,
        children: Vec::new(),
        singular: false,
        functions: false,
        skip: Some(why),
        via: None,
        mutation: None,
    }
}

fn order_col(table: &crate::schema::Table, value: &Value) -> Result<String> {
    let name = value
        .as_str()
        .ok_or_else(|| Error::parse("distinct_on expects column names"))?;
    if !table.has_column(name) {
        return Err(Error::UnknownField(format!(
            "{} has no column {name}",
            table.name
        )));
    }
    Ok(name.to_string())
}

/// Applies `@skip(if:)` / `@include(if:)` with literal conditions.
fn include_field(field: &Field) -> bool {
    if let Some(d) = field.directive("skip") {
        if matches!(d.args.first(), Some((n, Value::Bool(true))) if n == "if") {
            return false;
        }
    }
    if let Some(d) = field.directive("include") {
        if matches!(d.args.first(), Some((n, Value::Bool(false))) if n == "if") {
            return false;
        }
    }
    true
}
