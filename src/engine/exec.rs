//! Per-request execution: role resolution, compiled-query lookup, argument
//! binding, the single round trip, and the remote-join post-pass.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{query_key, query_key_ordered, Context, Core, ErrorMessage, QueryComp, ReqConfig, Response};
use crate::allow::ApqEntry;
use crate::db::{Connection, Param};
use crate::parser::ast::OpKind;
use crate::schema::RelKind;
use crate::{Error, Result};

pub(crate) struct QueryOutcome {
    pub comp: Arc<QueryComp>,
    pub role: String,
    /// The shaped JSON document, absent when the statement matched nothing.
    pub data: Option<String>,
}

impl Core {
    pub(crate) async fn graphql(
        self: &Arc<Self>,
        ctx: &Context,
        query: &str,
        vars: Option<serde_json::Value>,
        rc: Option<ReqConfig>,
    ) -> Response {
        let mut query = query.to_string();
        let (op, name);

        // Hash-only requests resolve through the APQ cache first.
        let apq_key = rc.as_ref().and_then(|rc| rc.apq_key.clone());
        if let (Some(key), true) = (&apq_key, query.is_empty()) {
            match self.apq.get(key).await {
                Some(entry) => {
                    op = entry.op;
                    name = entry.name;
                    query = entry.query;
                }
                None => {
                    return Response::new(OpKind::Query, "")
                        .with_error(&Error::PersistedQueryNotFound);
                }
            }
        } else {
            let (k, n) = crate::parser::operation(&query);
            op = k;
            name = n.to_string();
        }

        let started = std::time::Instant::now();
        let mut res = Response::new(op, &name);

        if op == OpKind::Subscription {
            return res.with_error(&Error::UnsupportedOperation(
                "use subscribe() for subscriptions".into(),
            ));
        }
        if op == OpKind::Mutation && !self.dialect.supports_mutations() {
            return res.with_error(&Error::UnsupportedOperation(format!(
                "{}: mutations not supported",
                self.dialect
            )));
        }

        match self.exec_query(ctx, op, &name, &query, vars.as_ref(), rc.as_ref()).await {
            Ok(outcome) => {
                res.role = outcome.role.clone();
                res.sql = outcome.comp.sql.clone();
                res.cache_control = outcome.comp.md.cache_control.clone();

                if let (Some(key), false) = (&apq_key, query.is_empty()) {
                    self.apq
                        .set(
                            key,
                            ApqEntry {
                                op,
                                name: name.clone(),
                                query: query.clone(),
                            },
                        )
                        .await;
                }

                match self.finish_document(&outcome, &mut res.errors).await {
                    Ok(data) => {
                        res.data = data.and_then(|d| {
                            serde_json::value::RawValue::from_string(d).ok()
                        });
                    }
                    Err(err) => return res.with_error(&err),
                }
            }
            Err(err) => return res.with_error(&err),
        }

        if self.conf.enable_tracing {
            res.extensions = Some(super::Extensions {
                tracing: super::Tracing {
                    version: 1,
                    duration_ns: started.elapsed().as_nanos(),
                },
            });
        }

        res
    }

    /// Compile (or look up) and run the statement for this request.
    pub(crate) async fn exec_query(
        &self,
        ctx: &Context,
        op: OpKind,
        name: &str,
        query: &str,
        vars: Option<&serde_json::Value>,
        rc: Option<&ReqConfig>,
    ) -> Result<QueryOutcome> {
        let mut conn = self.pool.acquire().await?;

        if self.conf.set_user_id {
            self.set_local_user_id(ctx, conn.as_mut()).await?;
        }

        let role = self.resolve_role(ctx, Some(conn.as_mut())).await?;
        let comp = self.resolve_comp(op, name, query, vars, &role)?;

        let args = self.bind_args(&comp, ctx, vars, rc, None)?;
        let rows = conn.query(&comp.sql, &args).await?;

        let data = match rows.first_value() {
            Some(bytes) => Some(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| Error::Execution(format!("non-utf8 result: {e}")))?,
            ),
            None => None,
        };

        let singular_root = comp.qcode.selects[0].singular;
        if data.is_none() && singular_root {
            return Err(Error::NoRows);
        }

        if self.conf.debug {
            for sel in &comp.qcode.selects {
                if sel.skip == Some(crate::qcode::Skip::UserNeeded) {
                    debug!(
                        field = %sel.field_name,
                        "field skipped: requires $user_id or table not added to role"
                    );
                }
            }
        }

        Ok(QueryOutcome { comp, role, data })
    }

    /// Cursor signing and remote joins; both decode the document at most
    /// once, and only when the compiled query calls for them.
    async fn finish_document(
        &self,
        outcome: &QueryOutcome,
        errors: &mut Vec<ErrorMessage>,
    ) -> Result<Option<String>> {
        let Some(data) = &outcome.data else {
            return Ok(None);
        };
        let comp = &outcome.comp;

        if comp.md.cursor_field.is_none() && comp.qcode.remotes.is_empty() {
            return Ok(Some(data.clone()));
        }

        let mut doc: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| Error::Execution(format!("malformed result document: {e}")))?;

        if let Some(field) = &comp.md.cursor_field {
            if let Some(obj) = doc.as_object_mut() {
                let token = obj
                    .get(field)
                    .and_then(|v| v.as_str())
                    .map(|raw| self.cursor.encode(raw));
                match token {
                    Some(token) => {
                        obj.insert(field.clone(), serde_json::Value::String(token));
                    }
                    None => {
                        obj.insert(field.clone(), serde_json::Value::Null);
                    }
                }
            }
        }

        if !comp.qcode.remotes.is_empty() {
            self.remote_joins(comp, &mut doc, errors).await;
        }

        Ok(Some(doc.to_string()))
    }

    /// Effective role: explicit override, then the ABAC probe, then the
    /// static heuristic.
    pub(crate) async fn resolve_role(
        &self,
        ctx: &Context,
        conn: Option<&mut dyn Connection>,
    ) -> Result<String> {
        if let Some(role) = &ctx.user_role {
            return Ok(role.clone());
        }
        if !self.abac || ctx.user_id.is_none() {
            return Ok(crate::role::static_role(ctx.user_id.is_some()).to_string());
        }

        let (stmt, md) = self.role_stmt.as_ref().expect("abac implies role_stmt");
        let args = self.context_args(md, ctx)?;

        let rows = match conn {
            Some(conn) => conn.query(stmt, &args).await?,
            None => {
                let mut conn = self.pool.acquire().await?;
                conn.query(stmt, &args).await?
            }
        };

        match rows.first_value() {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| Error::Execution(format!("bad role value: {e}"))),
            None => Ok("anon".to_string()),
        }
    }

    pub(crate) fn resolve_comp(
        &self,
        op: OpKind,
        name: &str,
        query: &str,
        vars: Option<&serde_json::Value>,
        role: &str,
    ) -> Result<Arc<QueryComp>> {
        if self.allow_active {
            let base = self
                .queries
                .get(&query_key(name, role))
                .ok_or_else(|| {
                    Error::PermissionDenied(format!("query not found in allow list: {name}"))
                })?
                .clone();

            // Order metadata: the request's value for the declared variable
            // selects a sibling compile.
            if let Some(var) = &base.order_var {
                if let Some(value) = vars.and_then(|v| v.get(var)) {
                    let value_text = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    if let Some(comp) =
                        self.queries.get(&query_key_ordered(name, role, &value_text))
                    {
                        return Ok(comp.clone());
                    }
                }
            }
            return Ok(base);
        }

        // Development path: compile on the fly.
        let doc = crate::parser::parse_with_fragments(query, self.fragments.as_ref())?;
        let operation = doc
            .operations
            .iter()
            .find(|o| o.kind == op)
            .or_else(|| doc.operations.first())
            .ok_or_else(|| Error::parse("no operation in document"))?;
        let qcode = self.qc.compile(operation, role, vars, None)?;
        let (sql, md) = self.pc.compile(&qcode, &self.schema)?;
        Ok(Arc::new(QueryComp {
            qcode,
            sql,
            md,
            order_var: None,
        }))
    }

    /// Walk the metadata parameter list and build the positional argument
    /// vector: context values first, then request variables, then declared
    /// defaults.
    pub(crate) fn bind_args(
        &self,
        comp: &QueryComp,
        ctx: &Context,
        vars: Option<&serde_json::Value>,
        rc: Option<&ReqConfig>,
        cursor_override: Option<&str>,
    ) -> Result<Vec<Param>> {
        let mut args = Vec::with_capacity(comp.md.params.len());
        for p in &comp.md.params {
            let value = match p.name.as_str() {
                "user_id" => ctx.user_id.as_ref().map(Param::from_json),
                "user_id_provider" => ctx
                    .user_id_provider
                    .as_ref()
                    .map(|v| Param::Text(v.clone())),
                "user_id_raw" => ctx.user_id_raw.as_ref().map(|v| Param::Text(v.clone())),
                "cursor" => Some(self.cursor_param(vars, cursor_override)?),
                name => self.lookup_var(comp, name, vars, rc),
            };
            match value {
                Some(v) => args.push(v),
                None => {
                    return Err(Error::parse(format!("variable ${} not provided", p.name)))
                }
            }
        }
        Ok(args)
    }

    fn cursor_param(
        &self,
        vars: Option<&serde_json::Value>,
        cursor_override: Option<&str>,
    ) -> Result<Param> {
        if let Some(raw) = cursor_override {
            return Ok(Param::Text(raw.to_string()));
        }
        match vars.and_then(|v| v.get("cursor")) {
            None | Some(serde_json::Value::Null) => Ok(Param::Null),
            Some(serde_json::Value::String(token)) => {
                Ok(Param::Text(self.cursor.decode(token)?))
            }
            Some(other) => Ok(Param::Text(other.to_string())),
        }
    }

    fn lookup_var(
        &self,
        comp: &QueryComp,
        name: &str,
        vars: Option<&serde_json::Value>,
        rc: Option<&ReqConfig>,
    ) -> Option<Param> {
        if let Some(v) = vars.and_then(|v| v.get(name)) {
            return Some(Param::from_json(v));
        }
        if let Some(v) = rc.and_then(|rc| rc.vars.as_ref()).and_then(|m| m.get(name)) {
            return Some(Param::from_json(v));
        }
        comp.qcode
            .vars
            .iter()
            .find(|d| d.name == name)
            .and_then(|d| d.default.as_ref())
            .map(Param::from_json)
    }

    fn context_args(&self, md: &crate::sql::Metadata, ctx: &Context) -> Result<Vec<Param>> {
        md.params
            .iter()
            .map(|p| match p.name.as_str() {
                "user_id" => ctx
                    .user_id
                    .as_ref()
                    .map(Param::from_json)
                    .ok_or_else(|| Error::parse("variable $user_id not provided")),
                "user_id_provider" => Ok(ctx
                    .user_id_provider
                    .clone()
                    .map(Param::Text)
                    .unwrap_or(Param::Null)),
                "user_id_raw" => Ok(ctx
                    .user_id_raw
                    .clone()
                    .map(Param::Text)
                    .unwrap_or(Param::Null)),
                other => Err(Error::Config(format!(
                    "roles_query references unknown variable ${other}"
                ))),
            })
            .collect()
    }

    async fn set_local_user_id(&self, ctx: &Context, conn: &mut dyn Connection) -> Result<()> {
        let Some(user_id) = &ctx.user_id else {
            return Ok(());
        };
        let sql = match user_id {
            serde_json::Value::String(s) => {
                format!("SET SESSION \"user.id\" = '{}'", crate::sql::escape_str(s))
            }
            serde_json::Value::Number(n) => format!("SET SESSION \"user.id\" = {n}"),
            other => {
                return Err(Error::Config(format!(
                    "unsupported user id type: {other}"
                )))
            }
        };
        conn.exec(&sql, &[]).await?;
        Ok(())
    }

    /// For every remote select: collect the projected keys, call the remote
    /// client, splice the payloads in by path. A failed remote is a
    /// per-field error; the rest of the document survives.
    async fn remote_joins(
        &self,
        comp: &QueryComp,
        doc: &mut serde_json::Value,
        errors: &mut Vec<ErrorMessage>,
    ) {
        for &idx in &comp.qcode.remotes {
            let sel = &comp.qcode.selects[idx];
            if let Err(err) = self.remote_join_one(comp, idx, doc).await {
                warn!(field = %sel.field_name, %err, "remote join failed");
                errors.push(ErrorMessage {
                    message: format!("{}: {err}", sel.field_name),
                });
            }
        }
    }

    async fn remote_join_one(
        &self,
        comp: &QueryComp,
        idx: usize,
        doc: &mut serde_json::Value,
    ) -> Result<()> {
        let client = self
            .remote
            .as_ref()
            .ok_or_else(|| Error::RemoteJoinFailed("no remote client configured".into()))?;

        let sel = &comp.qcode.selects[idx];
        let parent = &comp.qcode.selects[sel.parent.expect("remote select has a parent")];
        let rel = self.schema.get_rel(&sel.table, &parent.table, None)?;
        let RelKind::Remote(info) = &rel.kind else {
            return Err(Error::RemoteJoinFailed(format!(
                "{} is not a remote relationship",
                sel.field_name
            )));
        };
        let key_field = &rel.col_remote;

        // Field path from the envelope down to the parent objects.
        let mut path = Vec::new();
        let mut cur = parent.id;
        loop {
            let s = &comp.qcode.selects[cur];
            path.push(s.field_name.clone());
            match s.parent {
                Some(p) => cur = p,
                None => break,
            }
        }
        path.reverse();

        // Pass one: the keys.
        let mut keys = Vec::new();
        collect_keys(doc, &path, key_field, &mut keys);

        // Pass two: fetch each key once.
        let mut fetched: std::collections::HashMap<String, serde_json::Value> =
            std::collections::HashMap::new();
        for key in &keys {
            if fetched.contains_key(key) {
                continue;
            }
            let url = info.url.replace("$id", key);
            let body = client.fetch(&url).await?;
            let mut value: serde_json::Value = serde_json::from_slice(&body)
                .map_err(|e| Error::RemoteJoinFailed(format!("bad remote payload: {e}")))?;
            for seg in &info.path {
                value = value.get_mut(seg).map(serde_json::Value::take).unwrap_or(
                    serde_json::Value::Null,
                );
            }
            if !info.fields.is_empty() {
                if let serde_json::Value::Object(map) = &mut value {
                    map.retain(|k, _| info.fields.iter().any(|f| f == k));
                }
            }
            fetched.insert(key.clone(), value);
        }

        // Pass three: splice.
        splice(doc, &path, key_field, &sel.field_name, &fetched);
        Ok(())
    }
}

/// Descend `path` (mapping over arrays) and collect `key_field` values.
fn collect_keys(
    node: &serde_json::Value,
    path: &[String],
    key_field: &str,
    out: &mut Vec<String>,
) {
    match node {
        serde_json::Value::Array(items) => {
            for item in items {
                collect_keys(item, path, key_field, out);
            }
        }
        serde_json::Value::Object(map) => match path.split_first() {
            Some((head, rest)) => {
                if let Some(child) = map.get(head) {
                    collect_keys(child, rest, key_field, out);
                }
            }
            None => {
                if let Some(key) = map.get(key_field) {
                    out.push(json_key(key));
                }
            }
        },
        _ => {}
    }
}

fn splice(
    node: &mut serde_json::Value,
    path: &[String],
    key_field: &str,
    field_name: &str,
    fetched: &std::collections::HashMap<String, serde_json::Value>,
) {
    match node {
        serde_json::Value::Array(items) => {
            for item in items {
                splice(item, path, key_field, field_name, fetched);
            }
        }
        serde_json::Value::Object(map) => match path.split_first() {
            Some((head, rest)) => {
                if let Some(child) = map.get_mut(head) {
                    splice(child, rest, key_field, field_name, fetched);
                }
            }
            None => {
                if let Some(key) = map.remove(key_field) {
                    let value = fetched
                        .get(&json_key(&key))
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    map.insert(field_name.to_string(), value);
                }
            }
        },
        _ => {}
    }
}

fn json_key(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
