//! The engine: compiled-query cache, role resolution and request execution.
//!
//! An [`Engine`] wraps an immutable [`Core`] behind an atomic slot. `reload`
//! builds a fresh core (re-introspecting the database and recompiling the
//! allow-list) and swaps it in; requests in flight keep their own strong
//! reference, so they observe either the old core or the new one, never a
//! mix.

mod exec;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::allow::{ApqCache, ApqEntry, List};
use crate::config::Config;
use crate::cursor::CursorCodec;
use crate::db::{Pool, RemoteClient};
use crate::parser::ast::OpKind;
use crate::parser::FragmentFetcher;
use crate::qcode::{self, QCode};
use crate::role::Roles;
use crate::schema::{DbInfo, Schema};
use crate::sql::{self, Dialect, Metadata};
use crate::subs::SubHub;
use crate::{Error, Result};

/// Per-request caller identity, carried explicitly rather than through an
/// ambient context.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Authenticated user id; its presence selects the `user` fallback role.
    pub user_id: Option<serde_json::Value>,
    /// Authentication provider name (google, github, …).
    pub user_id_provider: Option<String>,
    /// The raw token subject, before provider mapping.
    pub user_id_raw: Option<String>,
    /// Pre-resolved role; skips both ABAC and the static heuristic.
    pub user_role: Option<String>,
}

/// Request-scoped configuration.
#[derive(Debug, Clone, Default)]
pub struct ReqConfig {
    /// Persisted-query hash supplied by the client.
    pub apq_key: Option<String>,
    /// Extra variables merged under the document's own.
    pub vars: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub message: String,
}

/// `extensions` block of the response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Extensions {
    pub tracing: Tracing,
}

/// Request timing, emitted when `Config::enable_tracing` is set.
#[derive(Debug, Clone, Serialize)]
pub struct Tracing {
    pub version: u32,
    pub duration_ns: u128,
}

/// The GraphQL response envelope plus execution facts for the transport
/// (SQL text, resolved role, cache-control).
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// Shaped JSON straight from the database, never reparsed unless a
    /// cursor or remote join had to touch it.
    pub data: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,

    #[serde(skip)]
    op: OpKind,
    #[serde(skip)]
    name: String,
    #[serde(skip)]
    sql: String,
    #[serde(skip)]
    role: String,
    #[serde(skip)]
    cache_control: Option<String>,
}

impl Response {
    pub(crate) fn new(op: OpKind, name: &str) -> Response {
        Response {
            data: None,
            errors: Vec::new(),
            extensions: None,
            op,
            name: name.to_string(),
            sql: String::new(),
            role: String::new(),
            cache_control: None,
        }
    }

    pub(crate) fn with_error(mut self, err: &Error) -> Response {
        self.errors.push(ErrorMessage {
            message: err.to_string(),
        });
        self
    }

    pub(crate) fn set_execution_facts(
        &mut self,
        sql: &str,
        role: &str,
        cache_control: Option<&str>,
    ) {
        self.sql = sql.to_string();
        self.role = role.to_string();
        self.cache_control = cache_control.map(|c| c.to_string());
    }

    pub fn operation(&self) -> OpKind {
        self.op
    }

    pub fn query_name(&self) -> &str {
        &self.name
    }

    /// The SQL statement that produced this response.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The role the statement was compiled for.
    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn cache_control(&self) -> Option<&str> {
        self.cache_control.as_deref()
    }
}

/// One compiled statement: the lowered IR, its SQL and binding metadata.
pub(crate) struct QueryComp {
    pub qcode: QCode,
    pub sql: String,
    pub md: Metadata,
    /// Order-metadata variable whose request value picks a sibling compile.
    pub order_var: Option<String>,
}

pub(crate) struct Core {
    pub conf: Config,
    pub pool: Arc<dyn Pool>,
    pub dialect: Dialect,
    pub schema: Arc<Schema>,
    pub roles: Arc<Roles>,
    pub qc: qcode::Compiler,
    pub pc: sql::Compiler,
    pub fragments: Option<FragmentFetcher>,
    /// When set, only precompiled queries may run.
    pub allow_active: bool,
    pub queries: HashMap<String, Arc<QueryComp>>,
    pub apq: ApqCache,
    pub role_stmt: Option<(String, Metadata)>,
    pub abac: bool,
    pub cursor: CursorCodec,
    pub remote: Option<Arc<dyn RemoteClient>>,
    pub subs: SubHub,
    /// Set in tests to skip live introspection on reload.
    pub static_info: Option<DbInfo>,
}

pub struct Engine {
    inner: ArcSwap<Core>,
}

pub struct EngineBuilder {
    conf: Config,
    pool: Arc<dyn Pool>,
    db_info: Option<DbInfo>,
    remote: Option<Arc<dyn RemoteClient>>,
}

impl EngineBuilder {
    /// Inject a catalog snapshot instead of introspecting the database.
    pub fn db_info(mut self, info: DbInfo) -> Self {
        self.db_info = Some(info);
        self
    }

    pub fn remote_client(mut self, client: Arc<dyn RemoteClient>) -> Self {
        self.remote = Some(client);
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let core = Core::build(self.conf, self.pool, self.db_info, self.remote).await?;
        Ok(Engine {
            inner: ArcSwap::from_pointee(core),
        })
    }
}

impl Engine {
    /// Introspect the database and compile everything up front.
    pub async fn new(conf: Config, pool: Arc<dyn Pool>) -> Result<Engine> {
        Engine::builder(conf, pool).build().await
    }

    pub fn builder(conf: Config, pool: Arc<dyn Pool>) -> EngineBuilder {
        EngineBuilder {
            conf,
            pool,
            db_info: None,
            remote: None,
        }
    }

    /// Execute one GraphQL request. Errors come back inside the envelope;
    /// the `Err` side is reserved for callers that want to branch on the
    /// failure kind as well.
    pub async fn graphql(
        &self,
        ctx: &Context,
        query: &str,
        vars: Option<serde_json::Value>,
        rc: Option<ReqConfig>,
    ) -> Response {
        let core = self.inner.load_full();
        core.graphql(ctx, query, vars, rc).await
    }

    /// Register a subscription; the returned handle yields one [`Response`]
    /// per observed change.
    pub async fn subscribe(
        &self,
        ctx: &Context,
        query: &str,
        vars: Option<serde_json::Value>,
        rc: Option<ReqConfig>,
    ) -> Result<crate::subs::Subscription> {
        let core = self.inner.load_full();
        crate::subs::subscribe(core, ctx, query, vars, rc).await
    }

    /// Rebuild the catalog and every compiled query, then atomically publish
    /// the new core. Concurrent requests never observe a torn state.
    pub async fn reload(&self) -> Result<()> {
        let old = self.inner.load_full();
        let core = Core::build(
            old.conf.clone(),
            old.pool.clone(),
            old.static_info.clone(),
            old.remote.clone(),
        )
        .await?;
        self.inner.store(Arc::new(core));
        Ok(())
    }
}

impl Core {
    pub(crate) async fn build(
        conf: Config,
        pool: Arc<dyn Pool>,
        db_info: Option<DbInfo>,
        remote: Option<Arc<dyn RemoteClient>>,
    ) -> Result<Core> {
        let dialect = Dialect::from_config(conf.db_type.as_deref());

        let static_info = db_info.clone();
        let info = match db_info {
            Some(info) => info,
            None => crate::schema::discover(pool.as_ref(), &conf.blocklist).await?,
        };
        let schema = Arc::new(Schema::new(info, &conf)?);
        let roles = Arc::new(Roles::from_config(&conf));

        let qc = qcode::Compiler::new(
            schema.clone(),
            roles.clone(),
            qcode::Options {
                default_limit: conf.default_limit(),
                disable_functions: conf.disable_functions,
            },
        );
        let pc = sql::Compiler::new(dialect, conf.cache_header.clone());

        let abac = roles.abac_enabled();
        let role_stmt = if abac {
            let roles_query = conf
                .roles_query
                .as_deref()
                .ok_or_else(|| Error::Config("roles_query required when roles match".into()))?;
            Some(sql::render_role_statement(&roles, roles_query)?)
        } else {
            None
        };

        let mut core = Core {
            conf,
            pool,
            dialect,
            schema,
            roles,
            qc,
            pc,
            fragments: None,
            allow_active: false,
            queries: HashMap::new(),
            apq: ApqCache::new(),
            role_stmt,
            abac,
            cursor: CursorCodec::default(),
            remote,
            subs: SubHub::new(),
            static_info,
        };
        core.cursor = CursorCodec::new(core.conf.cursor_secret.as_deref());

        if !core.conf.disable_allow_list {
            core.init_allow_list().await?;
        }

        Ok(core)
    }

    async fn init_allow_list(&mut self) -> Result<()> {
        let dir = self
            .conf
            .allow_list_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("allow-list"));
        let list = List::new(&dir)?;
        let fetcher = list.fragment_fetcher();
        let items = list.load()?;

        self.fragments = Some(fetcher.clone());
        self.allow_active = true;

        let role_names: Vec<String> = self.roles.names().iter().map(|r| r.to_string()).collect();

        for item in &items {
            let doc = crate::parser::parse_with_fragments(&item.query, Some(&fetcher))?;
            let Some(op) = doc.operations.first() else {
                continue;
            };
            let op_kind = op.kind;

            let order_var = item.metadata.order.var.clone();
            let order_values = &item.metadata.order.values;

            for role in &role_names {
                let mut variants: Vec<Option<&str>> = vec![None];
                if order_var.is_some() && !order_values.is_empty() {
                    variants = order_values.iter().map(|v| Some(v.as_str())).collect();
                }

                for (i, value) in variants.iter().enumerate() {
                    let order = order_var
                        .as_deref()
                        .zip(*value)
                        .map(|(var, val)| (var, val));
                    let qcode =
                        match self
                            .qc
                            .compile(op, role, item.vars.as_ref(), order)
                        {
                            Ok(qcode) => qcode,
                            Err(Error::PermissionDenied(reason)) => {
                                log::debug!("allow item {} skipped for {role}: {reason}", item.name);
                                continue;
                            }
                            Err(other) => return Err(other),
                        };
                    let (sql_text, md) = match self.pc.compile(&qcode, &self.schema) {
                        Ok(out) => out,
                        Err(Error::UnsupportedOperation(_)) => continue,
                        Err(other) => return Err(other),
                    };

                    let comp = Arc::new(QueryComp {
                        qcode,
                        sql: sql_text,
                        md,
                        order_var: order_var.clone(),
                    });

                    if let Some(value) = value {
                        self.queries
                            .insert(query_key_ordered(&item.name, role, value), comp.clone());
                    }
                    // The first variant doubles as the default for requests
                    // that do not pin an order value.
                    if i == 0 {
                        self.queries.insert(query_key(&item.name, role), comp);
                    }
                }
            }

            self.apq
                .set(
                    &item.name,
                    ApqEntry {
                        op: op_kind,
                        name: item.name.clone(),
                        query: item.query.clone(),
                    },
                )
                .await;
        }

        tracing::info!(items = items.len(), "allow-list compiled");
        Ok(())
    }
}

pub(crate) fn query_key(name: &str, role: &str) -> String {
    format!("{}:{role}", name.to_lowercase())
}

pub(crate) fn query_key_ordered(name: &str, role: &str, order_value: &str) -> String {
    format!("{}:{role}:{order_value}", name.to_lowercase())
}
