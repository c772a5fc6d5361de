//! # gqlc
//!
//! Compiles a GraphQL request into exactly one SQL statement whose result is
//! already shaped as the response JSON, and executes it over a caller
//! supplied connection pool.
//!
//! ```ascii
//!        GraphQL text
//!
//!     (parse)  │
//!              ▼
//!        Document AST ── fragments inlined via a fetcher
//!              │
//!     (lower)  │  role policies applied here
//!              ▼
//!           QCode IR
//!              │
//!    (render)  │
//!              ▼
//!      SQL + Metadata ── one statement, positional placeholders
//!              │
//!              ▼
//!          Engine ── role probe · allow-list/APQ · bind · execute
//!              │
//!              ▼
//!      {"data": { … }}      (and a polling loop for subscriptions)
//! ```
//!
//! Most callers want [`Engine::new`] followed by [`Engine::graphql`] /
//! [`Engine::subscribe`]; the compiler stages are public for tooling.
//!
//! ```no_run
//! # async fn example(pool: std::sync::Arc<dyn gqlc::db::Pool>) -> gqlc::Result<()> {
//! let engine = gqlc::Engine::new(gqlc::Config::default(), pool).await?;
//! let ctx = gqlc::Context::default();
//! let res = engine.graphql(&ctx, "{ users { id email } }", None, None).await;
//! println!("{}", serde_json::to_string(&res).unwrap());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod allow;
mod config;
mod cursor;
pub mod db;
mod engine;
mod error;
pub mod parser;
pub mod qcode;
mod role;
pub mod schema;
pub mod sql;
mod subs;

pub use config::{Config, OpPermConfig, RemoteConfig, RoleConfig, RoleTableConfig, TableConfig};
pub use engine::{
    Context, Engine, EngineBuilder, ErrorMessage, Extensions, ReqConfig, Response, Tracing,
};
pub use error::{Error, Result};
pub use parser::ast::OpKind;
pub use subs::Subscription;

/// Classify a document without parsing it: `(operation kind, name)`.
///
/// Cheap enough to run on every request before any real work happens, and it
/// agrees with the full parser on well-formed documents.
pub fn operation(query: &str) -> (OpKind, &str) {
    parser::operation(query)
}
