//! Engine configuration.
//!
//! These types only describe configuration; loading them from files is a
//! transport concern. Everything derives serde so hosts can deserialize from
//! whatever format they prefer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database flavor; `postgres` when unset.
    pub db_type: Option<String>,

    /// Row limit applied to plural selects without an explicit `limit`.
    pub default_limit: Option<u32>,

    /// Globally disables aggregate functions regardless of role settings.
    pub disable_functions: bool,

    /// When false, only allow-list queries may execute.
    pub disable_allow_list: bool,

    /// Root of the allow-list tree (`queries/`, `fragments/`).
    pub allow_list_path: Option<PathBuf>,

    /// Issue `SET SESSION "user.id" = …` on each request's connection.
    pub set_user_id: bool,

    /// Tables (`name`) or columns (`table.column`) hidden from the catalog.
    pub blocklist: Vec<String>,

    pub tables: Vec<TableConfig>,

    /// ABAC probe; must reference `$user_id`. Role `match` expressions are
    /// evaluated against its result set.
    pub roles_query: Option<String>,

    /// Roles in declaration order. The first `match` that holds wins.
    pub roles: Vec<RoleConfig>,

    /// Subscription poll interval in milliseconds; floor 500, default 1000.
    pub subs_poll_ms: Option<u64>,

    /// `Cache-Control` directive attached to compiled query metadata.
    pub cache_header: Option<String>,

    /// Secret for signing cursor tokens. Unset means tokens pass through
    /// unsigned, which is only acceptable in development.
    pub cursor_secret: Option<String>,

    /// Log dropped columns and skipped selections.
    pub debug: bool,

    /// Attach request timing under `extensions.tracing` in every response.
    pub enable_tracing: bool,
}

impl Config {
    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn default_limit(&self) -> u32 {
        self.default_limit.unwrap_or(20)
    }
}

/// Per-table overrides, alias declarations and remote edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub name: String,

    /// When set, this entry is an alias forwarding to the named real table.
    pub table: Option<String>,

    /// Pins an alias to one foreign key when several link the same tables.
    pub fk_column: Option<String>,

    pub singular: Option<String>,
    pub plural: Option<String>,

    pub remotes: Vec<RemoteConfig>,
}

/// An edge materialized by an HTTP call instead of a join.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Field name the remote payload appears under.
    pub name: String,
    /// Column whose value keys the remote lookup.
    pub id_column: String,
    /// URL template; `$id` is replaced by the key value.
    pub url: String,
    /// Path into the response to splice (for enveloped APIs).
    pub path: Vec<String>,
    /// Projection of the remote payload; empty keeps everything.
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    pub name: String,

    /// SQL boolean evaluated against the `roles_query` result set.
    #[serde(rename = "match")]
    pub match_expr: Option<String>,

    pub tables: Vec<RoleTableConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleTableConfig {
    pub name: String,
    pub query: Option<OpPermConfig>,
    pub insert: Option<OpPermConfig>,
    pub update: Option<OpPermConfig>,
    pub delete: Option<OpPermConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpPermConfig {
    /// Allowed columns; empty means every column.
    pub columns: Vec<String>,

    /// Row filter in the same object shape as a GraphQL `where` argument.
    pub filter: Option<serde_json::Value>,

    /// Permit aggregate columns for this role and table.
    pub functions: bool,

    /// Refuse the operation outright.
    pub block: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_role_yaml() {
        let conf: Config = serde_yaml::from_str(
            r#"
            roles_query: "SELECT * FROM users WHERE id = $user_id"
            roles:
              - name: admin
                match: "users.admin = true"
                tables:
                  - name: users
                    query:
                      columns: [id, email]
                      filter: { id: { eq: $user_id } }
            "#,
        )
        .unwrap();

        assert_eq!(conf.roles.len(), 1);
        let role = &conf.roles[0];
        assert_eq!(role.name, "admin");
        assert_eq!(role.match_expr.as_deref(), Some("users.admin = true"));
        let q = role.tables[0].query.as_ref().unwrap();
        assert_eq!(q.columns, vec!["id", "email"]);
        assert!(q.filter.is_some());
    }

    #[test]
    fn default_limit_falls_back_to_twenty() {
        assert_eq!(Config::default().default_limit(), 20);
        let conf = Config {
            default_limit: Some(5),
            ..Default::default()
        };
        assert_eq!(conf.default_limit(), 5);
    }
}
