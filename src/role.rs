//! Role model and policy resolution.
//!
//! Roles come from configuration and are immutable after startup. They are
//! held in declaration order: when ABAC is enabled and several `match`
//! expressions hold at once, the first declared role wins, which keeps role
//! resolution deterministic.

use std::collections::{HashMap, HashSet};

use crate::config::{Config, OpPermConfig, RoleConfig};

/// The operation a policy is being asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Query,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    pub match_expr: Option<String>,
    tables: HashMap<String, RoleTable>,
}

#[derive(Debug, Clone, Default)]
struct RoleTable {
    query: Option<OpPolicy>,
    insert: Option<OpPolicy>,
    update: Option<OpPolicy>,
    delete: Option<OpPolicy>,
}

#[derive(Debug, Clone, Default)]
struct OpPolicy {
    allowed: Option<HashSet<String>>,
    filter: Option<serde_json::Value>,
    functions: bool,
    block: bool,
}

impl From<&OpPermConfig> for OpPolicy {
    fn from(c: &OpPermConfig) -> Self {
        OpPolicy {
            allowed: (!c.columns.is_empty()).then(|| c.columns.iter().cloned().collect()),
            filter: c.filter.clone(),
            functions: c.functions,
            block: c.block,
        }
    }
}

/// Effective permissions for one `(role, table, op)` triple.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    /// `None` means every column.
    pub allowed: Option<HashSet<String>>,
    /// Row filter in GraphQL `where` object shape, merged into the select.
    pub filter: Option<serde_json::Value>,
    pub functions: bool,
    pub blocked: bool,
    /// Skipped silently rather than rejected: the table simply is not part of
    /// this role's view (the anonymous default).
    pub skipped: bool,
}

impl Policy {
    fn open() -> Policy {
        Policy {
            functions: true,
            ..Default::default()
        }
    }

    fn closed(skipped: bool) -> Policy {
        Policy {
            blocked: !skipped,
            skipped,
            ..Default::default()
        }
    }
}

pub struct Roles {
    list: Vec<Role>,
}

impl Roles {
    pub fn from_config(conf: &Config) -> Roles {
        Roles {
            list: conf.roles.iter().map(build_role).collect(),
        }
    }

    /// True when any role carries a `match` expression, which switches the
    /// engine to SQL-probed role resolution.
    pub fn abac_enabled(&self) -> bool {
        self.list.iter().any(|r| r.match_expr.is_some())
    }

    pub fn get(&self, name: &str) -> Option<&Role> {
        self.list.iter().find(|r| r.name == name)
    }

    /// All role names the allow-list precompiles for, in declaration order.
    /// `anon` and `user` always take part even when not configured.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = vec!["anon", "user"];
        for role in &self.list {
            if !names.contains(&role.name.as_str()) {
                names.push(&role.name);
            }
        }
        names
    }

    /// Declared roles with `match` expressions, declaration order preserved.
    pub fn matchers(&self) -> impl Iterator<Item = &Role> {
        self.list.iter().filter(|r| r.match_expr.is_some())
    }

    /// Resolve the effective permissions.
    ///
    /// The rules, loosest first:
    ///   - no roles configured at all: everything is open (development mode);
    ///   - a configured role without an entry for the table: open for every
    ///     role except `anon`, which only sees what it was given;
    ///   - a table entry without the relevant op section: queries are open,
    ///     writes are refused (writes need an explicit grant);
    ///   - `block: true` refuses the op outright.
    pub fn policy(&self, role: &str, table: &str, op: Op) -> Policy {
        if self.list.is_empty() {
            return Policy::open();
        }

        let Some(r) = self.get(role) else {
            // `user` is implicitly every authenticated caller; `anon` is
            // implicitly locked down; anything else must be declared.
            return match role {
                "user" => Policy::open(),
                "anon" => Policy::closed(true),
                _ => Policy::closed(false),
            };
        };

        let Some(rt) = r.tables.get(table) else {
            return if role == "anon" {
                Policy::closed(true)
            } else {
                Policy::open()
            };
        };

        let policy = match op {
            Op::Query => &rt.query,
            Op::Insert => &rt.insert,
            Op::Update => &rt.update,
            Op::Delete => &rt.delete,
        };

        match policy {
            Some(p) if p.block => Policy::closed(false),
            Some(p) => Policy {
                allowed: p.allowed.clone(),
                filter: p.filter.clone(),
                functions: p.functions,
                blocked: false,
                skipped: false,
            },
            None if op == Op::Query => Policy::open(),
            None => Policy::closed(false),
        }
    }
}

fn build_role(rc: &RoleConfig) -> Role {
    let tables = rc
        .tables
        .iter()
        .map(|tc| {
            (
                tc.name.clone(),
                RoleTable {
                    query: tc.query.as_ref().map(Into::into),
                    insert: tc.insert.as_ref().map(Into::into),
                    update: tc.update.as_ref().map(Into::into),
                    delete: tc.delete.as_ref().map(Into::into),
                },
            )
        })
        .collect();

    Role {
        name: rc.name.clone(),
        match_expr: rc.match_expr.clone(),
        tables,
    }
}

/// The static fallback when neither an override nor ABAC decides.
pub fn static_role(has_user_id: bool) -> &'static str {
    if has_user_id {
        "user"
    } else {
        "anon"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OpPermConfig, RoleTableConfig};

    fn conf_with_anon(columns: &[&str]) -> Config {
        Config {
            roles: vec![RoleConfig {
                name: "anon".into(),
                tables: vec![RoleTableConfig {
                    name: "users".into(),
                    query: Some(OpPermConfig {
                        columns: columns.iter().map(|c| c.to_string()).collect(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn empty_config_is_open() {
        let roles = Roles::from_config(&Config::default());
        let p = roles.policy("anon", "users", Op::Query);
        assert!(!p.blocked && !p.skipped);
        assert!(p.allowed.is_none());
    }

    #[test]
    fn anon_sees_only_configured_tables() {
        let roles = Roles::from_config(&conf_with_anon(&["id", "email"]));

        let p = roles.policy("anon", "users", Op::Query);
        assert_eq!(p.allowed.unwrap().len(), 2);

        let p = roles.policy("anon", "posts", Op::Query);
        assert!(p.skipped && !p.blocked);
    }

    #[test]
    fn writes_need_explicit_grants() {
        let roles = Roles::from_config(&conf_with_anon(&["id"]));
        assert!(roles.policy("anon", "users", Op::Insert).blocked);
        // Reads of a configured table stay open for unconfigured user role.
        assert!(!roles.policy("user", "users", Op::Query).blocked);
    }

    #[test]
    fn declaration_order_is_kept() {
        let conf = Config {
            roles: vec![
                RoleConfig {
                    name: "admin".into(),
                    match_expr: Some("users.admin = true".into()),
                    ..Default::default()
                },
                RoleConfig {
                    name: "editor".into(),
                    match_expr: Some("users.editor = true".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let roles = Roles::from_config(&conf);
        assert!(roles.abac_enabled());
        let names: Vec<_> = roles.matchers().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["admin", "editor"]);
    }
}
