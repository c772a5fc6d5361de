//! Database dialects.
//!
//! The renderer targets Postgres; other flavors only gate features they
//! cannot run rather than producing different SQL.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    Mysql,
}

impl Dialect {
    pub fn supports_mutations(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    pub fn from_config(name: Option<&str>) -> Dialect {
        match name {
            None | Some("") => Dialect::Postgres,
            Some(other) => Dialect::from_str(other).unwrap_or(Dialect::Postgres),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_names() {
        assert_eq!(Dialect::from_config(None), Dialect::Postgres);
        assert_eq!(Dialect::from_config(Some("mysql")), Dialect::Mysql);
        assert_eq!(Dialect::from_config(Some("wat")), Dialect::Postgres);
        assert!(!Dialect::Mysql.supports_mutations());
    }
}
