//! Error kinds surfaced by the compiler and the execution engine.
//!
//! Compile-path errors (parse, lowering, permission, SQL generation) abort the
//! request and come back with an empty `data`. Execution errors are whatever
//! the database driver surfaced. Remote-join failures never fail the whole
//! document; they are recorded per field by the engine.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed GraphQL document.
    #[error("{0}")]
    Parse(String),

    /// A selection names a field the schema or the role does not know.
    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Two equally valid relationship paths between a pair of tables; the
    /// query must disambiguate by naming a configured alias.
    #[error("ambiguous relationship between {child} and {parent}")]
    AmbiguousRelation { child: String, parent: String },

    /// The effective role blocks the operation or the whole selection.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A hash-only request missed the persisted-query cache. The client is
    /// expected to retry with the full document.
    #[error("PersistedQueryNotFound")]
    PersistedQueryNotFound,

    #[error("{0}")]
    UnsupportedOperation(String),

    #[error("config: {0}")]
    Config(String),

    /// Surfaced unchanged from the database driver.
    #[error("{0}")]
    Execution(String),

    /// Singular root select matched no row.
    #[error("no rows")]
    NoRows,

    /// A subscriber's channel overflowed and it was disconnected.
    #[error("subscriber lagged")]
    SubscriberLagged,

    #[error("remote join failed: {0}")]
    RemoteJoinFailed(String),
}

impl Error {
    /// Parse error with a uniform prefix-free message.
    pub(crate) fn parse<S: ToString>(msg: S) -> Self {
        Error::Parse(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_wire_format() {
        // These strings end up verbatim in the GraphQL `errors` array, so the
        // exact rendering is part of the public contract.
        assert_eq!(
            Error::PersistedQueryNotFound.to_string(),
            "PersistedQueryNotFound"
        );
        assert_eq!(
            Error::UnsupportedOperation("mysql: mutations not supported".into()).to_string(),
            "mysql: mutations not supported"
        );
        assert_eq!(
            Error::UnknownTable("tigers".into()).to_string(),
            "unknown table: tigers"
        );
    }
}
