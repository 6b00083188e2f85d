//! Transaction mode selection.
//!
//! Maps an abstract access-mode request to the exact directive the backend
//! expects after `SET TRANSACTION`. GoogleSQL only knows access modes; the
//! PostgreSQL dialect also accepts isolation levels, which are emitted as a
//! separate directive because their SET syntax differs from the access mode.
//!
//! Everything here is a pure lookup. No state, no I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{IsolationLevel, TxMode};
use crate::{Error, Result};

/// SQL dialect of the database the connection talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    #[default]
    GoogleStandardSql,
    PostgreSql,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::GoogleStandardSql => f.write_str("GoogleSQL"),
            Dialect::PostgreSql => f.write_str("PostgreSQL"),
        }
    }
}

/// Abstract transaction mode a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    IsolationLevelDefault,
    IsolationLevelSerializable,
}

impl TransactionMode {
    pub const ALL: [TransactionMode; 4] = [
        TransactionMode::ReadOnly,
        TransactionMode::ReadWrite,
        TransactionMode::IsolationLevelDefault,
        TransactionMode::IsolationLevelSerializable,
    ];

    /// The access mode this value selects, if it is an access-mode directive.
    pub fn access_mode(self) -> Option<TxMode> {
        match self {
            TransactionMode::ReadOnly => Some(TxMode::ReadOnly),
            TransactionMode::ReadWrite => Some(TxMode::ReadWrite),
            _ => None,
        }
    }

    /// The isolation level this value selects, if it is an isolation directive.
    pub fn isolation_level(self) -> Option<IsolationLevel> {
        match self {
            TransactionMode::IsolationLevelDefault => Some(IsolationLevel::Default),
            TransactionMode::IsolationLevelSerializable => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

/// Directive text for `mode` in `dialect`.
///
/// Fails with [`Error::Config`] for combinations the dialect does not support,
/// so nothing is sent for them.
pub fn directive(dialect: Dialect, mode: TransactionMode) -> Result<&'static str> {
    use TransactionMode::*;
    match (dialect, mode) {
        (_, ReadOnly) => Ok("READ ONLY"),
        (_, ReadWrite) => Ok("READ WRITE"),
        (Dialect::PostgreSql, IsolationLevelDefault) => Ok("ISOLATION LEVEL DEFAULT"),
        (Dialect::PostgreSql, IsolationLevelSerializable) => Ok("ISOLATION LEVEL SERIALIZABLE"),
        (Dialect::GoogleStandardSql, IsolationLevelDefault | IsolationLevelSerializable) => {
            Err(Error::Config(format!("{mode:?} is not a supported transaction mode for {dialect}")))
        }
    }
}

/// Full client statement that selects `mode`, e.g. `SET TRANSACTION READ ONLY`.
pub fn set_transaction_statement(dialect: Dialect, mode: TransactionMode) -> Result<String> {
    Ok(format!("SET TRANSACTION {}", directive(dialect, mode)?))
}

/// Reverse lookup: the mode whose directive matches `text`.
///
/// Case-insensitive; runs of whitespace count as one space.
pub fn parse(dialect: Dialect, text: &str) -> Result<TransactionMode> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
    for mode in TransactionMode::ALL {
        if let Ok(d) = directive(dialect, mode) {
            if d == normalized {
                return Ok(mode);
            }
        }
    }
    Err(Error::Config(format!("unknown transaction mode '{}' for {dialect}", text.trim())))
}
