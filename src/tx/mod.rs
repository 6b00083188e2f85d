//! Transaction handles and modes.

pub mod mode;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use mode::{Dialect, TransactionMode};

/// Transaction access mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl TxMode {
    pub fn is_read_only(self) -> bool { self == TxMode::ReadOnly }
}

/// Isolation level requested for a read-write transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Whatever the database default is.
    #[default]
    Default,
    Serializable,
}

/// Opaque transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Everything the backend needs to begin a transaction context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOptions {
    pub mode: TxMode,
    pub isolation: IsolationLevel,
    /// Mode directives produced by the selector, in the order they were set.
    pub directives: Vec<String>,
}

impl TxOptions {
    pub fn read_only() -> Self {
        Self { mode: TxMode::ReadOnly, ..Default::default() }
    }

    pub fn read_write() -> Self {
        Self::default()
    }
}

/// Transaction handle trait that all backends must implement.
pub trait Transaction: Send + Sync {
    fn mode(&self) -> TxMode;
    fn id(&self) -> TxId;
}
