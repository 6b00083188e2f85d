//! # spanner-uow: Transactional Unit-of-Work Layer
//!
//! Connection-style semantics (begin, execute, commit, rollback, batch) on
//! top of a database service that only exposes read/write/commit RPCs with
//! optimistic concurrency control.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `SpannerRpc` is the contract between the unit-of-work layer and the wire
//! 2. **One contract, two kinds**: `TransactionWorkUnit` and `BatchWorkUnit` both implement `UnitOfWork`
//! 3. **Aborts are not failures**: a server-side abort replays the transaction, and only a
//!    replay that observes different results is surfaced to the caller
//! 4. **Usage errors first**: misuse is reported before any RPC is issued
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spanner_uow::{Connection, ConnectionOptions, MemoryBackend, Mutation};
//!
//! # async fn example() -> spanner_uow::Result<()> {
//! let mut conn = Connection::new(MemoryBackend::new(), ConnectionOptions::default());
//!
//! conn.begin_transaction()?;
//! conn.execute("UPDATE Singers SET Active = true WHERE Id = 1").await?;
//! conn.write(vec![Mutation::insert("Albums").set("Id", 7).set("Title", "Blue")]).await?;
//! conn.commit().await?;
//!
//! println!("committed at {}", conn.commit_timestamp()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Units of Work
//!
//! | Kind | Type | Ends with |
//! |------|------|-----------|
//! | Transaction | `TransactionWorkUnit` | `commit` / `rollback` |
//! | Batch | `BatchWorkUnit` | `run_batch` / `abort_batch` |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod tx;
pub mod backend;
pub mod uow;
pub mod classifier;
pub mod connection;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    Value, Statement, ParsedStatement, StatementKind, Mutation, MutationOp,
    ResultSet, ResultSetStats, Row, Timestamp,
    AnalyzeMode, QueryOptions, UpdateOptions, CommitResponse,
};

// ============================================================================
// Re-exports: Backend
// ============================================================================

pub use backend::{SpannerRpc, DdlOutcome, MemoryBackend};

// ============================================================================
// Re-exports: Transactions
// ============================================================================

pub use tx::{Transaction, TxMode, TxId, TxOptions, IsolationLevel, Dialect, TransactionMode};

// ============================================================================
// Re-exports: Units of work
// ============================================================================

pub use uow::{UnitOfWork, UnitOfWorkType, UnitOfWorkState};
pub use uow::transaction::TransactionWorkUnit;
pub use uow::batch::BatchWorkUnit;
pub use uow::retry::RetryPolicy;

// ============================================================================
// Re-exports: Connection
// ============================================================================

pub use classifier::{StatementClassifier, KeywordClassifier};
pub use connection::{Connection, ConnectionOptions, StatementResult};

// ============================================================================
// Error Types
// ============================================================================

/// Status codes, following the gRPC codes the service reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}: operation not supported for batches")]
    UnsupportedForBatches(&'static str),

    #[error("{0}: operation not supported for transactions")]
    UnsupportedForTransactions(&'static str),

    #[error("unit of work is no longer active (state: {state:?})")]
    NotActive { state: UnitOfWorkState },

    #[error("value not available: {0}")]
    ValueNotAvailable(&'static str),

    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Transaction aborted due to concurrent modification: {0}")]
    AbortedDueToConcurrentModification(String),

    #[error("Statement cancelled: {0}")]
    Cancelled(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("{code:?}: {message}")]
    Backend { code: ErrorCode, message: String },

    #[error("Batch update failed after {} statement(s): {source}", .update_counts.len())]
    BatchUpdate { update_counts: Vec<i64>, source: Box<Error> },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a non-transient backend error.
    pub fn backend(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Backend { code, message: message.into() }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::UnsupportedForBatches(_)
            | Error::UnsupportedForTransactions(_)
            | Error::NotActive { .. }
            | Error::ValueNotAvailable(_) => ErrorCode::FailedPrecondition,
            Error::InvalidUsage(_) | Error::Config(_) | Error::Json(_) => ErrorCode::InvalidArgument,
            Error::Aborted(_) | Error::AbortedDueToConcurrentModification(_) => ErrorCode::Aborted,
            Error::Cancelled(_) => ErrorCode::Cancelled,
            Error::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            Error::Backend { code, .. } => *code,
            Error::BatchUpdate { source, .. } => source.code(),
        }
    }

    /// Caller misuse, detected before any RPC. Never retried.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedForBatches(_)
                | Error::UnsupportedForTransactions(_)
                | Error::NotActive { .. }
                | Error::ValueNotAvailable(_)
                | Error::InvalidUsage(_)
        )
    }

    /// Server-signaled abort that the retry policy may replay.
    pub fn is_aborted(&self) -> bool {
        match self {
            Error::Aborted(_) => true,
            Error::BatchUpdate { source, .. } => source.is_aborted(),
            _ => false,
        }
    }

    /// Per-statement counts carried by a failed batch.
    pub fn update_counts(&self) -> Option<&[i64]> {
        match self {
            Error::BatchUpdate { update_counts, .. } => Some(update_counts),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
