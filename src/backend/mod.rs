//! # Backend RPC Trait
//!
//! This is THE contract between the unit-of-work layer and the database service.
//! Every RPC a transaction or batch needs is defined here; transport and
//! serialization live behind it.
//!
//! ## Implementations
//!
//! | Backend | Module | Description |
//! |---------|--------|-------------|
//! | `MemoryBackend` | `memory` | Scripted in-memory service for testing/embedding |

pub mod memory;

use async_trait::async_trait;
use crate::model::*;
use crate::tx::{Transaction, TxOptions};
use crate::{Error, Result};

pub use memory::MemoryBackend;

// ============================================================================
// DDL outcome
// ============================================================================

/// Result of a DDL RPC.
///
/// DDL statements run one after another and stop at the first failure, so
/// the backend reports how many statements were applied before it stopped.
#[derive(Debug, Default)]
pub struct DdlOutcome {
    /// Number of leading statements that were applied.
    pub completed: usize,
    /// The failure that stopped execution, if any.
    pub error: Option<Error>,
}

impl DdlOutcome {
    pub fn success(completed: usize) -> Self {
        Self { completed, error: None }
    }

    pub fn failed(completed: usize, error: Error) -> Self {
        Self { completed, error: Some(error) }
    }

    pub fn into_result(self) -> Result<usize> {
        match self.error {
            None => Ok(self.completed),
            Some(e) => Err(e),
        }
    }
}

// ============================================================================
// SpannerRpc Trait
// ============================================================================

/// The backend RPC contract.
///
/// Implementations must report a server-side transaction abort as
/// [`Error::Aborted`] and nothing else, because the retry policy reacts to
/// that variant specifically. Every other failure is propagated verbatim.
#[async_trait]
pub trait SpannerRpc: Send + Sync + 'static {
    /// The transaction handle type for this backend.
    type Tx: Transaction + 'static;

    // ========================================================================
    // Transaction lifecycle
    // ========================================================================

    /// Begin a transaction context.
    async fn begin_transaction(&self, options: &TxOptions) -> Result<Self::Tx>;

    /// Commit the transaction, applying `mutations` atomically with the
    /// effects of the statements already executed in it.
    async fn commit(&self, tx: Self::Tx, mutations: Vec<Mutation>) -> Result<CommitResponse>;

    /// Roll back the transaction and release its resources.
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    // ========================================================================
    // Statements
    // ========================================================================

    /// Execute a query inside the transaction.
    async fn execute_query(
        &self,
        tx: &mut Self::Tx,
        statement: &ParsedStatement,
        analyze_mode: AnalyzeMode,
        options: &QueryOptions,
    ) -> Result<ResultSet>;

    /// Execute one DML statement and return the affected-row count.
    async fn execute_update(
        &self,
        tx: &mut Self::Tx,
        statement: &ParsedStatement,
        options: &UpdateOptions,
    ) -> Result<i64>;

    /// Execute DML statements in one round trip.
    ///
    /// A failure partway through must be reported as [`Error::BatchUpdate`]
    /// carrying the counts of the statements that preceded it.
    async fn execute_batch_update(
        &self,
        tx: &mut Self::Tx,
        statements: &[ParsedStatement],
        options: &UpdateOptions,
    ) -> Result<Vec<i64>>;

    /// Execute DDL statements in order, outside of any transaction.
    async fn execute_ddl(&self, statements: &[ParsedStatement]) -> DdlOutcome;
}
