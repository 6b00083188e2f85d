//! # Units of Work
//!
//! A unit of work is one logical span of database activity on a connection:
//! either an interactive transaction or a DML/DDL batch. Both kinds share
//! one lifecycle contract, [`UnitOfWork`], but accept different operations.
//!
//! ## State machine
//!
//! ```text
//! STARTED -> COMMITTING -> COMMITTED | COMMIT_FAILED     (transaction)
//! STARTED -> ROLLED_BACK                                 (transaction)
//! STARTED -> RUNNING -> RAN | RUN_FAILED                 (batch)
//! STARTED -> ABORTED                                     (batch)
//! ```
//!
//! Transitions only move forward. Kind checks ("not supported for batches")
//! and liveness checks ("no longer active") live in [`UnitOfWorkBase`] so
//! every implementation reports them the same way.

pub mod transaction;
pub mod batch;
pub mod retry;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::model::*;
use crate::{Error, Result};

// ============================================================================
// Type and state
// ============================================================================

/// A unit of work is either a transaction or a DDL/DML batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitOfWorkType {
    Transaction,
    Batch,
}

impl fmt::Display for UnitOfWorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOfWorkType::Transaction => f.write_str("transaction"),
            UnitOfWorkType::Batch => f.write_str("batch"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitOfWorkState {
    Started,
    Committing,
    Committed,
    CommitFailed,
    RolledBack,
    Running,
    Ran,
    RunFailed,
    Aborted,
}

impl UnitOfWorkState {
    /// Only a freshly started unit accepts operations.
    pub fn is_active(self) -> bool {
        self == UnitOfWorkState::Started
    }

    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            UnitOfWorkState::Started | UnitOfWorkState::Committing | UnitOfWorkState::Running
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: UnitOfWorkState) -> bool {
        use UnitOfWorkState::*;
        matches!(
            (self, next),
            (Started, Committing | RolledBack | Running | Aborted)
                | (Committing, Committed | CommitFailed)
                | (Running, Ran | RunFailed)
        )
    }
}

// ============================================================================
// Shared base
// ============================================================================

/// Lifecycle state and cancellation signal shared by every unit kind.
pub struct UnitOfWorkBase {
    kind: UnitOfWorkType,
    state: Mutex<UnitOfWorkState>,
    /// Bumped by `cancel()`; in-flight statements watch for a change.
    cancel_generation: watch::Sender<u64>,
}

impl UnitOfWorkBase {
    pub fn new(kind: UnitOfWorkType) -> Self {
        Self {
            kind,
            state: Mutex::new(UnitOfWorkState::Started),
            cancel_generation: watch::Sender::new(0),
        }
    }

    pub fn kind(&self) -> UnitOfWorkType { self.kind }

    pub fn state(&self) -> UnitOfWorkState { *self.state.lock() }

    /// The error for an operation this kind of unit never accepts.
    pub fn unsupported(&self, operation: &'static str) -> Error {
        match self.kind {
            UnitOfWorkType::Batch => Error::UnsupportedForBatches(operation),
            UnitOfWorkType::Transaction => Error::UnsupportedForTransactions(operation),
        }
    }

    pub fn check_active(&self) -> Result<()> {
        let state = self.state();
        if state.is_active() {
            Ok(())
        } else {
            Err(Error::NotActive { state })
        }
    }

    /// Move to `next`, failing with `NotActive` if the current state has no such edge.
    pub fn transition(&self, next: UnitOfWorkState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(Error::NotActive { state: *state });
        }
        tracing::debug!(kind = %self.kind, from = ?*state, to = ?next, "unit of work state change");
        *state = next;
        Ok(())
    }

    /// Request cancellation of the statement currently executing, if any.
    pub fn cancel(&self) {
        self.cancel_generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    /// Run `fut`, resolving early with `Error::Cancelled` if `cancel()` is
    /// called while it is pending.
    pub async fn cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut cancelled = self.cancel_generation.subscribe();
        tokio::select! {
            biased;
            _ = cancelled.changed() => {
                Err(Error::Cancelled(format!("statement in {} was cancelled", self.kind)))
            }
            result = fut => result,
        }
    }
}

// ============================================================================
// UnitOfWork Trait
// ============================================================================

/// The contract every unit-of-work kind implements.
///
/// Operations that a kind never supports have default bodies that reject
/// them through [`UnitOfWorkBase::unsupported`]; implementations override
/// only what their kind accepts.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Shared lifecycle state.
    fn base(&self) -> &UnitOfWorkBase;

    /// Whether this unit only reads.
    fn is_read_only(&self) -> bool;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Cancel the currently running statement, if any.
    fn cancel(&self) { self.base().cancel() }

    fn unit_type(&self) -> UnitOfWorkType { self.base().kind() }

    fn state(&self) -> UnitOfWorkState { self.base().state() }

    fn is_active(&self) -> bool { self.state().is_active() }

    // ========================================================================
    // Transaction-only
    // ========================================================================

    /// Commit. For read-only transactions this only closes the read context.
    async fn commit(&self) -> Result<()> {
        Err(self.base().unsupported("commit"))
    }

    /// Roll back. For read-only transactions this only closes the read context.
    async fn rollback(&self) -> Result<()> {
        Err(self.base().unsupported("rollback"))
    }

    fn read_timestamp(&self) -> Result<Timestamp> {
        Err(Error::ValueNotAvailable("read timestamp"))
    }

    fn read_timestamp_or_none(&self) -> Option<Timestamp> { None }

    fn commit_timestamp(&self) -> Result<Timestamp> {
        Err(Error::ValueNotAvailable("commit timestamp"))
    }

    fn commit_timestamp_or_none(&self) -> Option<Timestamp> { None }

    fn commit_response(&self) -> Result<CommitResponse> {
        Err(Error::ValueNotAvailable("commit response"))
    }

    fn commit_response_or_none(&self) -> Option<CommitResponse> { None }

    // ========================================================================
    // Batch-only
    // ========================================================================

    /// Send the buffered statements as one call and end the batch.
    ///
    /// DML batches return one update count per statement. DDL batches return
    /// 1 for each applied statement and 0 for the failed one and everything after it.
    async fn run_batch(&self) -> Result<Vec<i64>> {
        Err(self.base().unsupported("run_batch"))
    }

    /// Drop the buffered statements and end the batch. Never blocks.
    fn abort_batch(&self) -> Result<()> {
        Err(self.base().unsupported("abort_batch"))
    }

    // ========================================================================
    // Data operations
    // ========================================================================

    /// Execute a query. A non-`None` analyze mode cannot be combined with query options.
    async fn execute_query(
        &self,
        _statement: &ParsedStatement,
        _analyze_mode: AnalyzeMode,
        _options: &QueryOptions,
    ) -> Result<ResultSet> {
        Err(self.base().unsupported("execute_query"))
    }

    async fn execute_ddl(&self, _statement: &ParsedStatement) -> Result<()> {
        Err(self.base().unsupported("execute_ddl"))
    }

    async fn execute_update(&self, _statement: &ParsedStatement, _options: &UpdateOptions) -> Result<i64> {
        Err(self.base().unsupported("execute_update"))
    }

    async fn execute_batch_update(
        &self,
        _statements: &[ParsedStatement],
        _options: &UpdateOptions,
    ) -> Result<Vec<i64>> {
        Err(self.base().unsupported("execute_batch_update"))
    }

    async fn write(&self, _mutations: Vec<Mutation>) -> Result<()> {
        Err(self.base().unsupported("write"))
    }
}

/// Reject a statement whose classified kind does not match the operation.
pub(crate) fn expect_kind(statement: &ParsedStatement, expected: StatementKind) -> Result<()> {
    if statement.kind == expected {
        Ok(())
    } else {
        Err(Error::InvalidUsage(format!(
            "expected a {expected} statement, got {}: {}",
            statement.kind, statement.sql
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use UnitOfWorkState::*;

    const ALL: [UnitOfWorkState; 9] =
        [Started, Committing, Committed, CommitFailed, RolledBack, Running, Ran, RunFailed, Aborted];

    #[test]
    fn test_only_started_is_active() {
        for s in ALL {
            assert_eq!(s.is_active(), s == Started, "{s:?}");
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn test_nothing_returns_to_started_or_running() {
        for from in ALL {
            assert!(!from.can_transition_to(Started));
            if from != Started {
                assert!(!from.can_transition_to(Running));
            }
        }
    }

    #[test]
    fn test_base_transition_rejects_illegal_edges() {
        let base = UnitOfWorkBase::new(UnitOfWorkType::Transaction);
        base.transition(Committing).unwrap();
        assert!(matches!(base.transition(RolledBack), Err(Error::NotActive { state: Committing })));
        base.transition(Committed).unwrap();
        assert!(matches!(base.check_active(), Err(Error::NotActive { state: Committed })));
    }

    #[test]
    fn test_unsupported_by_kind() {
        let batch = UnitOfWorkBase::new(UnitOfWorkType::Batch);
        assert!(matches!(batch.unsupported("commit"), Error::UnsupportedForBatches("commit")));
        let tx = UnitOfWorkBase::new(UnitOfWorkType::Transaction);
        assert!(matches!(tx.unsupported("run_batch"), Error::UnsupportedForTransactions("run_batch")));
    }

    #[tokio::test]
    async fn test_cancel_resolves_pending_future() {
        let base = std::sync::Arc::new(UnitOfWorkBase::new(UnitOfWorkType::Transaction));
        let b = base.clone();
        let handle = tokio::spawn(async move {
            b.cancellable(async {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok(())
            })
            .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        base.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert_eq!(base.state(), Started);
    }

    #[tokio::test]
    async fn test_cancel_before_start_does_not_poison_later_statements() {
        let base = UnitOfWorkBase::new(UnitOfWorkType::Transaction);
        base.cancel();
        let result = base.cancellable(async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
