//! Interactive read-only and read-write transactions.
//!
//! Statements run immediately inside one backend transaction context, which
//! is begun lazily by the first statement (or the commit). Mutations are
//! buffered locally and sent with the commit.
//!
//! Read-write transactions record every statement and what it returned.
//! When the backend aborts the transaction, the recorded sequence is
//! replayed on a fresh context and the interrupted operation is resumed.

use std::slice;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::SpannerRpc;
use crate::model::*;
use crate::tx::TxOptions;
use crate::{Error, ErrorCode, Result};
use super::retry::{Observed, OpOutput, ReplayLog, RetryPolicy, StatementOp};
use super::{expect_kind, UnitOfWork, UnitOfWorkBase, UnitOfWorkState, UnitOfWorkType};

/// An interactive transaction.
pub struct TransactionWorkUnit<B: SpannerRpc> {
    base: UnitOfWorkBase,
    backend: Arc<B>,
    options: TxOptions,
    retry: RetryPolicy,
    /// Held across every backend call, so operations land in issue order
    /// and commit waits for whatever is in flight.
    inner: AsyncMutex<TxInner<B::Tx>>,
    outcome: Mutex<TxOutcome>,
}

struct TxInner<T> {
    tx: Option<T>,
    mutations: Vec<Mutation>,
    replay: ReplayLog,
    /// Set when a retry failed. Only rollback is allowed from then on.
    poisoned: Option<Poison>,
}

/// Why a transaction can no longer be used.
#[derive(Debug, Clone)]
struct Poison {
    concurrent_modification: bool,
    message: String,
}

impl Poison {
    fn of(err: &Error) -> Self {
        Self {
            concurrent_modification: matches!(err, Error::AbortedDueToConcurrentModification(_)),
            message: err.to_string(),
        }
    }

    fn error(&self) -> Error {
        let message = format!("transaction must be rolled back after a failed retry: {}", self.message);
        if self.concurrent_modification {
            Error::AbortedDueToConcurrentModification(message)
        } else {
            Error::Aborted(message)
        }
    }
}

#[derive(Default)]
struct TxOutcome {
    read_timestamp: Option<Timestamp>,
    commit_response: Option<CommitResponse>,
}

impl<B: SpannerRpc> TransactionWorkUnit<B> {
    pub fn new(backend: Arc<B>, options: TxOptions, retry: RetryPolicy) -> Self {
        Self {
            base: UnitOfWorkBase::new(UnitOfWorkType::Transaction),
            backend,
            options,
            retry,
            inner: AsyncMutex::new(TxInner {
                tx: None,
                mutations: Vec::new(),
                replay: ReplayLog::default(),
                poisoned: None,
            }),
            outcome: Mutex::new(TxOutcome::default()),
        }
    }

    pub fn options(&self) -> &TxOptions { &self.options }

    fn reject_in_read_only(&self, what: &str) -> Result<()> {
        if self.options.mode.is_read_only() {
            return Err(Error::InvalidUsage(format!("{what} not allowed in a read-only transaction")));
        }
        Ok(())
    }

    fn check_usable(&self, inner: &TxInner<B::Tx>) -> Result<()> {
        self.base.check_active()?;
        match &inner.poisoned {
            Some(poison) => Err(poison.error()),
            None => Ok(()),
        }
    }

    /// The open transaction context, begun on first use.
    async fn context<'a>(&self, inner: &'a mut TxInner<B::Tx>) -> Result<&'a mut B::Tx> {
        let tx = match inner.tx.take() {
            Some(tx) => tx,
            None => {
                tracing::debug!(mode = ?self.options.mode, "begin transaction");
                self.backend.begin_transaction(&self.options).await?
            }
        };
        Ok(inner.tx.insert(tx))
    }

    async fn dispatch(&self, tx: &mut B::Tx, op: &StatementOp) -> Result<OpOutput> {
        match op {
            StatementOp::Query { statement, analyze_mode, options } => self
                .backend
                .execute_query(tx, statement, *analyze_mode, options)
                .await
                .map(OpOutput::Rows),
            StatementOp::Update { statement, options } => self
                .backend
                .execute_update(tx, statement, options)
                .await
                .map(OpOutput::Count),
            StatementOp::BatchUpdate { statements, options } => self
                .backend
                .execute_batch_update(tx, statements, options)
                .await
                .map(OpOutput::Counts),
        }
    }

    /// Run `op` in the current context, replaying the transaction whenever
    /// the backend aborts it.
    async fn execute(&self, op: StatementOp) -> Result<OpOutput> {
        let mut inner = self.inner.lock().await;
        self.check_usable(&inner)?;
        tracing::debug!(sql = %op.sql(), "dispatch statement");

        let mut aborts = 0;
        loop {
            let tx = self.context(&mut inner).await?;
            let result = self.base.cancellable(self.dispatch(tx, &op)).await;
            match result {
                Err(e) if e.is_aborted() && self.retry.enabled => {
                    aborts += 1;
                    if let Err(retry_err) = self.retry_transaction(&mut inner, &mut aborts, &e).await {
                        tracing::warn!(error = %retry_err, "transaction can no longer be used");
                        inner.poisoned = Some(Poison::of(&retry_err));
                        return Err(retry_err);
                    }
                }
                result => {
                    let replayable = match &result {
                        Ok(_) => true,
                        Err(e) => !e.is_aborted() && !matches!(e, Error::Cancelled(_)),
                    };
                    if replayable && !self.is_read_only() {
                        inner.replay.record(op, Observed::of(&result));
                    }
                    return result;
                }
            }
        }
    }

    /// Begin a fresh context and replay every recorded statement on it.
    ///
    /// `aborts` counts consecutive aborts, including ones hit during replay.
    async fn retry_transaction(&self, inner: &mut TxInner<B::Tx>, aborts: &mut u32, cause: &Error) -> Result<()> {
        inner.tx = None;
        loop {
            if !self.retry.allows_retry(*aborts) {
                tracing::warn!(attempts = *aborts, "giving up on aborted transaction");
                return Err(Error::Aborted(format!(
                    "transaction still aborted after {} attempt(s): {cause}",
                    *aborts
                )));
            }
            let delay = self.retry.backoff(*aborts);
            tracing::warn!(
                attempt = *aborts,
                delay_ms = delay.as_millis() as u64,
                statements = inner.replay.len(),
                "transaction aborted, retrying"
            );
            self.base
                .cancellable(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;

            let mut tx = self.backend.begin_transaction(&self.options).await?;
            match self.base.cancellable(self.replay(&mut tx, &inner.replay)).await {
                Ok(()) => {
                    inner.tx = Some(tx);
                    return Ok(());
                }
                Err(e) if e.is_aborted() => *aborts += 1,
                Err(e) => return Err(e),
            }
        }
    }

    async fn replay(&self, tx: &mut B::Tx, log: &ReplayLog) -> Result<()> {
        for (op, expected) in log.entries() {
            let result = self.dispatch(tx, op).await;
            if let Err(e) = &result {
                if e.is_aborted() {
                    return Err(Error::Aborted(e.to_string()));
                }
            }
            if Observed::of(&result) != *expected {
                tracing::warn!(sql = %op.sql(), "replay diverged from the original result");
                return Err(Error::AbortedDueToConcurrentModification(format!(
                    "the data read by `{}` changed while the transaction was retried",
                    op.sql()
                )));
            }
        }
        Ok(())
    }

    async fn commit_with_retry(&self, inner: &mut TxInner<B::Tx>) -> Result<CommitResponse> {
        let mut aborts = 0;
        loop {
            self.context(inner).await?;
            let tx = inner.tx.take().ok_or_else(|| {
                Error::backend(ErrorCode::Internal, "transaction context missing at commit")
            })?;
            let result = self
                .base
                .cancellable(self.backend.commit(tx, inner.mutations.clone()))
                .await;
            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_aborted() && self.retry.enabled => {
                    aborts += 1;
                    self.retry_transaction(inner, &mut aborts, &e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<B: SpannerRpc> UnitOfWork for TransactionWorkUnit<B> {
    fn base(&self) -> &UnitOfWorkBase { &self.base }

    fn is_read_only(&self) -> bool { self.options.mode.is_read_only() }

    // ========================================================================
    // Commit / rollback
    // ========================================================================

    async fn commit(&self) -> Result<()> {
        self.base.check_active()?;
        let mut inner = self.inner.lock().await;
        self.base.transition(UnitOfWorkState::Committing)?;

        if self.is_read_only() {
            inner.tx = None;
            tracing::debug!("closed read-only transaction");
            return self.base.transition(UnitOfWorkState::Committed);
        }

        if let Some(poison) = &inner.poisoned {
            let err = poison.error();
            tracing::debug!(error = %err, "commit of a failed transaction refused");
            self.base.transition(UnitOfWorkState::CommitFailed)?;
            return Err(err);
        }

        match self.commit_with_retry(&mut inner).await {
            Ok(response) => {
                tracing::debug!(commit_timestamp = %response.commit_timestamp, "transaction committed");
                inner.mutations.clear();
                inner.replay.clear();
                self.outcome.lock().commit_response = Some(response);
                self.base.transition(UnitOfWorkState::Committed)
            }
            Err(e) => {
                tracing::debug!(error = %e, "commit failed");
                if let Some(tx) = inner.tx.take() {
                    if let Err(rollback_err) = self.backend.rollback(tx).await {
                        tracing::warn!(error = %rollback_err, "rollback after failed commit failed");
                    }
                }
                self.base.transition(UnitOfWorkState::CommitFailed)?;
                Err(e)
            }
        }
    }

    async fn rollback(&self) -> Result<()> {
        self.base.check_active()?;
        let mut inner = self.inner.lock().await;
        self.base.transition(UnitOfWorkState::RolledBack)?;

        inner.mutations.clear();
        inner.replay.clear();
        inner.poisoned = None;
        if let Some(tx) = inner.tx.take() {
            if !self.is_read_only() {
                if let Err(e) = self.backend.rollback(tx).await {
                    tracing::warn!(error = %e, "rollback failed");
                }
            }
        }
        tracing::debug!("transaction rolled back");
        Ok(())
    }

    // ========================================================================
    // Timestamps
    // ========================================================================

    fn read_timestamp(&self) -> Result<Timestamp> {
        self.read_timestamp_or_none().ok_or(Error::ValueNotAvailable("read timestamp"))
    }

    fn read_timestamp_or_none(&self) -> Option<Timestamp> {
        self.outcome.lock().read_timestamp
    }

    fn commit_timestamp(&self) -> Result<Timestamp> {
        self.commit_timestamp_or_none().ok_or(Error::ValueNotAvailable("commit timestamp"))
    }

    fn commit_timestamp_or_none(&self) -> Option<Timestamp> {
        self.outcome.lock().commit_response.as_ref().map(|r| r.commit_timestamp)
    }

    fn commit_response(&self) -> Result<CommitResponse> {
        self.commit_response_or_none().ok_or(Error::ValueNotAvailable("commit response"))
    }

    fn commit_response_or_none(&self) -> Option<CommitResponse> {
        self.outcome.lock().commit_response.clone()
    }

    // ========================================================================
    // Statements
    // ========================================================================

    async fn execute_query(
        &self,
        statement: &ParsedStatement,
        analyze_mode: AnalyzeMode,
        options: &QueryOptions,
    ) -> Result<ResultSet> {
        self.base.check_active()?;
        expect_kind(statement, StatementKind::Query)?;
        if analyze_mode != AnalyzeMode::None && !options.is_empty() {
            return Err(Error::InvalidUsage(
                "query options cannot be combined with an analyze mode".into(),
            ));
        }

        let op = StatementOp::Query {
            statement: statement.clone(),
            analyze_mode,
            options: options.clone(),
        };
        let result = match self.execute(op).await? {
            OpOutput::Rows(rs) => rs,
            _ => return Err(Error::backend(ErrorCode::Internal, "query returned no result set")),
        };

        if self.is_read_only() {
            let mut outcome = self.outcome.lock();
            if outcome.read_timestamp.is_none() {
                outcome.read_timestamp = result.read_timestamp;
            }
        }
        Ok(result)
    }

    /// DDL is never part of the transaction context: it is sent directly.
    async fn execute_ddl(&self, statement: &ParsedStatement) -> Result<()> {
        self.base.check_active()?;
        expect_kind(statement, StatementKind::Ddl)?;
        self.reject_in_read_only("DDL statements are")?;

        let inner = self.inner.lock().await;
        self.check_usable(&inner)?;
        tracing::info!(sql = %statement.sql, "executing DDL");
        let outcome = self
            .base
            .cancellable(async { Ok(self.backend.execute_ddl(slice::from_ref(statement)).await) })
            .await?;
        outcome.into_result().map(|_| ())
    }

    async fn execute_update(&self, statement: &ParsedStatement, options: &UpdateOptions) -> Result<i64> {
        self.base.check_active()?;
        expect_kind(statement, StatementKind::Update)?;
        self.reject_in_read_only("DML statements are")?;

        let op = StatementOp::Update { statement: statement.clone(), options: options.clone() };
        match self.execute(op).await? {
            OpOutput::Count(n) => Ok(n),
            _ => Err(Error::backend(ErrorCode::Internal, "update returned no update count")),
        }
    }

    async fn execute_batch_update(
        &self,
        statements: &[ParsedStatement],
        options: &UpdateOptions,
    ) -> Result<Vec<i64>> {
        self.base.check_active()?;
        for statement in statements {
            expect_kind(statement, StatementKind::Update)?;
        }
        self.reject_in_read_only("DML statements are")?;
        if statements.is_empty() {
            return Ok(Vec::new());
        }

        let op = StatementOp::BatchUpdate { statements: statements.to_vec(), options: options.clone() };
        match self.execute(op).await? {
            OpOutput::Counts(counts) => Ok(counts),
            _ => Err(Error::backend(ErrorCode::Internal, "batch update returned no update counts")),
        }
    }

    /// Buffers the mutations until commit. Never issues an RPC.
    async fn write(&self, mutations: Vec<Mutation>) -> Result<()> {
        self.base.check_active()?;
        self.reject_in_read_only("mutations are")?;
        let mut inner = self.inner.lock().await;
        self.check_usable(&inner)?;
        inner.mutations.extend(mutations);
        Ok(())
    }
}
