//! The caller-facing coordinator.
//!
//! A `Connection` owns at most one active unit of work and routes every
//! operation to it. Without an active unit, a data statement implicitly
//! begins a transaction, or, in autocommit mode, runs in a single-use unit
//! that is committed right away. DDL outside a unit always runs on its own.

use std::future::Future;
use std::mem;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::SpannerRpc;
use crate::classifier::{KeywordClassifier, StatementClassifier};
use crate::model::*;
use crate::tx::mode::{self, Dialect, TransactionMode};
use crate::tx::{TxMode, TxOptions};
use crate::uow::batch::BatchWorkUnit;
use crate::uow::retry::RetryPolicy;
use crate::uow::transaction::TransactionWorkUnit;
use crate::uow::{UnitOfWork, UnitOfWorkType};
use crate::{Error, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Connection settings. Every field has a default, so partial JSON works.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub dialect: Dialect,
    /// New transactions are read-only.
    pub read_only: bool,
    /// Every statement outside an explicit unit commits on its own.
    pub autocommit: bool,
    /// Replay aborted transactions instead of surfacing the abort.
    pub retry_aborts_internally: bool,
    pub max_commit_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            dialect: Dialect::GoogleStandardSql,
            read_only: false,
            autocommit: false,
            retry_aborts_internally: true,
            max_commit_attempts: 10,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 1_000,
        }
    }
}

impl ConnectionOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Statement result
// ============================================================================

/// What `Connection::execute` returns, depending on the statement kind.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementResult {
    ResultSet(ResultSet),
    UpdateCount(i64),
    NoResult,
}

impl StatementResult {
    pub fn into_result_set(self) -> Result<ResultSet> {
        match self {
            StatementResult::ResultSet(rs) => Ok(rs),
            other => Err(Error::InvalidUsage(format!("statement did not return rows: {other:?}"))),
        }
    }

    pub fn update_count(&self) -> Option<i64> {
        match self {
            StatementResult::UpdateCount(n) => Some(*n),
            _ => None,
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Read,
    Write,
}

/// One logical connection: at most one active unit of work at a time.
pub struct Connection<B: SpannerRpc> {
    backend: Arc<B>,
    options: ConnectionOptions,
    classifier: Box<dyn StatementClassifier>,
    current: Option<Arc<dyn UnitOfWork>>,
    /// The most recently finished unit, for timestamp introspection.
    last: Option<Arc<dyn UnitOfWork>>,
    /// Options for the next transaction, including `SET TRANSACTION` directives.
    next_tx: TxOptions,
}

impl<B: SpannerRpc> Connection<B> {
    pub fn new(backend: B, options: ConnectionOptions) -> Self {
        let next_tx = Self::default_tx_options(&options);
        Self {
            backend: Arc::new(backend),
            options,
            classifier: Box::new(KeywordClassifier),
            current: None,
            last: None,
            next_tx,
        }
    }

    pub fn with_classifier(mut self, classifier: impl StatementClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn options(&self) -> &ConnectionOptions { &self.options }

    pub fn backend(&self) -> &B { &self.backend }

    fn default_tx_options(options: &ConnectionOptions) -> TxOptions {
        if options.read_only { TxOptions::read_only() } else { TxOptions::read_write() }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_options(&self.options)
    }

    fn ensure_idle(&self, what: &str) -> Result<()> {
        match &self.current {
            Some(unit) => Err(Error::InvalidUsage(format!(
                "cannot {what} while a {} is active",
                unit.unit_type()
            ))),
            None => Ok(()),
        }
    }

    fn finish_if_done(&mut self) {
        if self.current.as_ref().is_some_and(|u| u.state().is_terminal()) {
            self.last = self.current.take();
        }
    }

    fn transaction(&self, options: TxOptions) -> Arc<dyn UnitOfWork> {
        Arc::new(TransactionWorkUnit::new(self.backend.clone(), options, self.retry_policy()))
    }

    fn take_next_tx(&mut self) -> TxOptions {
        let defaults = Self::default_tx_options(&self.options);
        mem::replace(&mut self.next_tx, defaults)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.ensure_idle("change read-only mode")?;
        self.options.read_only = read_only;
        self.next_tx = Self::default_tx_options(&self.options);
        Ok(())
    }

    pub fn set_autocommit(&mut self, autocommit: bool) -> Result<()> {
        self.ensure_idle("change autocommit mode")?;
        self.options.autocommit = autocommit;
        Ok(())
    }

    /// Select a mode for the next transaction. Rejected for the connection's
    /// dialect before anything is sent.
    pub fn set_transaction_mode(&mut self, mode: TransactionMode) -> Result<()> {
        let directive = mode::directive(self.options.dialect, mode)?;
        self.ensure_idle("set the transaction mode")?;
        if self.options.read_only && mode == TransactionMode::ReadWrite {
            return Err(Error::InvalidUsage("cannot start a read-write transaction on a read-only connection".into()));
        }
        if let Some(access) = mode.access_mode() {
            self.next_tx.mode = access;
        }
        if let Some(isolation) = mode.isolation_level() {
            self.next_tx.isolation = isolation;
        }
        self.next_tx.directives.push(directive.to_string());
        Ok(())
    }

    // ========================================================================
    // Unit lifecycle
    // ========================================================================

    /// Begin an explicit transaction. No RPC is sent until the first statement.
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.ensure_idle("begin a transaction")?;
        let options = self.take_next_tx();
        tracing::debug!(mode = ?options.mode, "begin explicit transaction");
        self.current = Some(self.transaction(options));
        Ok(())
    }

    /// Start buffering a DML or DDL batch.
    pub fn start_batch(&mut self) -> Result<()> {
        self.ensure_idle("start a batch")?;
        tracing::debug!("start batch");
        let batch = BatchWorkUnit::new(self.backend.clone(), self.retry_policy()).read_only(self.options.read_only);
        self.current = Some(Arc::new(batch));
        Ok(())
    }

    pub fn is_in_transaction(&self) -> bool {
        self.current.as_ref().is_some_and(|u| u.unit_type() == UnitOfWorkType::Transaction)
    }

    pub fn is_in_batch(&self) -> bool {
        self.current.as_ref().is_some_and(|u| u.unit_type() == UnitOfWorkType::Batch)
    }

    /// The active unit. Clone it to cancel from another task.
    pub fn current_unit(&self) -> Option<Arc<dyn UnitOfWork>> {
        self.current.clone()
    }

    /// Commit the active transaction. A no-op when nothing is active.
    pub async fn commit(&mut self) -> Result<()> {
        let Some(unit) = self.current.clone() else { return Ok(()) };
        let result = unit.commit().await;
        self.finish_if_done();
        result
    }

    /// Roll back the active transaction. A no-op when nothing is active.
    pub async fn rollback(&mut self) -> Result<()> {
        let Some(unit) = self.current.clone() else { return Ok(()) };
        let result = unit.rollback().await;
        self.finish_if_done();
        result
    }

    pub async fn run_batch(&mut self) -> Result<Vec<i64>> {
        let unit = self.current.clone().ok_or_else(|| Error::InvalidUsage("no batch is active".into()))?;
        let result = unit.run_batch().await;
        self.finish_if_done();
        result
    }

    pub fn abort_batch(&mut self) -> Result<()> {
        let unit = self.current.clone().ok_or_else(|| Error::InvalidUsage("no batch is active".into()))?;
        let result = unit.abort_batch();
        self.finish_if_done();
        result
    }

    /// Cancel the statement running on the active unit, if any.
    pub fn cancel(&self) {
        if let Some(unit) = &self.current {
            unit.cancel();
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Classify and execute raw SQL.
    pub async fn execute(&mut self, statement: impl Into<Statement>) -> Result<StatementResult> {
        let parsed = self.classifier.classify(statement.into())?;
        match parsed.kind {
            StatementKind::ClientSide => {
                self.execute_client_side(&parsed)?;
                Ok(StatementResult::NoResult)
            }
            StatementKind::Query => self
                .execute_query(parsed, AnalyzeMode::None, QueryOptions::default())
                .await
                .map(StatementResult::ResultSet),
            StatementKind::Update => self
                .execute_update(parsed, UpdateOptions::default())
                .await
                .map(StatementResult::UpdateCount),
            StatementKind::Ddl => self.execute_ddl(parsed).await.map(|()| StatementResult::NoResult),
        }
    }

    fn execute_client_side(&mut self, statement: &ParsedStatement) -> Result<()> {
        let directive = statement.sql.split_whitespace().skip(2).collect::<Vec<_>>().join(" ");
        let mode = mode::parse(self.options.dialect, &directive)?;
        self.set_transaction_mode(mode)
    }

    pub async fn execute_query(
        &mut self,
        statement: ParsedStatement,
        analyze_mode: AnalyzeMode,
        options: QueryOptions,
    ) -> Result<ResultSet> {
        self.with_unit(Scope::Read, move |unit| async move {
            unit.execute_query(&statement, analyze_mode, &options).await
        })
        .await
    }

    pub async fn execute_update(&mut self, statement: ParsedStatement, options: UpdateOptions) -> Result<i64> {
        self.with_unit(Scope::Write, move |unit| async move {
            unit.execute_update(&statement, &options).await
        })
        .await
    }

    pub async fn execute_batch_update(
        &mut self,
        statements: Vec<ParsedStatement>,
        options: UpdateOptions,
    ) -> Result<Vec<i64>> {
        self.with_unit(Scope::Write, move |unit| async move {
            unit.execute_batch_update(&statements, &options).await
        })
        .await
    }

    /// DDL outside a unit runs on its own as a one-statement batch.
    pub async fn execute_ddl(&mut self, statement: ParsedStatement) -> Result<()> {
        if let Some(unit) = self.current.clone() {
            let result = unit.execute_ddl(&statement).await;
            self.finish_if_done();
            return result;
        }
        if self.options.read_only {
            return Err(Error::InvalidUsage("DDL statements are not allowed on a read-only connection".into()));
        }

        let batch: Arc<dyn UnitOfWork> = Arc::new(BatchWorkUnit::new(self.backend.clone(), self.retry_policy()));
        batch.execute_ddl(&statement).await?;
        let result = batch.run_batch().await;
        self.last = Some(batch);
        match result {
            Ok(_) => Ok(()),
            Err(Error::BatchUpdate { source, .. }) => Err(*source),
            Err(e) => Err(e),
        }
    }

    pub async fn write(&mut self, mutations: Vec<Mutation>) -> Result<()> {
        self.with_unit(Scope::Write, move |unit| async move { unit.write(mutations).await })
            .await
    }

    /// Route `op` to the active unit, or to an implicit/single-use one.
    async fn with_unit<T, F, Fut>(&mut self, scope: Scope, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn UnitOfWork>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(unit) = self.current.clone() {
            let result = op(unit).await;
            self.finish_if_done();
            return result;
        }

        if self.options.autocommit {
            let options = match scope {
                Scope::Read => TxOptions { mode: TxMode::ReadOnly, ..self.take_next_tx() },
                Scope::Write => self.take_next_tx(),
            };
            let unit = self.transaction(options);
            let result = op(unit.clone()).await;
            let end = match &result {
                Ok(_) => unit.commit().await,
                Err(_) => unit.rollback().await,
            };
            self.last = Some(unit);
            return match (result, end) {
                (Ok(value), Ok(())) => Ok(value),
                (Err(e), _) | (Ok(_), Err(e)) => Err(e),
            };
        }

        let options = self.take_next_tx();
        tracing::debug!(mode = ?options.mode, "begin implicit transaction");
        let unit = self.transaction(options);
        self.current = Some(unit.clone());
        let result = op(unit).await;
        self.finish_if_done();
        result
    }

    // ========================================================================
    // Timestamps
    // ========================================================================

    fn latest(&self) -> Option<&Arc<dyn UnitOfWork>> {
        self.current.as_ref().or(self.last.as_ref())
    }

    /// Read timestamp of the current (or last) read-only transaction.
    pub fn read_timestamp(&self) -> Result<Timestamp> {
        self.latest().ok_or(Error::ValueNotAvailable("read timestamp"))?.read_timestamp()
    }

    pub fn read_timestamp_or_none(&self) -> Option<Timestamp> {
        self.latest().and_then(|u| u.read_timestamp_or_none())
    }

    /// Commit timestamp of the last committed transaction.
    pub fn commit_timestamp(&self) -> Result<Timestamp> {
        self.last.as_ref().ok_or(Error::ValueNotAvailable("commit timestamp"))?.commit_timestamp()
    }

    pub fn commit_timestamp_or_none(&self) -> Option<Timestamp> {
        self.last.as_ref().and_then(|u| u.commit_timestamp_or_none())
    }

    pub fn commit_response(&self) -> Result<CommitResponse> {
        self.last.as_ref().ok_or(Error::ValueNotAvailable("commit response"))?.commit_response()
    }

    pub fn commit_response_or_none(&self) -> Option<CommitResponse> {
        self.last.as_ref().and_then(|u| u.commit_response_or_none())
    }
}
