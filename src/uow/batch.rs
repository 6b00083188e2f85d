//! DML and DDL batches.
//!
//! A batch buffers statements locally and sends them as one call only when
//! `run_batch` is invoked. The first buffered statement fixes whether the
//! batch is DML or DDL; the other kind is rejected from then on.

use std::mem;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::SpannerRpc;
use crate::model::*;
use crate::tx::TxOptions;
use crate::{Error, Result};
use super::retry::RetryPolicy;
use super::{expect_kind, UnitOfWork, UnitOfWorkBase, UnitOfWorkState, UnitOfWorkType};

/// A DML or DDL batch.
pub struct BatchWorkUnit<B: SpannerRpc> {
    base: UnitOfWorkBase,
    backend: Arc<B>,
    retry: RetryPolicy,
    /// Set for batches opened on a read-only connection. Nothing can be buffered.
    read_only: bool,
    /// Never held across an await, so `abort_batch` stays non-blocking.
    inner: Mutex<BatchInner>,
}

#[derive(Default)]
struct BatchInner {
    /// `Update` or `Ddl` once the first statement is buffered.
    kind: Option<StatementKind>,
    statements: Vec<ParsedStatement>,
    options: UpdateOptions,
}

impl<B: SpannerRpc> BatchWorkUnit<B> {
    pub fn new(backend: Arc<B>, retry: RetryPolicy) -> Self {
        Self {
            base: UnitOfWorkBase::new(UnitOfWorkType::Batch),
            backend,
            retry,
            read_only: false,
            inner: Mutex::new(BatchInner::default()),
        }
    }

    /// Reject every statement, as a read-only connection must.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Number of statements buffered so far.
    pub fn buffered(&self) -> usize {
        self.inner.lock().statements.len()
    }

    /// Whether the batch holds DML, DDL, or nothing yet.
    pub fn statement_kind(&self) -> Option<StatementKind> {
        self.inner.lock().kind
    }

    fn buffer(&self, statement: &ParsedStatement, options: Option<&UpdateOptions>) -> Result<()> {
        let mut inner = self.inner.lock();
        self.base.check_active()?;
        if self.read_only {
            return Err(Error::InvalidUsage(format!(
                "{} statements are not allowed in a read-only batch",
                statement.kind
            )));
        }
        match inner.kind {
            Some(kind) if kind != statement.kind => {
                return Err(Error::InvalidUsage(format!(
                    "cannot add a {} statement to a {kind} batch: {}",
                    statement.kind, statement.sql
                )));
            }
            Some(_) => {}
            None => {
                inner.kind = Some(statement.kind);
                if let Some(options) = options {
                    inner.options = options.clone();
                }
            }
        }
        inner.statements.push(statement.clone());
        Ok(())
    }

    /// DDL: 1 per applied statement, 0 for the failed one and all after it.
    async fn run_ddl(&self, statements: &[ParsedStatement]) -> Result<Vec<i64>> {
        tracing::info!(statements = statements.len(), "running DDL batch");
        let outcome = self.backend.execute_ddl(statements).await;
        let counts: Vec<i64> = (0..statements.len())
            .map(|i| i64::from(i < outcome.completed))
            .collect();
        match outcome.error {
            None => Ok(counts),
            Some(source) => Err(Error::BatchUpdate { update_counts: counts, source: Box::new(source) }),
        }
    }

    /// DML: one read-write transaction holding the whole batch. Aborts rerun it.
    async fn run_dml(&self, statements: &[ParsedStatement], options: &UpdateOptions) -> Result<Vec<i64>> {
        tracing::debug!(statements = statements.len(), "running DML batch");
        let mut aborts = 0;
        loop {
            let result = self.run_dml_once(statements, options).await;
            match result {
                Err(e) if e.is_aborted() && self.retry.allows_retry(aborts + 1) => {
                    aborts += 1;
                    let delay = self.retry.backoff(aborts);
                    tracing::warn!(attempt = aborts, delay_ms = delay.as_millis() as u64, "DML batch aborted, retrying");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn run_dml_once(&self, statements: &[ParsedStatement], options: &UpdateOptions) -> Result<Vec<i64>> {
        let mut tx = self.backend.begin_transaction(&TxOptions::read_write()).await?;
        match self.backend.execute_batch_update(&mut tx, statements, options).await {
            Ok(counts) => {
                self.backend.commit(tx, Vec::new()).await?;
                Ok(counts)
            }
            Err(e) => {
                if !e.is_aborted() {
                    if let Err(rollback_err) = self.backend.rollback(tx).await {
                        tracing::warn!(error = %rollback_err, "rollback of failed DML batch failed");
                    }
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<B: SpannerRpc> UnitOfWork for BatchWorkUnit<B> {
    fn base(&self) -> &UnitOfWorkBase { &self.base }

    fn is_read_only(&self) -> bool { self.read_only }

    async fn run_batch(&self) -> Result<Vec<i64>> {
        let (kind, statements, options) = {
            let mut inner = self.inner.lock();
            self.base.transition(UnitOfWorkState::Running)?;
            (inner.kind, mem::take(&mut inner.statements), mem::take(&mut inner.options))
        };

        let result = match kind {
            None => Ok(Vec::new()),
            Some(StatementKind::Ddl) => self.base.cancellable(self.run_ddl(&statements)).await,
            Some(_) => self.base.cancellable(self.run_dml(&statements, &options)).await,
        };

        match &result {
            Ok(counts) => {
                tracing::debug!(statements = counts.len(), "batch ran");
                self.base.transition(UnitOfWorkState::Ran)?;
            }
            Err(e) => {
                tracing::debug!(error = %e, "batch failed");
                self.base.transition(UnitOfWorkState::RunFailed)?;
            }
        }
        result
    }

    fn abort_batch(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.base.transition(UnitOfWorkState::Aborted)?;
        inner.statements.clear();
        tracing::debug!("batch aborted");
        Ok(())
    }

    /// Buffers the statement; the count is only known after `run_batch`, so this returns -1.
    async fn execute_update(&self, statement: &ParsedStatement, options: &UpdateOptions) -> Result<i64> {
        expect_kind(statement, StatementKind::Update)?;
        self.buffer(statement, Some(options))?;
        Ok(-1)
    }

    /// Buffers the statement until `run_batch`.
    async fn execute_ddl(&self, statement: &ParsedStatement) -> Result<()> {
        expect_kind(statement, StatementKind::Ddl)?;
        self.buffer(statement, None)
    }
}
