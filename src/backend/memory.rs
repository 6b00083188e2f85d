//! In-memory backend.
//!
//! This is the reference implementation of `SpannerRpc`. It does not parse
//! SQL: results are scripted per statement text, and every RPC is recorded
//! in a call log so callers can check exactly what reached the "server".
//!
//! ## Fault injection
//!
//! - `abort_next_commits(n)`: the next `n` commits fail with `Error::Aborted`
//! - `abort_next_statements(n)`: the next `n` query/DML RPCs fail with `Error::Aborted`
//! - `put_statement_error()` / `put_ddl_error()`: non-transient failures
//! - `set_statement_delay()`: slow statements, for cancellation
//!
//! Scripted results can be swapped between calls, which is how a concurrent
//! modification is simulated: the replay after an abort sees different rows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::{Mutex, RwLock};

use crate::model::*;
use crate::tx::{Transaction, TxId, TxMode, TxOptions};
use crate::{Error, ErrorCode, Result};
use super::{DdlOutcome, SpannerRpc};

/// 2024-01-01T00:00:00Z
const EPOCH_MICROS: i64 = 1_704_067_200_000_000;

type Scripted<T> = std::result::Result<T, (ErrorCode, String)>;

// ============================================================================
// Call log
// ============================================================================

/// One RPC as received by the in-memory service.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcCall {
    BeginTransaction { tx: TxId, mode: TxMode, directives: Vec<String> },
    ExecuteQuery { tx: TxId, sql: String },
    ExecuteUpdate { tx: TxId, sql: String },
    ExecuteBatchUpdate { tx: TxId, sqls: Vec<String> },
    ExecuteDdl { sqls: Vec<String> },
    Commit { tx: TxId, mutations: usize },
    Rollback { tx: TxId },
}

// ============================================================================
// MemoryBackend
// ============================================================================

/// Scripted in-memory database service. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    queries: RwLock<HashMap<String, Scripted<ResultSet>>>,
    updates: RwLock<HashMap<String, Scripted<i64>>>,
    ddl_errors: RwLock<HashMap<String, (ErrorCode, String)>>,
    delays: RwLock<HashMap<String, Duration>>,
    pending_commit_aborts: AtomicU32,
    pending_statement_aborts: AtomicU32,
    calls: Mutex<Vec<RpcCall>>,
    committed: Mutex<Vec<Mutation>>,
    /// Microseconds since the epoch, advanced on every commit and read-only begin.
    clock: AtomicI64,
    next_tx_id: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                clock: AtomicI64::new(EPOCH_MICROS),
                next_tx_id: AtomicU64::new(1),
                ..Default::default()
            }),
        }
    }

    // ========================================================================
    // Scripting
    // ========================================================================

    /// Register the result returned for a query.
    pub fn put_query_result(&self, sql: &str, result: ResultSet) {
        self.inner.queries.write().insert(key(sql), Ok(result));
    }

    /// Register the affected-row count returned for a DML statement.
    pub fn put_update_count(&self, sql: &str, count: i64) {
        self.inner.updates.write().insert(key(sql), Ok(count));
    }

    /// Make a query or DML statement fail with a non-transient error.
    pub fn put_statement_error(&self, sql: &str, code: ErrorCode, message: &str) {
        let k = key(sql);
        let err = (code, message.to_string());
        self.inner.queries.write().insert(k.clone(), Err(err.clone()));
        self.inner.updates.write().insert(k, Err(err));
    }

    /// Make a DDL statement fail. Statements after it in the same RPC are not applied.
    pub fn put_ddl_error(&self, sql: &str, code: ErrorCode, message: &str) {
        self.inner.ddl_errors.write().insert(key(sql), (code, message.to_string()));
    }

    /// Delay the response to a statement.
    pub fn set_statement_delay(&self, sql: &str, delay: Duration) {
        self.inner.delays.write().insert(key(sql), delay);
    }

    pub fn abort_next_commits(&self, n: u32) {
        self.inner.pending_commit_aborts.store(n, Ordering::SeqCst);
    }

    pub fn abort_next_statements(&self, n: u32) {
        self.inner.pending_statement_aborts.store(n, Ordering::SeqCst);
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Every RPC received so far, in arrival order.
    pub fn calls(&self) -> Vec<RpcCall> {
        self.inner.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.inner.calls.lock().clear();
    }

    /// Number of commit RPCs received, successful or not.
    pub fn commit_attempts(&self) -> usize {
        self.inner.calls.lock().iter().filter(|c| matches!(c, RpcCall::Commit { .. })).count()
    }

    /// All mutations applied by successful commits, in commit order.
    pub fn committed_mutations(&self) -> Vec<Mutation> {
        self.inner.committed.lock().clone()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn record(&self, call: RpcCall) {
        self.inner.calls.lock().push(call);
    }

    fn tick(&self) -> Timestamp {
        let micros = self.inner.clock.fetch_add(1_000, Ordering::SeqCst) + 1_000;
        Utc.timestamp_micros(micros).single().unwrap_or_default()
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn delay(&self, sql: &str) {
        let delay = self.inner.delays.read().get(&key(sql)).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }

    fn check_statement_abort(&self, tx: &MemoryTx) -> Result<()> {
        if Self::take(&self.inner.pending_statement_aborts) {
            return Err(Error::Aborted(format!("{} was aborted by a concurrent transaction", tx.id)));
        }
        Ok(())
    }

    fn lookup_update(&self, sql: &str) -> Result<i64> {
        match self.inner.updates.read().get(&key(sql)) {
            Some(Ok(n)) => Ok(*n),
            Some(Err((code, msg))) => Err(Error::backend(*code, msg.clone())),
            None => Err(Error::backend(ErrorCode::NotFound, format!("no update count registered for: {sql}"))),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self { Self::new() }
}

fn key(sql: &str) -> String {
    sql.trim().to_string()
}

// ============================================================================
// MemoryTx
// ============================================================================

/// In-memory transaction handle.
pub struct MemoryTx {
    id: TxId,
    mode: TxMode,
    /// Snapshot timestamp for read-only transactions.
    read_timestamp: Option<Timestamp>,
}

impl Transaction for MemoryTx {
    fn mode(&self) -> TxMode { self.mode }
    fn id(&self) -> TxId { self.id }
}

// ============================================================================
// SpannerRpc impl
// ============================================================================

#[async_trait]
impl SpannerRpc for MemoryBackend {
    type Tx = MemoryTx;

    async fn begin_transaction(&self, options: &TxOptions) -> Result<MemoryTx> {
        let id = TxId(self.inner.next_tx_id.fetch_add(1, Ordering::Relaxed));
        self.record(RpcCall::BeginTransaction {
            tx: id,
            mode: options.mode,
            directives: options.directives.clone(),
        });
        let read_timestamp = options.mode.is_read_only().then(|| self.tick());
        Ok(MemoryTx { id, mode: options.mode, read_timestamp })
    }

    async fn commit(&self, tx: MemoryTx, mutations: Vec<Mutation>) -> Result<CommitResponse> {
        self.record(RpcCall::Commit { tx: tx.id, mutations: mutations.len() });
        if Self::take(&self.inner.pending_commit_aborts) {
            return Err(Error::Aborted(format!("{} was aborted by a concurrent transaction", tx.id)));
        }
        let count = mutations.len() as u64;
        self.inner.committed.lock().extend(mutations);
        Ok(CommitResponse { commit_timestamp: self.tick(), mutation_count: Some(count) })
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<()> {
        self.record(RpcCall::Rollback { tx: tx.id });
        Ok(())
    }

    async fn execute_query(
        &self,
        tx: &mut MemoryTx,
        statement: &ParsedStatement,
        analyze_mode: AnalyzeMode,
        _options: &QueryOptions,
    ) -> Result<ResultSet> {
        self.record(RpcCall::ExecuteQuery { tx: tx.id, sql: key(&statement.sql) });
        self.delay(&statement.sql).await;
        self.check_statement_abort(tx)?;

        let scripted = self.inner.queries.read().get(&key(&statement.sql)).cloned();
        let mut result = match scripted {
            Some(Ok(rs)) => rs,
            Some(Err((code, msg))) => return Err(Error::backend(code, msg)),
            None => {
                return Err(Error::backend(
                    ErrorCode::NotFound,
                    format!("no result registered for: {}", statement.sql),
                ))
            }
        };

        result.read_timestamp = tx.read_timestamp;
        match analyze_mode {
            AnalyzeMode::None => {}
            AnalyzeMode::Plan => {
                result.rows.clear();
                result.stats = Some(ResultSetStats {
                    query_plan: format!("Serialize Result <- Scan [{}]", key(&statement.sql)),
                    rows_returned: None,
                    elapsed_ms: None,
                });
            }
            AnalyzeMode::Profile => {
                result.stats = Some(ResultSetStats {
                    query_plan: format!("Serialize Result <- Scan [{}]", key(&statement.sql)),
                    rows_returned: Some(result.rows.len() as u64),
                    elapsed_ms: Some(0),
                });
            }
        }
        Ok(result)
    }

    async fn execute_update(
        &self,
        tx: &mut MemoryTx,
        statement: &ParsedStatement,
        _options: &UpdateOptions,
    ) -> Result<i64> {
        self.record(RpcCall::ExecuteUpdate { tx: tx.id, sql: key(&statement.sql) });
        self.delay(&statement.sql).await;
        self.check_statement_abort(tx)?;
        if tx.mode.is_read_only() {
            return Err(Error::backend(ErrorCode::FailedPrecondition, "DML is not allowed in a read-only transaction"));
        }
        self.lookup_update(&statement.sql)
    }

    async fn execute_batch_update(
        &self,
        tx: &mut MemoryTx,
        statements: &[ParsedStatement],
        _options: &UpdateOptions,
    ) -> Result<Vec<i64>> {
        self.record(RpcCall::ExecuteBatchUpdate {
            tx: tx.id,
            sqls: statements.iter().map(|s| key(&s.sql)).collect(),
        });
        self.check_statement_abort(tx)?;

        let mut counts = Vec::with_capacity(statements.len());
        for statement in statements {
            self.delay(&statement.sql).await;
            match self.lookup_update(&statement.sql) {
                Ok(n) => counts.push(n),
                Err(e) => {
                    return Err(Error::BatchUpdate { update_counts: counts, source: Box::new(e) });
                }
            }
        }
        Ok(counts)
    }

    async fn execute_ddl(&self, statements: &[ParsedStatement]) -> DdlOutcome {
        self.record(RpcCall::ExecuteDdl {
            sqls: statements.iter().map(|s| key(&s.sql)).collect(),
        });
        for (i, statement) in statements.iter().enumerate() {
            self.delay(&statement.sql).await;
            if let Some((code, msg)) = self.inner.ddl_errors.read().get(&key(&statement.sql)).cloned() {
                return DdlOutcome::failed(i, Error::backend(code, msg));
            }
        }
        DdlOutcome::success(statements.len())
    }
}
