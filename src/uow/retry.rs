//! Abort retry: backoff policy and the replay log.
//!
//! Under optimistic concurrency the server may abort a transaction at any
//! statement or at commit. Every read the transaction made is then void, so
//! the retry begins a fresh transaction and re-executes the whole recorded
//! statement sequence. Each replayed statement must produce exactly what the
//! caller already saw; any difference fails the retry with
//! `AbortedDueToConcurrentModification`.

use std::time::Duration;

use crate::connection::ConnectionOptions;
use crate::model::*;
use crate::{ErrorCode, Result};

// ============================================================================
// RetryPolicy
// ============================================================================

/// Bounded exponential backoff for aborted transactions.
///
/// The n-th retry waits `base_delay * 2^(n-1)`, capped at `max_delay`.
/// After `max_attempts` aborts in a row the abort is surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Total attempts, counting the original one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_options(options: &ConnectionOptions) -> Self {
        let base_delay = Duration::from_millis(options.retry_base_delay_ms);
        Self {
            enabled: options.retry_aborts_internally,
            max_attempts: options.max_commit_attempts.max(1),
            base_delay,
            max_delay: Duration::from_millis(options.retry_max_delay_ms).max(base_delay),
        }
    }

    /// Surface every abort to the caller.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Retry up to `max_attempts` without sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            enabled: true,
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Whether another attempt is allowed after `aborts` consecutive aborts.
    pub fn allows_retry(&self, aborts: u32) -> bool {
        self.enabled && aborts < self.max_attempts
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ============================================================================
// Replay log
// ============================================================================

/// A statement executed inside a transaction, kept for replay.
#[derive(Debug, Clone)]
pub(crate) enum StatementOp {
    Query { statement: ParsedStatement, analyze_mode: AnalyzeMode, options: QueryOptions },
    Update { statement: ParsedStatement, options: UpdateOptions },
    BatchUpdate { statements: Vec<ParsedStatement>, options: UpdateOptions },
}

impl StatementOp {
    /// SQL text for log messages.
    pub(crate) fn sql(&self) -> String {
        match self {
            StatementOp::Query { statement, .. } | StatementOp::Update { statement, .. } => {
                statement.sql.clone()
            }
            StatementOp::BatchUpdate { statements, .. } => {
                statements.iter().map(|s| s.sql.as_str()).collect::<Vec<_>>().join("; ")
            }
        }
    }
}

/// What a statement returned.
#[derive(Debug, Clone)]
pub(crate) enum OpOutput {
    Rows(ResultSet),
    Count(i64),
    Counts(Vec<i64>),
}

/// The part of a statement outcome the caller could observe.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Observed {
    Rows { columns: Vec<String>, rows: Vec<Row> },
    Count(i64),
    Counts(Vec<i64>),
    Failed { code: ErrorCode, update_counts: Option<Vec<i64>> },
}

impl Observed {
    pub(crate) fn of(result: &Result<OpOutput>) -> Self {
        match result {
            Ok(OpOutput::Rows(rs)) => Observed::Rows { columns: rs.columns.clone(), rows: rs.rows.clone() },
            Ok(OpOutput::Count(n)) => Observed::Count(*n),
            Ok(OpOutput::Counts(c)) => Observed::Counts(c.clone()),
            Err(e) => Observed::Failed {
                code: e.code(),
                update_counts: e.update_counts().map(<[i64]>::to_vec),
            },
        }
    }
}

/// Ordered record of every statement run in the current transaction.
#[derive(Debug, Default)]
pub(crate) struct ReplayLog {
    entries: Vec<(StatementOp, Observed)>,
}

impl ReplayLog {
    pub(crate) fn record(&mut self, op: StatementOp, observed: Observed) {
        self.entries.push((op, observed));
    }

    pub(crate) fn entries(&self) -> &[(StatementOp, Observed)] {
        &self.entries
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
