//! Query results, execution options and commit responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Value;
use crate::{Error, Result};

/// Commit and read timestamps.
pub type Timestamp = DateTime<Utc>;

/// One result row, values in column order.
pub type Row = Vec<Value>;

/// Fully materialized query result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Present only when the query ran with `AnalyzeMode::Plan` or `AnalyzeMode::Profile`.
    pub stats: Option<ResultSetStats>,
    /// Snapshot timestamp, reported by the backend for read-only contexts.
    pub read_timestamp: Option<Timestamp>,
}

impl ResultSet {
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>, rows: Vec<Row>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows,
            stats: None,
            read_timestamp: None,
        }
    }

    pub fn len(&self) -> usize { self.rows.len() }
    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    /// Value at `row` for the named column.
    pub fn get(&self, row: usize, column: &str) -> Result<&Value> {
        let idx = self.columns.iter().position(|c| c == column)
            .ok_or_else(|| Error::InvalidUsage(format!("unknown column '{column}'")))?;
        self.rows.get(row)
            .and_then(|r| r.get(idx))
            .ok_or_else(|| Error::InvalidUsage(format!("row {row} out of range")))
    }
}

/// Plan/profile statistics attached to an analyzed query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSetStats {
    pub query_plan: String,
    pub rows_returned: Option<u64>,
    pub elapsed_ms: Option<u64>,
}

/// Whether to attach execution statistics to a query result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalyzeMode {
    #[default]
    None,
    /// Return the query plan only, without rows.
    Plan,
    /// Execute and return rows plus the plan and execution profile.
    Profile,
}

/// Request priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Per-query options. Mutually exclusive with a non-`None` analyze mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryOptions {
    pub optimizer_version: Option<String>,
    pub optimizer_statistics_package: Option<String>,
    pub request_tag: Option<String>,
    pub priority: Option<Priority>,
}

impl QueryOptions {
    pub fn is_empty(&self) -> bool {
        self.optimizer_version.is_none()
            && self.optimizer_statistics_package.is_none()
            && self.request_tag.is_none()
            && self.priority.is_none()
    }
}

/// Per-DML options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateOptions {
    pub request_tag: Option<String>,
    pub priority: Option<Priority>,
}

/// What the backend returns for a successful commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResponse {
    pub commit_timestamp: Timestamp,
    /// Number of mutations applied, when commit stats were collected.
    pub mutation_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_options_empty() {
        assert!(QueryOptions::default().is_empty());
        let opts = QueryOptions { request_tag: Some("tag".into()), ..Default::default() };
        assert!(!opts.is_empty());
    }

    #[test]
    fn test_result_set_get() {
        let rs = ResultSet::new(["id", "name"], vec![vec![Value::from(1), Value::from("a")]]);
        assert_eq!(rs.get(0, "name").unwrap(), &Value::from("a"));
        assert!(rs.get(0, "missing").is_err());
        assert!(rs.get(3, "id").is_err());
    }
}
