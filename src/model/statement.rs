//! SQL statements as they flow into a unit of work.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use super::Value;

/// Named query parameters (`@name` / `$1`).
pub type ParamMap = HashMap<String, Value>;

/// A raw SQL statement plus its bound parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: ParamMap,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), params: ParamMap::new() }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self { Statement::new(sql) }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self { Statement::new(sql) }
}

/// What a statement does, as decided by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementKind {
    Query,
    Update,
    Ddl,
    /// Handled by the connection itself, never sent as SQL (e.g. `SET TRANSACTION READ ONLY`).
    ClientSide,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatementKind::Query => "query",
            StatementKind::Update => "DML",
            StatementKind::Ddl => "DDL",
            StatementKind::ClientSide => "client-side statement",
        };
        f.write_str(s)
    }
}

/// A classified statement. `sql` holds the normalized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedStatement {
    pub kind: StatementKind,
    pub sql: String,
    pub params: ParamMap,
}

impl ParsedStatement {
    pub fn new(kind: StatementKind, statement: Statement) -> Self {
        Self { kind, sql: statement.sql, params: statement.params }
    }

    pub fn query(sql: impl Into<String>) -> Self {
        Self::new(StatementKind::Query, Statement::new(sql))
    }

    pub fn update(sql: impl Into<String>) -> Self {
        Self::new(StatementKind::Update, Statement::new(sql))
    }

    pub fn ddl(sql: impl Into<String>) -> Self {
        Self::new(StatementKind::Ddl, Statement::new(sql))
    }

    pub fn is_query(&self) -> bool { self.kind == StatementKind::Query }
    pub fn is_update(&self) -> bool { self.kind == StatementKind::Update }
    pub fn is_ddl(&self) -> bool { self.kind == StatementKind::Ddl }
}
