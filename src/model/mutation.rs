//! Buffered row mutations.

use serde::{Deserialize, Serialize};
use super::Value;

/// Kind of write a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOp {
    Insert,
    Update,
    InsertOrUpdate,
    Replace,
    Delete,
}

/// A single row write, sent to the backend together with the commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub op: MutationOp,
    pub table: String,
    pub columns: Vec<String>,
    /// One value per column. For `Delete`, the key values.
    pub values: Vec<Value>,
}

impl Mutation {
    fn new(op: MutationOp, table: impl Into<String>) -> Self {
        Self { op, table: table.into(), columns: Vec::new(), values: Vec::new() }
    }

    pub fn insert(table: impl Into<String>) -> Self { Self::new(MutationOp::Insert, table) }
    pub fn update(table: impl Into<String>) -> Self { Self::new(MutationOp::Update, table) }
    pub fn insert_or_update(table: impl Into<String>) -> Self { Self::new(MutationOp::InsertOrUpdate, table) }
    pub fn replace(table: impl Into<String>) -> Self { Self::new(MutationOp::Replace, table) }

    pub fn delete(table: impl Into<String>, key: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        let mut m = Self::new(MutationOp::Delete, table);
        m.values = key.into_iter().map(Into::into).collect();
        m
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.push(column.into());
        self.values.push(value.into());
        self
    }
}
