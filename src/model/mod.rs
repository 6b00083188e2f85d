//! # Connection Data Model
//!
//! Plain DTOs that cross every boundary: caller ↔ coordinator ↔ unit of work ↔ backend.
//!
//! Design rule: no RPC types and no SQL parsing here.

pub mod value;
pub mod statement;
pub mod mutation;
pub mod result;

pub use value::Value;
pub use statement::{Statement, ParsedStatement, StatementKind, ParamMap};
pub use mutation::{Mutation, MutationOp};
pub use result::{
    ResultSet, ResultSetStats, Row, Timestamp,
    AnalyzeMode, QueryOptions, UpdateOptions, Priority, CommitResponse,
};
