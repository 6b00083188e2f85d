//! Statement classification.
//!
//! The coordinator needs to know whether raw SQL is a query, DML, DDL or a
//! client-side statement before it can route it. Real SQL parsing belongs to
//! the caller; `KeywordClassifier` is a lightweight default that looks at
//! the leading keyword only.

use crate::model::{ParsedStatement, Statement, StatementKind};
use crate::{Error, Result};

/// Turns raw statements into classified ones.
pub trait StatementClassifier: Send + Sync {
    fn classify(&self, statement: Statement) -> Result<ParsedStatement>;
}

/// Classifies by the first keyword after leading comments.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

const QUERY_KEYWORDS: &[&str] = &["SELECT", "WITH", "GRAPH"];
const DML_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE"];
const DDL_KEYWORDS: &[&str] = &["CREATE", "DROP", "ALTER", "ANALYZE", "GRANT", "REVOKE", "RENAME"];

impl StatementClassifier for KeywordClassifier {
    fn classify(&self, mut statement: Statement) -> Result<ParsedStatement> {
        let sql = normalize(&statement.sql);
        if sql.is_empty() {
            return Err(Error::InvalidUsage("empty statement".into()));
        }

        let mut words = sql.trim_start_matches('(').split_whitespace().map(str::to_ascii_uppercase);
        let first = words.next().unwrap_or_default();
        let second = words.next().unwrap_or_default();
        let kind = match first.as_str() {
            "SET" if second == "TRANSACTION" => StatementKind::ClientSide,
            w if QUERY_KEYWORDS.contains(&w) => StatementKind::Query,
            w if DML_KEYWORDS.contains(&w) => StatementKind::Update,
            w if DDL_KEYWORDS.contains(&w) => StatementKind::Ddl,
            _ => return Err(Error::InvalidUsage(format!("unknown statement: {sql}"))),
        };

        statement.sql = sql;
        Ok(ParsedStatement::new(kind, statement))
    }
}

/// Strip leading comments, surrounding whitespace and a trailing semicolon.
fn normalize(sql: &str) -> String {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else {
            break;
        }
    }
    rest.trim_end().trim_end_matches(';').trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(sql: &str) -> StatementKind {
        KeywordClassifier.classify(Statement::new(sql)).unwrap().kind
    }

    #[test]
    fn test_classify_kinds() {
        assert_eq!(kind("SELECT 1"), StatementKind::Query);
        assert_eq!(kind("  with t as (select 1) select * from t"), StatementKind::Query);
        assert_eq!(kind("(SELECT 1)"), StatementKind::Query);
        assert_eq!(kind("insert into T (a) values (1)"), StatementKind::Update);
        assert_eq!(kind("CREATE TABLE T (a INT64) PRIMARY KEY (a)"), StatementKind::Ddl);
        assert_eq!(kind("set transaction read only"), StatementKind::ClientSide);
    }

    #[test]
    fn test_comments_and_semicolon_are_stripped() {
        let parsed = KeywordClassifier
            .classify(Statement::new("-- note\n/* block */ UPDATE T SET a = 1;"))
            .unwrap();
        assert_eq!(parsed.kind, StatementKind::Update);
        assert_eq!(parsed.sql, "UPDATE T SET a = 1");
    }

    #[test]
    fn test_unknown_and_empty_rejected() {
        assert!(KeywordClassifier.classify(Statement::new("   ")).is_err());
        assert!(KeywordClassifier.classify(Statement::new("VACUUM")).is_err());
        assert!(KeywordClassifier.classify(Statement::new("SET autocommit = true")).is_err());
    }

    #[test]
    fn test_params_survive() {
        let parsed = KeywordClassifier
            .classify(Statement::new("SELECT * FROM T WHERE id = @id").with_param("id", 3))
            .unwrap();
        assert_eq!(parsed.params.get("id"), Some(&crate::Value::from(3)));
    }
}
