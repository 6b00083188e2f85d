//! End-to-end tests for the connection coordinator.
//!
//! Raw SQL goes through `Connection::execute`, which classifies it, routes
//! it to the active unit of work, or starts one when none is active.

use std::time::Duration;

use pretty_assertions::assert_eq;
use spanner_uow::backend::memory::RpcCall;
use spanner_uow::{
    Connection, ConnectionOptions, Dialect, Error, MemoryBackend, Mutation, ResultSet,
    StatementResult, TransactionMode, TxId, TxMode, UnitOfWorkState, Value,
};

// ============================================================================
// Helpers
// ============================================================================

fn backend() -> MemoryBackend {
    let db = MemoryBackend::new();
    db.put_query_result(
        "SELECT Title FROM Albums",
        ResultSet::new(["Title"], vec![vec![Value::from("Blue")], vec![Value::from("Red")]]),
    );
    db.put_update_count("UPDATE Albums SET Budget = 0", 2);
    db
}

fn connect(db: &MemoryBackend, options: ConnectionOptions) -> Connection<MemoryBackend> {
    Connection::new(db.clone(), options)
}

fn postgres() -> ConnectionOptions {
    ConnectionOptions { dialect: Dialect::PostgreSql, ..Default::default() }
}

fn autocommit() -> ConnectionOptions {
    ConnectionOptions { autocommit: true, ..Default::default() }
}

fn first_begin(db: &MemoryBackend) -> RpcCall {
    db.calls()
        .into_iter()
        .find(|c| matches!(c, RpcCall::BeginTransaction { .. }))
        .unwrap()
}

// ============================================================================
// 1. Implicit and explicit transactions
// ============================================================================

#[tokio::test]
async fn test_statement_begins_implicit_transaction() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());
    assert!(!conn.is_in_transaction());

    let result = conn.execute("UPDATE Albums SET Budget = 0").await.unwrap();
    assert_eq!(result.update_count(), Some(2));
    assert!(conn.is_in_transaction());
    assert_eq!(db.commit_attempts(), 0);

    conn.commit().await.unwrap();
    assert!(!conn.is_in_transaction());
    assert!(conn.commit_timestamp().is_ok());
}

#[tokio::test]
async fn test_explicit_transaction_with_mutations() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());

    conn.begin_transaction().unwrap();
    assert!(db.calls().is_empty(), "begin is lazy");
    conn.write(vec![Mutation::insert("Albums").set("Id", 7).set("Title", "Green")]).await.unwrap();
    conn.execute("UPDATE Albums SET Budget = 0").await.unwrap();
    conn.commit().await.unwrap();

    let response = conn.commit_response().unwrap();
    assert_eq!(response.mutation_count, Some(1));
    assert_eq!(conn.commit_timestamp().unwrap(), response.commit_timestamp);
}

#[tokio::test]
async fn test_rollback_ends_transaction() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());
    conn.execute("UPDATE Albums SET Budget = 0").await.unwrap();
    let unit = conn.current_unit().unwrap();

    conn.rollback().await.unwrap();
    assert_eq!(unit.state(), UnitOfWorkState::RolledBack);
    assert!(!conn.is_in_transaction());
    assert!(conn.commit_timestamp_or_none().is_none());
}

#[tokio::test]
async fn test_commit_without_transaction_is_noop() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());
    conn.commit().await.unwrap();
    conn.rollback().await.unwrap();
    assert!(db.calls().is_empty());
    assert!(matches!(conn.commit_timestamp(), Err(Error::ValueNotAvailable(_))));
}

#[tokio::test]
async fn test_query_returns_rows() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());
    let rs = conn.execute("SELECT Title FROM Albums;").await.unwrap().into_result_set().unwrap();
    assert_eq!(rs.len(), 2);
    assert_eq!(rs.get(1, "Title").unwrap(), &Value::from("Red"));
}

#[tokio::test]
async fn test_unknown_statement_rejected_before_rpc() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());
    let err = conn.execute("VACUUM Albums").await.unwrap_err();
    assert!(err.is_usage_error());
    assert!(db.calls().is_empty());
    assert!(!conn.is_in_transaction());
}

// ============================================================================
// 2. Autocommit
// ============================================================================

#[tokio::test]
async fn test_autocommit_update_commits_immediately() {
    let db = backend();
    let mut conn = connect(&db, autocommit());

    conn.execute("UPDATE Albums SET Budget = 0").await.unwrap();
    assert!(!conn.is_in_transaction());
    assert_eq!(db.commit_attempts(), 1);
    assert!(conn.commit_timestamp().is_ok());
}

#[tokio::test]
async fn test_autocommit_query_uses_read_only_context() {
    let db = backend();
    let mut conn = connect(&db, autocommit());

    conn.execute("SELECT Title FROM Albums").await.unwrap();
    assert_eq!(
        first_begin(&db),
        RpcCall::BeginTransaction { tx: TxId(1), mode: TxMode::ReadOnly, directives: vec![] }
    );
    assert!(conn.read_timestamp().is_ok());
    assert_eq!(db.commit_attempts(), 0);
}

#[tokio::test]
async fn test_autocommit_failure_rolls_back() {
    let db = backend();
    let mut conn = connect(&db, autocommit());

    let err = conn.execute("UPDATE Missing SET x = 1").await.unwrap_err();
    assert_eq!(err.code(), spanner_uow::ErrorCode::NotFound);
    assert!(db.calls().contains(&RpcCall::Rollback { tx: TxId(1) }));
    assert!(!conn.is_in_transaction());
}

// ============================================================================
// 3. SET TRANSACTION
// ============================================================================

#[tokio::test]
async fn test_set_transaction_read_only_reaches_backend() {
    let db = backend();
    let mut conn = connect(&db, postgres());

    let result = conn.execute("set transaction  read only").await.unwrap();
    assert_eq!(result, StatementResult::NoResult);
    assert!(db.calls().is_empty(), "the directive is held for the next transaction");

    conn.execute("SELECT Title FROM Albums").await.unwrap();
    assert_eq!(
        first_begin(&db),
        RpcCall::BeginTransaction { tx: TxId(1), mode: TxMode::ReadOnly, directives: vec!["READ ONLY".into()] }
    );
    conn.commit().await.unwrap();

    // The directive applied to one transaction only.
    db.clear_calls();
    conn.execute("UPDATE Albums SET Budget = 0").await.unwrap();
    assert_eq!(
        first_begin(&db),
        RpcCall::BeginTransaction { tx: TxId(2), mode: TxMode::ReadWrite, directives: vec![] }
    );
}

#[tokio::test]
async fn test_isolation_level_on_postgres() {
    let db = backend();
    let mut conn = connect(&db, postgres());

    conn.execute("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE").await.unwrap();
    conn.set_transaction_mode(TransactionMode::ReadWrite).unwrap();
    conn.execute("UPDATE Albums SET Budget = 0").await.unwrap();

    assert_eq!(
        first_begin(&db),
        RpcCall::BeginTransaction {
            tx: TxId(1),
            mode: TxMode::ReadWrite,
            directives: vec!["ISOLATION LEVEL SERIALIZABLE".into(), "READ WRITE".into()],
        }
    );
}

#[tokio::test]
async fn test_isolation_level_rejected_on_googlesql() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());

    let err = conn.execute("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE").await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    conn.execute("UPDATE Albums SET Budget = 0").await.unwrap();
    assert_eq!(
        first_begin(&db),
        RpcCall::BeginTransaction { tx: TxId(1), mode: TxMode::ReadWrite, directives: vec![] }
    );
}

#[tokio::test]
async fn test_set_transaction_inside_transaction_rejected() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());
    conn.begin_transaction().unwrap();
    let err = conn.execute("SET TRANSACTION READ ONLY").await.unwrap_err();
    assert!(matches!(err, Error::InvalidUsage(_)));
}

#[tokio::test]
async fn test_read_only_connection() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());
    conn.set_read_only(true).unwrap();

    let err = conn.set_transaction_mode(TransactionMode::ReadWrite).unwrap_err();
    assert!(matches!(err, Error::InvalidUsage(_)));

    let err = conn.execute("UPDATE Albums SET Budget = 0").await.unwrap_err();
    assert!(matches!(err, Error::InvalidUsage(_)));
    conn.rollback().await.unwrap();
    assert!(db.calls().is_empty());
}

// ============================================================================
// 4. Batches
// ============================================================================

#[tokio::test]
async fn test_ddl_batch_through_connection() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());

    conn.start_batch().unwrap();
    assert!(conn.is_in_batch());
    let r = conn.execute("CREATE TABLE Songs (Id INT64) PRIMARY KEY (Id)").await.unwrap();
    assert_eq!(r, StatementResult::NoResult);
    conn.execute("CREATE INDEX SongsById ON Songs(Id)").await.unwrap();
    assert!(db.calls().is_empty());

    assert_eq!(conn.run_batch().await.unwrap(), vec![1, 1]);
    assert!(!conn.is_in_batch());
    assert_eq!(db.calls().len(), 1);
}

#[tokio::test]
async fn test_dml_batch_reports_unknown_count_until_run() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());

    conn.start_batch().unwrap();
    let r = conn.execute("UPDATE Albums SET Budget = 0").await.unwrap();
    assert_eq!(r.update_count(), Some(-1));
    assert_eq!(conn.run_batch().await.unwrap(), vec![2]);
}

#[tokio::test]
async fn test_commit_in_batch_rejected() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());
    conn.start_batch().unwrap();

    let err = conn.commit().await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedForBatches(_)));
    assert!(conn.is_in_batch());

    conn.abort_batch().unwrap();
    assert!(!conn.is_in_batch());
    assert!(matches!(conn.run_batch().await.unwrap_err(), Error::InvalidUsage(_)));
}

#[tokio::test]
async fn test_ddl_outside_unit_runs_directly() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions::default());
    conn.execute("DROP TABLE Songs").await.unwrap();

    assert!(!conn.is_in_transaction());
    assert_eq!(db.calls(), vec![RpcCall::ExecuteDdl { sqls: vec!["DROP TABLE Songs".into()] }]);
    assert!(conn.commit_timestamp_or_none().is_none());
}

#[tokio::test]
async fn test_ddl_outside_unit_reports_backend_error() {
    let db = backend();
    db.put_ddl_error("DROP TABLE Missing", spanner_uow::ErrorCode::NotFound, "Table not found: Missing");
    let mut conn = connect(&db, ConnectionOptions::default());

    let err = conn.execute("DROP TABLE Missing").await.unwrap_err();
    assert!(matches!(err, Error::Backend { .. }));
    assert_eq!(err.code(), spanner_uow::ErrorCode::NotFound);
}

#[tokio::test]
async fn test_ddl_rejected_on_read_only_connection() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions { read_only: true, ..Default::default() });
    let err = conn.execute("DROP TABLE Songs").await.unwrap_err();
    assert!(matches!(err, Error::InvalidUsage(_)));
    assert!(db.calls().is_empty());
}

#[tokio::test]
async fn test_batch_on_read_only_connection_cannot_write() {
    let db = backend();
    let mut conn = connect(&db, ConnectionOptions { read_only: true, ..Default::default() });

    conn.start_batch().unwrap();
    let err = conn.execute("UPDATE Albums SET Budget = 0").await.unwrap_err();
    assert!(matches!(err, Error::InvalidUsage(_)));
    let err = conn.execute("CREATE TABLE Songs (Id INT64) PRIMARY KEY (Id)").await.unwrap_err();
    assert!(matches!(err, Error::InvalidUsage(_)));
    assert!(conn.is_in_batch());

    assert_eq!(conn.run_batch().await.unwrap(), Vec::<i64>::new());
    assert!(db.calls().is_empty());
}

// ============================================================================
// 5. Retry settings and cancellation
// ============================================================================

#[tokio::test]
async fn test_retry_settings_from_json() {
    let db = backend();
    let options = ConnectionOptions::from_json(
        r#"{"max_commit_attempts": 2, "retry_base_delay_ms": 0, "retry_max_delay_ms": 0}"#,
    )
    .unwrap();
    let mut conn = connect(&db, options);

    conn.execute("UPDATE Albums SET Budget = 0").await.unwrap();
    db.abort_next_commits(u32::MAX);
    let err = conn.commit().await.unwrap_err();

    assert!(err.is_aborted());
    assert_eq!(db.commit_attempts(), 2);
    assert!(!conn.is_in_transaction());
}

#[tokio::test]
async fn test_retry_disabled_from_options() {
    let db = backend();
    let options = ConnectionOptions { retry_aborts_internally: false, ..Default::default() };
    let mut conn = connect(&db, options);

    conn.execute("UPDATE Albums SET Budget = 0").await.unwrap();
    db.abort_next_commits(1);
    assert!(conn.commit().await.unwrap_err().is_aborted());
    assert_eq!(db.commit_attempts(), 1);
}

#[tokio::test]
async fn test_cancel_from_another_task() {
    let db = backend();
    db.put_query_result("SELECT SLOW", ResultSet::default());
    db.set_statement_delay("SELECT SLOW", Duration::from_secs(30));
    let mut conn = connect(&db, ConnectionOptions::default());

    conn.begin_transaction().unwrap();
    let unit = conn.current_unit().unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        unit.cancel();
    });

    let err = conn.execute("SELECT SLOW").await.unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));
    assert!(conn.is_in_transaction(), "cancel leaves the transaction open");

    conn.execute("SELECT Title FROM Albums").await.unwrap();
    conn.commit().await.unwrap();
}
