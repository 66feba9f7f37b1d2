//! Integration tests for connection sharing, transaction nesting and hooks.

mod common;

use common::{Event, ScriptedDriver, result};
use futures_util::TryStreamExt;
use rowshape::args;
use rowshape::config::SessionOptions;
use rowshape::db::{Connection, Database, DatabaseHooks};
use rowshape::error::DbError;
use rowshape::mapping::{Entity, Record, ShapeBuilder};
use rowshape::models::{Command, Value, ValueKind};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default, PartialEq)]
struct Author {
    id: i64,
    name: String,
}

impl Entity for Author {
    fn describe(shape: &mut ShapeBuilder<Self>) {
        shape.member("id", |a| &a.id, |a| &mut a.id);
        shape.member("name", |a| &a.name, |a| &mut a.name);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Post {
    id: i64,
    title: String,
    author: Option<Author>,
}

impl Entity for Post {
    fn describe(shape: &mut ShapeBuilder<Self>) {
        shape.member("id", |p| &p.id, |p| &mut p.id);
        shape.member("title", |p| &p.title, |p| &mut p.title);
        shape.relation("author", |p: &mut Post, a: Author| p.author = Some(a));
    }
}

fn setup() -> (ScriptedDriver, Database) {
    let driver = ScriptedDriver::new("sqlite");
    let db = Database::builder(Arc::new(driver.clone())).build().unwrap();
    (driver, db)
}

fn setup_with(options: SessionOptions) -> (ScriptedDriver, Database) {
    let driver = ScriptedDriver::new("sqlite");
    let db = Database::builder(Arc::new(driver.clone()))
        .options(options)
        .build()
        .unwrap();
    (driver, db)
}

/// Hooks that record the name of every callback.
#[derive(Default)]
struct RecordingHooks {
    calls: Mutex<Vec<String>>,
}

impl RecordingHooks {
    fn push(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl DatabaseHooks for RecordingHooks {
    fn on_connection_opened(&self, connection: Box<dyn Connection>) -> Box<dyn Connection> {
        self.push("opened");
        connection
    }

    fn on_connection_closing(&self, _connection: &mut dyn Connection) {
        self.push("closing");
    }

    fn on_executing_command(&self, _command: &mut Command) {
        self.push("executing");
    }

    fn on_executed_command(&self, _command: &Command) {
        self.push("executed");
    }

    fn on_exception(&self, _error: &rowshape::error::DbError, last_command: &str) {
        self.push(format!("exception: {}", last_command));
    }

    fn on_begin_transaction(&self) {
        self.push("begin");
    }

    fn on_end_transaction(&self, committing: bool) {
        self.push(format!("end committing={}", committing));
    }
}

// ============================================================================
// Shared connection
// ============================================================================

#[tokio::test]
async fn test_each_command_opens_and_closes() {
    let (driver, mut db) = setup();

    db.execute("DELETE FROM t", &[]).await.unwrap();
    db.execute("DELETE FROM u", &[]).await.unwrap();

    assert_eq!(
        driver.events(),
        vec![
            Event::Open,
            Event::Execute("DELETE FROM t".to_string()),
            Event::Close,
            Event::Open,
            Event::Execute("DELETE FROM u".to_string()),
            Event::Close,
        ]
    );
    assert_eq!(db.connection_depth(), 0);
}

#[tokio::test]
async fn test_shared_connection_is_reused() {
    let (driver, mut db) = setup();

    db.open_shared_connection().await.unwrap();
    db.execute("DELETE FROM t", &[]).await.unwrap();
    db.execute("DELETE FROM u", &[]).await.unwrap();
    assert_eq!(db.connection_depth(), 1);
    assert_eq!(driver.count(&Event::Open), 1);
    assert_eq!(driver.count(&Event::Close), 0);

    db.close_shared_connection().await.unwrap();
    assert_eq!(db.connection_depth(), 0);
    assert_eq!(driver.count(&Event::Close), 1);
}

#[tokio::test]
async fn test_close_without_open_is_noop() {
    let (driver, mut db) = setup();
    db.close_shared_connection().await.unwrap();
    assert_eq!(db.connection_depth(), 0);
    assert!(driver.events().is_empty());
}

#[tokio::test]
async fn test_keep_alive_holds_connection() {
    let (driver, mut db) = setup_with(SessionOptions {
        keep_alive: Some(true),
        ..SessionOptions::default()
    });

    db.execute("DELETE FROM t", &[]).await.unwrap();
    db.execute("DELETE FROM u", &[]).await.unwrap();

    assert_eq!(driver.count(&Event::Open), 1);
    assert_eq!(driver.count(&Event::Close), 0);
    assert_eq!(db.connection_depth(), 1);

    db.close_shared_connection().await.unwrap();
    assert_eq!(driver.count(&Event::Close), 1);
    assert_eq!(db.connection_depth(), 0);
}

#[tokio::test]
async fn test_open_failure_leaves_no_connection() {
    let (driver, mut db) = setup();
    driver.fail_open(true);

    let err = db.execute("DELETE FROM t", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));
    assert_eq!(db.connection_depth(), 0);

    driver.fail_open(false);
    db.execute("DELETE FROM t", &[]).await.unwrap();
    assert_eq!(db.connection_depth(), 0);
}

#[tokio::test]
async fn test_command_failure_still_closes() {
    let (driver, mut db) = setup();
    driver.fail_next_command();

    let err = db.execute("DELETE FROM t", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert_eq!(db.connection_depth(), 0);
    assert_eq!(driver.count(&Event::Close), 1);
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn test_nested_transactions_commit_once() {
    let (driver, mut db) = setup();

    db.begin_transaction().await.unwrap();
    db.begin_transaction().await.unwrap();
    assert_eq!(db.transaction_depth(), 2);
    db.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    db.complete_transaction().await.unwrap();
    assert_eq!(driver.count(&Event::Commit), 0);
    db.complete_transaction().await.unwrap();

    assert_eq!(
        driver.events(),
        vec![
            Event::Open,
            Event::Begin,
            Event::Execute("INSERT INTO t VALUES (1)".to_string()),
            Event::Commit,
            Event::Close,
        ]
    );
    assert_eq!(db.transaction_depth(), 0);
    assert_eq!(db.connection_depth(), 0);
}

#[tokio::test]
async fn test_inner_abort_rolls_back_outer() {
    let (driver, mut db) = setup();

    db.begin_transaction().await.unwrap();
    db.begin_transaction().await.unwrap();
    db.abort_transaction().await.unwrap();
    db.complete_transaction().await.unwrap();

    assert_eq!(driver.count(&Event::Commit), 0);
    assert_eq!(driver.count(&Event::Rollback), 1);
    assert_eq!(db.transaction_depth(), 0);
}

#[tokio::test]
async fn test_abort_flag_resets_for_next_transaction() {
    let (driver, mut db) = setup();

    db.begin_transaction().await.unwrap();
    db.abort_transaction().await.unwrap();
    db.begin_transaction().await.unwrap();
    db.complete_transaction().await.unwrap();

    assert_eq!(driver.count(&Event::Rollback), 1);
    assert_eq!(driver.count(&Event::Commit), 1);
    assert_eq!(driver.count(&Event::Open), 2);
}

#[tokio::test]
async fn test_complete_without_begin_fails() {
    let (_driver, mut db) = setup();

    let err = db.complete_transaction().await.unwrap_err();
    assert!(matches!(err, DbError::Transaction { .. }));
    assert!(err.to_string().contains("complete_transaction"));

    let err = db.abort_transaction().await.unwrap_err();
    assert!(matches!(err, DbError::Transaction { .. }));
}

#[tokio::test]
async fn test_begin_fails_when_connection_cannot_open() {
    let (driver, mut db) = setup();
    driver.fail_open(true);

    assert!(db.begin_transaction().await.is_err());
    assert_eq!(db.transaction_depth(), 0);
    assert_eq!(db.connection_depth(), 0);
}

#[tokio::test]
async fn test_with_transaction_commits_on_success() {
    let (driver, mut db) = setup();

    let affected = db
        .with_transaction(|db| {
            Box::pin(async move {
                let a = db.execute("UPDATE t SET x = 1", &[]).await?;
                let b = db.execute("UPDATE u SET x = 1", &[]).await?;
                Ok(a + b)
            })
        })
        .await
        .unwrap();

    assert_eq!(affected, 2);
    assert_eq!(driver.count(&Event::Open), 1);
    assert_eq!(driver.count(&Event::Commit), 1);
    assert_eq!(driver.count(&Event::Rollback), 0);
}

#[tokio::test]
async fn test_with_transaction_rolls_back_on_error() {
    let (driver, mut db) = setup();

    let result: Result<(), DbError> = db
        .with_transaction(|db| {
            Box::pin(async move {
                db.execute("UPDATE t SET x = 1", &[]).await?;
                Err(DbError::invalid_input("stop"))
            })
        })
        .await;

    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    assert_eq!(driver.count(&Event::Commit), 0);
    assert_eq!(driver.count(&Event::Rollback), 1);
    assert_eq!(db.transaction_depth(), 0);
    assert_eq!(db.connection_depth(), 0);
}

// ============================================================================
// Hooks
// ============================================================================

#[tokio::test]
async fn test_hook_order_in_transaction() {
    let driver = ScriptedDriver::new("sqlite");
    let hooks = Arc::new(RecordingHooks::default());
    let mut db = Database::builder(Arc::new(driver.clone()))
        .hooks(hooks.clone())
        .build()
        .unwrap();

    db.begin_transaction().await.unwrap();
    db.execute("DELETE FROM t", &[]).await.unwrap();
    db.complete_transaction().await.unwrap();

    assert_eq!(
        hooks.calls(),
        vec![
            "opened",
            "begin",
            "executing",
            "executed",
            "end committing=true",
            "closing",
        ]
    );
}

#[tokio::test]
async fn test_exception_hook_receives_last_command() {
    let driver = ScriptedDriver::new("sqlite");
    let hooks = Arc::new(RecordingHooks::default());
    let mut db = Database::builder(Arc::new(driver.clone()))
        .hooks(hooks.clone())
        .build()
        .unwrap();

    driver.fail_next_command();
    assert!(db.execute("DELETE FROM t WHERE id=@0", &args![7]).await.is_err());

    let calls = hooks.calls();
    let exception = calls
        .iter()
        .find(|c| c.starts_with("exception"))
        .expect("exception hook not called");
    assert!(exception.contains("DELETE FROM t WHERE id=@0"));
    assert!(exception.contains("-> @0 [i32] = \"7\""));
}

#[tokio::test]
async fn test_executing_hook_can_change_command() {
    struct Tagging;

    impl DatabaseHooks for Tagging {
        fn on_executing_command(&self, command: &mut Command) {
            command.sql = format!("/* tagged */ {}", command.sql);
        }
    }

    let driver = ScriptedDriver::new("sqlite");
    let mut db = Database::builder(Arc::new(driver.clone()))
        .hooks(Arc::new(Tagging))
        .build()
        .unwrap();

    db.execute("DELETE FROM t", &[]).await.unwrap();
    assert_eq!(driver.last_command().sql, "/* tagged */ DELETE FROM t");
    assert_eq!(db.last_sql(), Some("/* tagged */ DELETE FROM t"));
}

// ============================================================================
// Query streams
// ============================================================================

#[tokio::test]
async fn test_finished_stream_releases_connection() {
    let (driver, mut db) = setup();
    driver.push_result(result(
        &[("n", ValueKind::I64)],
        vec![vec![Value::I64(1)], vec![Value::I64(2)]],
    ));

    let rows: Vec<Record> = db.fetch("SELECT n FROM t", &[]).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(db.connection_depth(), 0);
    assert_eq!(
        driver.events(),
        vec![
            Event::Open,
            Event::Query("SELECT n FROM t".to_string()),
            Event::Close
        ]
    );
}

#[tokio::test]
async fn test_dropped_stream_releases_connection() {
    let (driver, mut db) = setup();
    driver.push_result(result(
        &[("n", ValueKind::I64)],
        vec![
            vec![Value::I64(1)],
            vec![Value::I64(2)],
            vec![Value::I64(3)],
        ],
    ));

    {
        let mut rows = db.query::<i64>("SELECT n FROM t", &[]);
        assert_eq!(rows.try_next().await.unwrap(), Some(1));
    }

    assert_eq!(db.connection_depth(), 0);
    assert_eq!(driver.count(&Event::Close), 0);
    assert_eq!(driver.count(&Event::Dropped), 1);

    // The session is usable again afterwards
    db.execute("DELETE FROM t", &[]).await.unwrap();
    assert_eq!(driver.count(&Event::Open), 2);
}

#[tokio::test]
async fn test_stream_inside_shared_connection_keeps_it_open() {
    let (driver, mut db) = setup();
    driver.push_result(result(&[("n", ValueKind::I64)], vec![vec![Value::I64(1)]]));

    db.open_shared_connection().await.unwrap();
    let rows: Vec<i64> = db.fetch("SELECT n FROM t", &[]).await.unwrap();
    assert_eq!(rows, vec![1]);
    assert_eq!(db.connection_depth(), 1);
    assert_eq!(driver.count(&Event::Close), 0);

    db.close_shared_connection().await.unwrap();
    assert_eq!(driver.count(&Event::Close), 1);
}

#[tokio::test]
async fn test_first_and_single_close_gracefully() {
    let (driver, mut db) = setup();
    let numbers = || {
        result(
            &[("n", ValueKind::I64)],
            vec![
                vec![Value::I64(1)],
                vec![Value::I64(2)],
                vec![Value::I64(3)],
            ],
        )
    };
    driver.push_result(numbers());
    driver.push_result(numbers());

    let first: i64 = db.first("SELECT n FROM t ORDER BY n", &[]).await.unwrap();
    assert_eq!(first, 1);
    let err = db
        .single_or_default::<i64>("SELECT n FROM t", &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("more than one row"));

    assert_eq!(db.connection_depth(), 0);
    assert_eq!(driver.count(&Event::Close), 2);
    assert_eq!(driver.count(&Event::Dropped), 0);
}

// ============================================================================
// Mid-stream failures
// ============================================================================

fn post_author_rows() -> common::ResultSet {
    result(
        &[
            ("id", ValueKind::I64),
            ("title", ValueKind::String),
            ("id", ValueKind::I64),
            ("name", ValueKind::String),
        ],
        vec![
            vec![
                Value::I64(10),
                Value::String("first".into()),
                Value::I64(1),
                Value::String("ann".into()),
            ],
            vec![
                Value::I64(11),
                Value::String("second".into()),
                Value::I64(1),
                Value::String("ann".into()),
            ],
        ],
    )
}

/// The connection was closed gracefully once and nothing is left open.
fn assert_released(driver: &ScriptedDriver, db: &Database) {
    assert_eq!(db.connection_depth(), 0);
    assert_eq!(driver.events().last(), Some(&Event::Close));
    assert_eq!(driver.count(&Event::Close), 1);
    assert_eq!(driver.count(&Event::Dropped), 0);
}

#[tokio::test]
async fn test_read_failure_in_query_releases_connection() {
    let (driver, mut db) = setup();
    driver.push_result(result(
        &[("n", ValueKind::I64)],
        vec![vec![Value::I64(1)], vec![Value::I64(2)]],
    ));
    driver.fail_at_row(1);

    let mut rows = db.query::<i64>("SELECT n FROM t", &[]);
    assert_eq!(rows.try_next().await.unwrap(), Some(1));
    let err = rows.try_next().await.unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert_eq!(rows.try_next().await.unwrap(), None);
    drop(rows);

    assert_released(&driver, &db);
}

#[tokio::test]
async fn test_conversion_failure_in_query_releases_connection() {
    let (driver, mut db) = setup();
    driver.push_result(result(
        &[("n", ValueKind::String)],
        vec![
            vec![Value::String("1".into())],
            vec![Value::String("abc".into())],
        ],
    ));

    let err = db.fetch::<i64>("SELECT n FROM t", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::Conversion { .. }));
    assert_released(&driver, &db);
}

#[tokio::test]
async fn test_read_failure_in_multi_query_releases_connection() {
    let (driver, mut db) = setup();
    driver.push_result(post_author_rows());
    driver.fail_at_row(1);

    let err = db
        .fetch_multi::<(Post, Author), i64, _>(
            "SELECT p.id, p.title, a.id, a.name FROM posts p JOIN authors a ON a.id = p.author_id",
            &[],
            |(post, _)| post.map(|p| p.id),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert_released(&driver, &db);
}

#[tokio::test]
async fn test_read_failure_in_joined_query_releases_connection() {
    let driver = ScriptedDriver::new("sqlite");
    driver.push_result(post_author_rows());
    driver.fail_at_row(1);
    let hooks = Arc::new(RecordingHooks::default());
    let mut db = Database::builder(Arc::new(driver.clone()))
        .hooks(hooks.clone())
        .build()
        .unwrap();

    let err = db
        .fetch_joined::<(Post, Author)>(
            "SELECT p.id, p.title, a.id, a.name FROM posts p JOIN authors a ON a.id = p.author_id",
            &[],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert_released(&driver, &db);
    assert!(hooks.calls().iter().any(|c| c.starts_with("exception")));
    assert_eq!(hooks.calls().last().map(String::as_str), Some("closing"));
}
