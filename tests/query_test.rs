//! Integration tests for query composition, paging, multi-shape reads and
//! single-row helpers, run against a scripted driver.

mod common;

use common::{ScriptedDriver, result};
use rowshape::args;
use rowshape::config::SessionOptions;
use rowshape::db::Database;
use rowshape::error::DbError;
use rowshape::mapping::{Entity, Record, ShapeBuilder};
use rowshape::models::{Arg, Value, ValueKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
struct Person {
    id: i64,
    name: String,
    email: Option<String>,
}

impl Entity for Person {
    fn describe(shape: &mut ShapeBuilder<Self>) {
        shape.table("people").primary_key("id");
        shape.member("id", |p| &p.id, |p| &mut p.id);
        shape.member("name", |p| &p.name, |p| &mut p.name);
        shape.member("email", |p| &p.email, |p| &mut p.email);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Author {
    id: i64,
    name: String,
    posts: Vec<Post>,
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
    author: Option<Box<Author>>,
}

impl Entity for Post {
    fn describe(shape: &mut ShapeBuilder<Self>) {
        shape.member("id", |p| &p.id, |p| &mut p.id);
        shape.member("title", |p| &p.title, |p| &mut p.title);
        shape.relation("author", |p: &mut Post, a: Author| p.author = Some(Box::new(a)));
    }
}

fn setup() -> (ScriptedDriver, Database) {
    let driver = ScriptedDriver::new("sqlite");
    let db = Database::builder(Arc::new(driver.clone())).build().unwrap();
    (driver, db)
}

fn people(rows: Vec<(i64, &str, Option<&str>)>) -> common::ResultSet {
    result(
        &[
            ("id", ValueKind::I64),
            ("name", ValueKind::String),
            ("email", ValueKind::String),
        ],
        rows.into_iter()
            .map(|(id, name, email)| {
                vec![
                    Value::I64(id),
                    Value::String(name.to_string()),
                    email.map_or(Value::Null, |e| Value::String(e.to_string())),
                ]
            })
            .collect(),
    )
}

const PEOPLE_SELECT: &str = "SELECT [people].[id], [people].[name], [people].[email] FROM [people]";

// ============================================================================
// Auto-select and parameters
// ============================================================================

#[tokio::test]
async fn test_auto_select_prefixes_where_clause() {
    let (driver, mut db) = setup();
    driver.push_result(people(vec![(1, "ann", Some("ann@example.com"))]));

    let rows: Vec<Person> = db.fetch("WHERE id=@0", &args![1i64]).await.unwrap();

    assert_eq!(
        rows,
        vec![Person {
            id: 1,
            name: "ann".to_string(),
            email: Some("ann@example.com".to_string()),
        }]
    );
    assert_eq!(
        driver.last_command().sql,
        format!("{} WHERE id=@0", PEOPLE_SELECT)
    );
}

#[tokio::test]
async fn test_auto_select_keeps_explicit_select() {
    let (driver, mut db) = setup();
    driver.push_result(people(vec![]));
    driver.push_result(people(vec![]));

    db.fetch::<Person>("SELECT id, name, email FROM people", &[])
        .await
        .unwrap();
    assert_eq!(driver.last_command().sql, "SELECT id, name, email FROM people");

    db.fetch::<Person>(";WITH x AS (SELECT 1) SELECT * FROM people", &[])
        .await
        .unwrap();
    assert_eq!(
        driver.last_command().sql,
        "WITH x AS (SELECT 1) SELECT * FROM people"
    );
}

#[tokio::test]
async fn test_auto_select_from_clause() {
    let (driver, mut db) = setup();
    driver.push_result(people(vec![]));

    db.fetch::<Person>("FROM people p WHERE p.id > @0", &args![5])
        .await
        .unwrap();
    assert_eq!(
        driver.last_command().sql,
        "SELECT [people].[id], [people].[name], [people].[email] FROM people p WHERE p.id > @0"
    );
}

#[tokio::test]
async fn test_auto_select_disabled() {
    let driver = ScriptedDriver::new("sqlite");
    let mut db = Database::builder(Arc::new(driver.clone()))
        .options(SessionOptions {
            auto_select: Some(false),
            ..SessionOptions::default()
        })
        .build()
        .unwrap();
    driver.push_result(people(vec![]));

    db.fetch::<Person>("WHERE id=@0", &args![1]).await.unwrap();
    assert_eq!(driver.last_command().sql, "WHERE id=@0");
}

#[tokio::test]
async fn test_named_and_list_parameters() {
    let (driver, mut db) = setup();
    driver.push_result(people(vec![]));

    db.fetch::<Person>(
        "WHERE name = @name AND id IN (@1)",
        &[
            Arg::json(json!({ "name": "ann" })),
            Arg::from(Value::list(vec![1, 2, 3])),
        ],
    )
    .await
    .unwrap();

    let command = driver.last_command();
    assert_eq!(
        command.sql,
        format!("{} WHERE name = @0 AND id IN (@1,@2,@3)", PEOPLE_SELECT)
    );
    let values: Vec<Value> = command.parameters.iter().map(|p| p.value.clone()).collect();
    assert_eq!(
        values,
        vec![
            Value::String("ann".to_string()),
            Value::I32(1),
            Value::I32(2),
            Value::I32(3),
        ]
    );
}

#[tokio::test]
async fn test_missing_argument_is_binding_error() {
    let (driver, mut db) = setup();

    let err = db
        .fetch::<Person>("WHERE id=@3", &args![1])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Binding { .. }));
    // Binding fails before anything reaches the driver
    assert!(driver.commands().is_empty());
    assert_eq!(db.connection_depth(), 0);
}

// ============================================================================
// Scalars
// ============================================================================

#[tokio::test]
async fn test_scalar_coercion() {
    let (driver, mut db) = setup();
    driver.push_scalar(Value::I64(42));
    driver.push_scalar(Value::I32(7));
    driver.push_scalar(Value::Null);

    let a: i32 = db.execute_scalar("SELECT 42", &[]).await.unwrap();
    let b: i64 = db.execute_scalar("SELECT 7", &[]).await.unwrap();
    let c: Option<i64> = db.execute_scalar("SELECT NULL", &[]).await.unwrap();

    assert_eq!(a, 42);
    assert_eq!(b, 7);
    assert_eq!(c, None);
}

#[tokio::test]
async fn test_scalar_out_of_range_fails() {
    let (driver, mut db) = setup();
    driver.push_scalar(Value::I64(i64::MAX));

    let err = db.execute_scalar::<i32>("SELECT big", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::Conversion { .. }));
}

// ============================================================================
// Paging
// ============================================================================

#[tokio::test]
async fn test_page_runs_count_then_page_query() {
    let (driver, mut db) = setup();
    driver.push_scalar(Value::I64(3));
    driver.push_result(people(vec![(3, "cy", None)]));

    let page = db
        .page::<Person>(2, 2, "SELECT * FROM people WHERE name <> @0 ORDER BY name", &args!["x"])
        .await
        .unwrap();

    assert_eq!(page.current_page, 2);
    assert_eq!(page.items_per_page, 2);
    assert_eq!(page.total_items, 3);
    assert_eq!(page.total_pages, 2);
    assert_eq!(page.items.len(), 1);

    let commands = driver.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(
        commands[0].sql,
        "SELECT COUNT(*) FROM people WHERE name <> @0"
    );
    assert_eq!(commands[0].parameters.len(), 1);
    assert_eq!(
        commands[1].sql,
        "SELECT * FROM people WHERE name <> @0 ORDER BY name\nLIMIT @1 OFFSET @2"
    );
    let values: Vec<Value> = commands[1]
        .parameters
        .iter()
        .map(|p| p.value.clone())
        .collect();
    assert_eq!(
        values,
        vec![Value::String("x".to_string()), Value::I64(2), Value::I64(2)]
    );
}

#[tokio::test]
async fn test_page_applies_one_time_timeout_to_both_queries() {
    let (driver, mut db) = setup();
    driver.push_scalar(Value::I64(0));
    driver.push_result(people(vec![]));
    driver.push_result(people(vec![]));

    db.set_one_time_command_timeout(Duration::from_secs(7));
    db.page::<Person>(1, 10, "SELECT * FROM people", &[])
        .await
        .unwrap();
    db.fetch::<Person>("SELECT * FROM people", &[]).await.unwrap();

    let commands = driver.commands();
    assert_eq!(commands[0].timeout, Some(Duration::from_secs(7)));
    assert_eq!(commands[1].timeout, Some(Duration::from_secs(7)));
    assert_eq!(commands[2].timeout, None);
}

#[tokio::test]
async fn test_page_with_auto_select() {
    let (driver, mut db) = setup();
    driver.push_scalar(Value::I64(0));
    driver.push_result(people(vec![]));

    db.page::<Person>(1, 5, "WHERE id > @0", &args![0])
        .await
        .unwrap();

    let commands = driver.commands();
    assert_eq!(
        commands[0].sql,
        "SELECT COUNT(*) FROM [people] WHERE id > @0"
    );
    assert_eq!(
        commands[1].sql,
        format!("{} WHERE id > @0\nLIMIT @1 OFFSET @2", PEOPLE_SELECT)
    );
}

#[tokio::test]
async fn test_skip_take_and_fetch_page() {
    let (driver, mut db) = setup();
    driver.push_result(people(vec![]));
    driver.push_result(people(vec![]));

    db.skip_take::<Person>(30, 10, "SELECT * FROM people", &[])
        .await
        .unwrap();
    db.fetch_page::<Person>(3, 10, "SELECT * FROM people", &[])
        .await
        .unwrap();

    let commands = driver.commands();
    assert_eq!(commands.len(), 2);
    for command in &commands {
        assert_eq!(command.sql, "SELECT * FROM people\nLIMIT @0 OFFSET @1");
    }
    let skip_take: Vec<Value> = commands[0].parameters.iter().map(|p| p.value.clone()).collect();
    let fetch_page: Vec<Value> = commands[1].parameters.iter().map(|p| p.value.clone()).collect();
    assert_eq!(skip_take, vec![Value::I64(10), Value::I64(30)]);
    assert_eq!(fetch_page, vec![Value::I64(10), Value::I64(20)]);
}

#[test]
fn test_build_page_queries_for_sql_server() {
    let driver = ScriptedDriver::new("sqlserver");
    let db = Database::builder(Arc::new(driver)).build().unwrap();

    let queries = db
        .build_page_queries::<Record>(20, 10, "SELECT id, name FROM people ORDER BY name", &[])
        .unwrap();

    assert_eq!(queries.count_sql, "SELECT COUNT(*) FROM people");
    assert!(queries.page_sql.starts_with("SELECT * FROM (SELECT ROW_NUMBER() OVER (ORDER BY name) rs_rn, id, name FROM people"));
    assert!(queries.page_sql.ends_with("rs_paged WHERE rs_rn>@0 AND rs_rn<=@1"));
    assert_eq!(
        queries.args.iter().map(|a| a.type_name()).collect::<Vec<_>>(),
        vec!["i64", "i64"]
    );
}

// ============================================================================
// Single rows
// ============================================================================

#[tokio::test]
async fn test_single_rejects_many_and_none() {
    let (driver, mut db) = setup();
    driver.push_result(people(vec![(1, "ann", None), (2, "bo", None)]));
    driver.push_result(people(vec![]));
    driver.push_result(people(vec![(1, "ann", None)]));

    let err = db.single::<Person>("SELECT * FROM people", &[]).await.unwrap_err();
    assert!(err.to_string().contains("more than one row"));

    let err = db.single::<Person>("SELECT * FROM people", &[]).await.unwrap_err();
    assert!(err.to_string().contains("no rows"));

    let one = db.single::<Person>("SELECT * FROM people", &[]).await.unwrap();
    assert_eq!(one.name, "ann");
    assert_eq!(db.connection_depth(), 0);
}

#[tokio::test]
async fn test_single_or_default_and_first() {
    let (driver, mut db) = setup();
    driver.push_result(people(vec![]));
    driver.push_result(people(vec![(1, "ann", None), (2, "bo", None)]));
    driver.push_result(people(vec![]));

    let none = db
        .single_or_default::<Person>("SELECT * FROM people", &[])
        .await
        .unwrap();
    assert_eq!(none, None);

    let first = db.first::<Person>("SELECT * FROM people", &[]).await.unwrap();
    assert_eq!(first.id, 1);

    let err = db.first::<Person>("SELECT * FROM people", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
}

#[tokio::test]
async fn test_single_by_key() {
    let (driver, mut db) = setup();
    driver.push_result(people(vec![(5, "eve", None)]));
    driver.push_result(people(vec![]));

    let person = db.single_by_key::<Person>(5i64).await.unwrap();
    assert_eq!(person.name, "eve");

    let command = driver.last_command();
    assert_eq!(command.sql, format!("{} WHERE [id]=@0", PEOPLE_SELECT));
    assert_eq!(command.parameters[0].value, Value::I64(5));

    let missing = db.single_or_default_by_key::<Person>(6i64).await.unwrap();
    assert_eq!(missing, None);
}

#[tokio::test]
async fn test_exists_by_key() {
    let (driver, mut db) = setup();
    driver.push_scalar(Value::I64(1));
    driver.push_scalar(Value::I64(0));

    assert!(db.exists_by_key::<Person>(1i64).await.unwrap());
    assert_eq!(
        driver.last_command().sql,
        "SELECT COUNT(*) FROM [people] WHERE [id]=@0"
    );
    assert!(!db.exists_by_key::<Person>(2i64).await.unwrap());
}

// ============================================================================
// Multi-shape queries
// ============================================================================

fn author_posts() -> common::ResultSet {
    result(
        &[
            ("id", ValueKind::I64),
            ("name", ValueKind::String),
            ("id", ValueKind::I64),
            ("title", ValueKind::String),
        ],
        vec![
            vec![
                Value::I64(1),
                Value::String("ann".into()),
                Value::I64(10),
                Value::String("first".into()),
            ],
            vec![
                Value::I64(1),
                Value::String("ann".into()),
                Value::I64(11),
                Value::String("second".into()),
            ],
            vec![
                Value::I64(2),
                Value::String("bo".into()),
                Value::Null,
                Value::Null,
            ],
        ],
    )
}

#[tokio::test]
async fn test_multi_shape_combinator_groups_rows() {
    let (driver, mut db) = setup();
    driver.push_result(author_posts());

    let mut current: Option<Author> = None;
    let authors = db
        .fetch_multi::<(Author, Post), Author, _>(
            "SELECT a.id, a.name, p.id, p.title FROM authors a LEFT JOIN posts p ON p.author_id = a.id",
            &[],
            move |(author, post)| {
                let Some(author) = author else {
                    return current.take();
                };
                if let Some(existing) = current.as_mut() {
                    if existing.id == author.id {
                        existing.posts.extend(post);
                        return None;
                    }
                }
                let finished = current.replace(author);
                if let Some(started) = current.as_mut() {
                    started.posts.extend(post);
                }
                finished
            },
        )
        .await
        .unwrap();

    assert_eq!(authors.len(), 2);
    assert_eq!(authors[0].name, "ann");
    assert_eq!(
        authors[0].posts.iter().map(|p| p.id).collect::<Vec<_>>(),
        vec![10, 11]
    );
    assert_eq!(authors[1].name, "bo");
    assert!(authors[1].posts.is_empty());
    assert_eq!(db.connection_depth(), 0);
}

#[tokio::test]
async fn test_multi_shape_without_terminator() {
    let (driver, mut db) = setup();
    driver.push_result(author_posts());

    let pairs = db
        .fetch_multi::<(Author, Post), (i64, Option<i64>), _>(
            "SELECT a.id, a.name, p.id, p.title FROM authors a LEFT JOIN posts p ON p.author_id = a.id",
            &[],
            |(author, post)| Some((author.map_or(0, |a| a.id), post.map(|p| p.id))),
        )
        .await
        .unwrap();

    assert_eq!(pairs, vec![(1, Some(10)), (1, Some(11)), (2, None)]);
}

#[tokio::test]
async fn test_joined_query_nests_related_shape() {
    let (driver, mut db) = setup();
    driver.push_result(result(
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
                Value::I64(12),
                Value::String("orphan".into()),
                Value::Null,
                Value::Null,
            ],
        ],
    ));

    let posts = db
        .fetch_joined::<(Post, Author)>(
            "SELECT p.id, p.title, a.id, a.name FROM posts p LEFT JOIN authors a ON a.id = p.author_id",
            &[],
        )
        .await
        .unwrap();

    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].author.as_ref().map(|a| a.name.as_str()), Some("ann"));
    assert_eq!(posts[1].author, None);
}

#[tokio::test]
async fn test_unsplittable_columns_fail() {
    let (driver, mut db) = setup();
    driver.push_result(result(
        &[("id", ValueKind::I64), ("title", ValueKind::String)],
        vec![vec![Value::I64(1), Value::String("first".into())]],
    ));

    let err = db
        .fetch_joined::<(Post, Author)>("SELECT id, title FROM posts", &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("split point"));
    assert_eq!(db.connection_depth(), 0);
}

// ============================================================================
// Records and diagnostics
// ============================================================================

#[tokio::test]
async fn test_records_keep_column_names() {
    let (driver, mut db) = setup();
    driver.push_result(people(vec![(1, "ann", None)]));

    let rows: Vec<Record> = db.fetch("SELECT * FROM people", &[]).await.unwrap();
    let row = &rows[0];
    assert_eq!(row.get("id"), Some(&Value::I64(1)));
    assert_eq!(row.get("name"), Some(&Value::String("ann".into())));
    assert_eq!(row.get("email"), Some(&Value::Null));
}

#[tokio::test]
async fn test_last_command_formats_arguments() {
    let (_driver, mut db) = setup();

    db.execute("UPDATE people SET name=@0 WHERE id=@1", &args!["x", 3])
        .await
        .unwrap();

    assert_eq!(db.last_sql(), Some("UPDATE people SET name=@0 WHERE id=@1"));
    assert_eq!(
        db.last_args(),
        &[Value::String("x".into()), Value::I32(3)]
    );
    assert_eq!(
        db.last_command(),
        "UPDATE people SET name=@0 WHERE id=@1\n\t -> @0 [string] = \"x\"\n\t -> @1 [i32] = \"3\""
    );
}
