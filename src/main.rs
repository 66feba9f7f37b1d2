//! rowshape - Main entry point.
//!
//! Runs one query, paged query or statement against a database and prints
//! the rows as JSON. Logs go to stderr so stdout stays machine readable.

use futures_util::TryStreamExt;
use rowshape::config::{CliCommand, Config, DatabaseConfig};
use rowshape::db::{Database, SqlxDriver, native_sql};
use rowshape::error::{DbError, DbResult};
use rowshape::mapping::Record;
use rowshape::models::{Arg, Command, Parameter, Value};
use rowshape::sql::{ParameterBinder, ensure_query, page_offset};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Parse CLI arguments as JSON literals. Anything that is not valid JSON is
/// taken as a plain string, so `rowshape query ... alice` works unquoted.
fn parse_args(raw: &[String]) -> Vec<Arg> {
    raw.iter()
        .map(|s| match serde_json::from_str::<JsonValue>(s) {
            Ok(json) => Arg::json(json),
            Err(_) => Arg::from(s.clone()),
        })
        .collect()
}

/// Reject statements that cannot return rows before running them as a query.
fn check_query(db: &Database, db_config: &DatabaseConfig, sql: &str, args: &[Arg]) -> DbResult<()> {
    let bound = ParameterBinder::new(db.param_prefix(), true).bind(sql, args)?;
    let command = Command {
        sql: bound.sql,
        parameters: vec![Parameter::input(Value::Null); bound.args.len()],
        placeholders: bound.placeholders,
        timeout: None,
    };
    let (native, _) = native_sql(db_config.db_type, &command);
    ensure_query(&native, db.dialect())
}

async fn run(config: Config) -> DbResult<()> {
    let db_config = config
        .database_config()
        .map_err(DbError::invalid_input)?;

    info!(
        db_type = %db_config.db_type,
        "Starting rowshape v{}",
        env!("CARGO_PKG_VERSION")
    );

    let driver = Arc::new(SqlxDriver::from_config(&db_config));
    let mut db = Database::builder(driver)
        .options(db_config.options.clone())
        .build()?;

    match config.command {
        CliCommand::Query { sql, args } => {
            let args = parse_args(&args);
            check_query(&db, &db_config, &sql, &args)?;
            let mut rows = db.query::<Record>(&sql, &args);
            while let Some(record) = rows.try_next().await? {
                println!("{}", record_json(&record)?);
            }
        }
        CliCommand::Page {
            page,
            per_page,
            sql,
            args,
        } => {
            let args = parse_args(&args);
            let page = db.page::<Record>(page, per_page, &sql, &args).await?;
            let json = serde_json::to_string_pretty(&page)
                .map_err(|e| DbError::internal(format!("Failed to serialize page: {}", e)))?;
            println!("{}", json);
        }
        CliCommand::Execute { sql, args } => {
            let args = parse_args(&args);
            let affected = db.execute(&sql, &args).await?;
            println!("{}", affected);
        }
        CliCommand::Plan {
            page,
            per_page,
            sql,
            args,
        } => {
            let args = parse_args(&args);
            let queries = db.build_page_queries::<Record>(
                page_offset(page, per_page),
                per_page,
                &sql,
                &args,
            )?;
            println!("{}", queries.count_sql);
            println!("{}", queries.page_sql);
        }
    }

    Ok(())
}

fn record_json(record: &Record) -> DbResult<String> {
    serde_json::to_string(record)
        .map_err(|e| DbError::internal(format!("Failed to serialize row: {}", e)))
}

#[tokio::main]
async fn main() {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    if let Err(e) = run(config).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        if let Some(suggestion) = e.suggestion() {
            eprintln!("Suggestion: {}", suggestion);
        }
        std::process::exit(1);
    }
}
