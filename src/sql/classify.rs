//! Statement classification.
//!
//! Uses [sqlparser](https://docs.rs/sqlparser/) to tell row-returning queries
//! apart from writes, DDL and everything else, so callers that expect rows can
//! refuse statements that would modify data.

use crate::error::{DbError, DbResult};
use crate::models::Dialect;
use sqlparser::ast::Statement;
use sqlparser::dialect::{
    Dialect as ParserDialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect,
    SQLiteDialect,
};
use sqlparser::parser::Parser;

/// Kind of SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// SELECT, SHOW, VALUES and EXPLAIN of a query
    Query,
    /// INSERT, UPDATE, DELETE, MERGE
    Write,
    /// CREATE, ALTER, DROP, TRUNCATE
    Ddl,
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT
    Transaction,
    /// CALL, EXECUTE
    Procedure,
    /// GRANT, SET, PRAGMA and similar
    Administrative,
    Unknown,
}

impl StatementKind {
    pub fn returns_rows(&self) -> bool {
        matches!(self, Self::Query)
    }
}

fn parser_dialect(dialect: Dialect) -> Box<dyn ParserDialect> {
    match dialect {
        Dialect::PostgreSql => Box::new(PostgreSqlDialect {}),
        Dialect::MySql => Box::new(MySqlDialect {}),
        Dialect::SQLite => Box::new(SQLiteDialect {}),
        Dialect::SqlServer | Dialect::SqlServerCe => Box::new(MsSqlDialect {}),
        Dialect::Oracle => Box::new(GenericDialect {}),
    }
}

/// Classify every statement in `sql`.
///
/// Placeholders should already be in the dialect's native form.
pub fn classify(sql: &str, dialect: Dialect) -> DbResult<Vec<StatementKind>> {
    let statements = Parser::parse_sql(parser_dialect(dialect).as_ref(), sql)
        .map_err(|e| DbError::invalid_input(format!("Failed to parse SQL statement: {}", e)))?;
    if statements.is_empty() {
        return Err(DbError::invalid_input("Empty SQL statement"));
    }
    Ok(statements.iter().map(classify_statement).collect())
}

/// Fail unless every statement in `sql` returns rows without side effects.
pub fn ensure_query(sql: &str, dialect: Dialect) -> DbResult<()> {
    match classify(sql, dialect)?
        .into_iter()
        .find(|kind| !kind.returns_rows())
    {
        None => Ok(()),
        Some(kind) => Err(DbError::invalid_input(format!(
            "{:?} statements do not return rows; use `execute` instead",
            kind
        ))),
    }
}

fn classify_statement(stmt: &Statement) -> StatementKind {
    match stmt {
        Statement::Query(_)
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. }
        | Statement::ExplainTable { .. } => StatementKind::Query,

        Statement::Explain { statement, .. } => match classify_statement(statement) {
            StatementKind::Query => StatementKind::Query,
            other => other,
        },

        Statement::Insert(_)
        | Statement::Update { .. }
        | Statement::Delete(_)
        | Statement::Merge { .. }
        | Statement::Copy { .. } => StatementKind::Write,

        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex(_)
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateSequence { .. }
        | Statement::CreateType { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateTrigger { .. }
        | Statement::CreateRole { .. }
        | Statement::CreateVirtualTable { .. }
        | Statement::AlterTable { .. }
        | Statement::AlterView { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterRole { .. }
        | Statement::Drop { .. }
        | Statement::DropFunction { .. }
        | Statement::DropProcedure { .. }
        | Statement::DropTrigger { .. }
        | Statement::Truncate { .. }
        | Statement::Comment { .. } => StatementKind::Ddl,

        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::Savepoint { .. }
        | Statement::ReleaseSavepoint { .. } => StatementKind::Transaction,

        Statement::Call { .. }
        | Statement::Execute { .. }
        | Statement::Prepare { .. }
        | Statement::Deallocate { .. } => StatementKind::Procedure,

        Statement::Grant { .. }
        | Statement::Revoke { .. }
        | Statement::Set(_)
        | Statement::Use(_)
        | Statement::Kill { .. }
        | Statement::Vacuum { .. }
        | Statement::Analyze { .. }
        | Statement::LockTables { .. }
        | Statement::UnlockTables
        | Statement::Flush { .. }
        | Statement::Pragma { .. }
        | Statement::AttachDatabase { .. } => StatementKind::Administrative,

        _ => StatementKind::Unknown,
    }
}
