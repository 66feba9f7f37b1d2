//! Driver contract.
//!
//! A [`Driver`] opens physical connections; a [`Connection`] runs commands and
//! brackets transactions; a [`Cursor`] reads one result set forward-only.
//! The session layer only ever talks to these traits, so any backend (the
//! bundled sqlx driver, a test double) can sit underneath it.

use crate::error::DbResult;
use crate::models::{Command, ResultSchema, Value};
use async_trait::async_trait;

/// Factory for physical connections.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Provider identity used for dialect detection, e.g. `"postgres"`.
    fn provider_name(&self) -> &str;

    fn connection_string(&self) -> &str;

    async fn open(&self) -> DbResult<Box<dyn Connection>>;
}

/// One open physical connection.
#[async_trait]
pub trait Connection: Send {
    fn connection_string(&self) -> &str;

    async fn begin_transaction(&mut self) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Run a command that returns no rows. Returns the affected row count.
    async fn execute(&mut self, command: &Command) -> DbResult<u64>;

    /// First column of the first row, or [`Value::Null`] for an empty result.
    async fn scalar(&mut self, command: &Command) -> DbResult<Value>;

    /// Start reading the rows of `command`.
    async fn query<'a>(&'a mut self, command: &'a Command) -> DbResult<Box<dyn Cursor + 'a>>;

    /// Close the connection gracefully.
    async fn close(self: Box<Self>) -> DbResult<()>;
}

/// Forward-only reader over one result set.
#[async_trait]
pub trait Cursor: Send {
    /// Columns of the result set.
    ///
    /// Always complete once [`next_row`](Cursor::next_row) has returned a row.
    /// Drivers that learn the columns from the first row report an empty
    /// schema before then.
    fn schema(&self) -> &ResultSchema;

    /// Advance to the next row. Values are in schema order.
    async fn next_row(&mut self) -> DbResult<Option<Vec<Value>>>;
}
