//! Shared fixtures for integration tests.
//!
//! `ScriptedDriver` stands in for a real database: it records every
//! connection, transaction and command event and answers queries from a
//! queue of canned result sets.

#![allow(dead_code)]

use async_trait::async_trait;
use rowshape::db::{Connection, Cursor, Driver};
use rowshape::error::{DbError, DbResult};
use rowshape::models::{ColumnInfo, Command, ResultSchema, Value, ValueKind};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Something the driver observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Open,
    Close,
    /// Connection dropped without a graceful close.
    Dropped,
    Begin,
    Commit,
    Rollback,
    Execute(String),
    Scalar(String),
    Query(String),
}

/// Canned rows for one query.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub schema: ResultSchema,
    pub rows: Vec<Vec<Value>>,
}

/// Build a result set from `(name, kind)` columns and rows.
pub fn result(columns: &[(&str, ValueKind)], rows: Vec<Vec<Value>>) -> ResultSet {
    ResultSet {
        schema: ResultSchema::new(
            columns
                .iter()
                .map(|(name, kind)| ColumnInfo::new(*name, *kind, kind.name()))
                .collect(),
        ),
        rows,
    }
}

#[derive(Default)]
struct State {
    events: Vec<Event>,
    commands: Vec<Command>,
    results: VecDeque<ResultSet>,
    scalars: VecDeque<Value>,
    affected: u64,
    fail_open: bool,
    fail_next_command: bool,
    fail_row: Option<usize>,
}

/// Driver double whose behavior is scripted by the test.
#[derive(Clone)]
pub struct ScriptedDriver {
    provider: String,
    connection_string: String,
    state: Arc<Mutex<State>>,
}

impl ScriptedDriver {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            connection_string: format!("scripted://{}", provider),
            state: Arc::new(Mutex::new(State {
                affected: 1,
                ..State::default()
            })),
        }
    }

    pub fn push_result(&self, result: ResultSet) -> &Self {
        self.state.lock().unwrap().results.push_back(result);
        self
    }

    pub fn push_scalar(&self, value: impl Into<Value>) -> &Self {
        self.state.lock().unwrap().scalars.push_back(value.into());
        self
    }

    pub fn set_affected(&self, affected: u64) {
        self.state.lock().unwrap().affected = affected;
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.lock().unwrap().fail_open = fail;
    }

    /// Make the next execute, scalar or query fail with a database error.
    pub fn fail_next_command(&self) {
        self.state.lock().unwrap().fail_next_command = true;
    }

    /// Make reading fail at zero-based row `row` of the next query.
    pub fn fail_at_row(&self, row: usize) {
        self.state.lock().unwrap().fail_row = Some(row);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn last_command(&self) -> Command {
        self.commands().pop().unwrap()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.events.clear();
        state.commands.clear();
    }

    fn record(&self, event: Event) {
        self.state.lock().unwrap().events.push(event);
    }

    fn record_command(&self, command: &Command, event: Event) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(event);
        state.commands.push(command.clone());
        if state.fail_next_command {
            state.fail_next_command = false;
            return Err(DbError::database(
                "scripted failure",
                Some("42000".to_string()),
                "none",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    async fn open(&self) -> DbResult<Box<dyn Connection>> {
        if self.state.lock().unwrap().fail_open {
            return Err(DbError::connection("scripted open failure", "none"));
        }
        self.record(Event::Open);
        Ok(Box::new(ScriptedConnection {
            driver: self.clone(),
            closed: false,
        }))
    }
}

struct ScriptedConnection {
    driver: ScriptedDriver,
    closed: bool,
}

#[async_trait]
impl Connection for ScriptedConnection {
    fn connection_string(&self) -> &str {
        &self.driver.connection_string
    }

    async fn begin_transaction(&mut self) -> DbResult<()> {
        self.driver.record(Event::Begin);
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.driver.record(Event::Commit);
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.driver.record(Event::Rollback);
        Ok(())
    }

    async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        self.driver
            .record_command(command, Event::Execute(command.sql.clone()))?;
        Ok(self.driver.state.lock().unwrap().affected)
    }

    async fn scalar(&mut self, command: &Command) -> DbResult<Value> {
        self.driver
            .record_command(command, Event::Scalar(command.sql.clone()))?;
        Ok(self
            .driver
            .state
            .lock()
            .unwrap()
            .scalars
            .pop_front()
            .unwrap_or(Value::Null))
    }

    async fn query<'a>(&'a mut self, command: &'a Command) -> DbResult<Box<dyn Cursor + 'a>> {
        self.driver
            .record_command(command, Event::Query(command.sql.clone()))?;
        let mut state = self.driver.state.lock().unwrap();
        let result = state
            .results
            .pop_front()
            .unwrap_or_else(|| result(&[], Vec::new()));
        Ok(Box::new(ScriptedCursor {
            schema: result.schema,
            rows: result.rows.into(),
            fail_row: state.fail_row.take(),
            position: 0,
        }))
    }

    async fn close(mut self: Box<Self>) -> DbResult<()> {
        self.closed = true;
        self.driver.record(Event::Close);
        Ok(())
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        if !self.closed {
            if let Ok(mut state) = self.driver.state.lock() {
                state.events.push(Event::Dropped);
            }
        }
    }
}

struct ScriptedCursor {
    schema: ResultSchema,
    rows: VecDeque<Vec<Value>>,
    fail_row: Option<usize>,
    position: usize,
}

#[async_trait]
impl Cursor for ScriptedCursor {
    fn schema(&self) -> &ResultSchema {
        &self.schema
    }

    async fn next_row(&mut self) -> DbResult<Option<Vec<Value>>> {
        if self.fail_row == Some(self.position) {
            return Err(DbError::database(
                "scripted read failure",
                Some("08006".to_string()),
                "none",
            ));
        }
        self.position += 1;
        Ok(self.rows.pop_front())
    }
}
