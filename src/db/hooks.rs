//! Session observation hooks.

use crate::db::driver::Connection;
use crate::error::DbError;
use crate::models::Command;
use tracing::{debug, error, info};

/// Callbacks a session invokes around connections, commands and
/// transactions. Every method has a no-op default.
pub trait DatabaseHooks: Send + Sync {
    /// Called right after a physical connection opens. The returned
    /// connection replaces the opened one, so it may be wrapped.
    fn on_connection_opened(&self, connection: Box<dyn Connection>) -> Box<dyn Connection> {
        connection
    }

    /// Called before a physical connection is closed.
    fn on_connection_closing(&self, _connection: &mut dyn Connection) {}

    /// Called with every command before it runs. May change it, e.g. its timeout.
    fn on_executing_command(&self, _command: &mut Command) {}

    fn on_executed_command(&self, _command: &Command) {}

    /// Observe a failure. `last_command` is the formatted last command.
    fn on_exception(&self, _error: &DbError, _last_command: &str) {}

    fn on_begin_transaction(&self) {}

    /// Called when the outermost transaction scope ends, before it commits
    /// or rolls back.
    fn on_end_transaction(&self, _committing: bool) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl DatabaseHooks for NoHooks {}

/// Hooks that log every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks;

impl DatabaseHooks for TracingHooks {
    fn on_connection_opened(&self, connection: Box<dyn Connection>) -> Box<dyn Connection> {
        debug!("Connection opened");
        connection
    }

    fn on_connection_closing(&self, _connection: &mut dyn Connection) {
        debug!("Connection closing");
    }

    fn on_executed_command(&self, command: &Command) {
        debug!(
            sql = %command.sql,
            params = command.parameters.len(),
            "Command executed"
        );
    }

    fn on_exception(&self, err: &DbError, last_command: &str) {
        error!(error = %err, command = %last_command, "Database operation failed");
    }

    fn on_begin_transaction(&self) {
        debug!("Transaction started");
    }

    fn on_end_transaction(&self, committing: bool) {
        if committing {
            debug!("Transaction ending");
        } else {
            info!("Transaction ending with rollback");
        }
    }
}
