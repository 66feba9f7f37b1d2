//! Error types for rowshape.
//!
//! Every failure surfaces as a [`DbError`]. Mapping, binding and paging
//! problems get their own variants; anything reported by the underlying driver
//! is passed through as `Connection`, `Database` or `Timeout`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Parameter '{token}' could not be bound: {message} (in `{sql}`)")]
    Binding {
        token: String,
        sql: String,
        message: String,
    },

    #[error("Mapping error for '{shape}': {message}")]
    Mapping { shape: String, message: String },

    #[error("Can't auto join {target} as {shape} has more than one property of type {target}")]
    AmbiguousJoin { shape: String, target: String },

    #[error("Can't auto join {shape}")]
    UnresolvedJoin { shape: String },

    #[error("Unable to parse SQL statement for paged query: {message} (in `{sql}`)")]
    UnparsableQuery { sql: String, message: String },

    #[error("{dialect} constraint: {message}")]
    DialectConstraint { dialect: String, message: String },

    #[error("Cannot convert {from} to {to}: {message}")]
    Conversion {
        from: String,
        to: String,
        message: String,
    },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a binding error for an unresolved or out-of-range placeholder.
    pub fn binding(
        token: impl Into<String>,
        sql: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Binding {
            token: token.into(),
            sql: sql.into(),
            message: message.into(),
        }
    }

    /// Create a mapping error.
    pub fn mapping(shape: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Mapping {
            shape: shape.into(),
            message: message.into(),
        }
    }

    pub fn ambiguous_join(shape: impl Into<String>, target: impl Into<String>) -> Self {
        Self::AmbiguousJoin {
            shape: shape.into(),
            target: target.into(),
        }
    }

    pub fn unresolved_join(shape: impl Into<String>) -> Self {
        Self::UnresolvedJoin {
            shape: shape.into(),
        }
    }

    /// Create an error for SQL the paging planner cannot take apart.
    pub fn unparsable_query(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnparsableQuery {
            sql: sql.into(),
            message: message.into(),
        }
    }

    pub fn dialect_constraint(dialect: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DialectConstraint {
            dialect: dialect.into(),
            message: message.into(),
        }
    }

    /// Create a value conversion error.
    pub fn conversion(
        from: impl Into<String>,
        to: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conversion {
            from: from.into(),
            to: to.into(),
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// True for errors reported by the driver rather than by the mapping core.
    pub fn is_driver_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Database { .. } | Self::Timeout { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnDecode { index, source } => DbError::database(
                format!("Failed to decode column {}: {}", index, source),
                None,
                "Check the column types returned by the query",
            ),
            sqlx::Error::Decode(source) => DbError::database(
                format!("Decode error: {}", source),
                None,
                "Check the column types returned by the query",
            ),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reopen the connection",
            ),
            other => DbError::database(
                format!("Driver error: {}", other),
                None,
                "Check database driver configuration",
            ),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
