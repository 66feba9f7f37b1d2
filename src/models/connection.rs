//! Backend and dialect identification.
//!
//! [`DatabaseType`] names the sqlx backend a connection URL points at.
//! [`Dialect`] is the SQL flavour the mapping core generates for, detected from
//! a provider name and fixed for the lifetime of a session.

use serde::{Deserialize, Serialize};

/// Backends supported by the bundled sqlx driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Provider identifier reported to dialect detection.
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgres",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// SQL dialect used for quoting, placeholders and paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Generic dialect; also the fallback for unknown providers.
    #[default]
    SqlServer,
    SqlServerCe,
    MySql,
    PostgreSql,
    Oracle,
    SQLite,
}

impl Dialect {
    /// Detect the dialect from a provider or driver name.
    ///
    /// Matching is a case-insensitive substring test; anything unrecognized
    /// falls back to [`Dialect::SqlServer`].
    pub fn from_provider_name(provider_name: &str) -> Self {
        let lower = provider_name.to_lowercase();
        if lower.contains("mysql") || lower.contains("mariadb") {
            Self::MySql
        } else if lower.contains("sqlserverce") || lower.contains("sqlce") {
            Self::SqlServerCe
        } else if lower.contains("npgsql") || lower.contains("postgres") {
            Self::PostgreSql
        } else if lower.contains("oracle") {
            Self::Oracle
        } else if lower.contains("sqlite") {
            Self::SQLite
        } else {
            Self::SqlServer
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::SqlServer => "SQL Server",
            Self::SqlServerCe => "SQL Server Compact",
            Self::MySql => "MySQL",
            Self::PostgreSql => "PostgreSQL",
            Self::Oracle => "Oracle",
            Self::SQLite => "SQLite",
        }
    }

    /// Placeholder prefix for generated parameters.
    pub fn param_prefix(&self, connection_string: &str) -> &'static str {
        match self {
            Self::MySql if allows_user_variables(connection_string) => "?",
            Self::Oracle => ":",
            _ => "@",
        }
    }

    /// Quote a column or other identifier.
    pub fn escape_identifier(&self, name: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", name),
            Self::PostgreSql => format!("\"{}\"", name),
            Self::Oracle => format!("\"{}\"", name.to_uppercase()),
            _ => format!("[{}]", name),
        }
    }

    /// Quote a table name. Qualified names (containing `.`) are left alone.
    pub fn escape_table_name(&self, name: &str) -> String {
        if name.contains('.') {
            name.to_string()
        } else {
            self.escape_identifier(name)
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

fn allows_user_variables(connection_string: &str) -> bool {
    let lower = connection_string.to_lowercase();
    lower.contains("allow user variables=true") || lower.contains("allow_user_variables=true")
}
