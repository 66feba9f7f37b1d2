//! Parameter binding for the sqlx driver.
//!
//! These functions bind a bound [`Parameter`] onto a backend-specific sqlx
//! query. Each backend gets the closest native type its protocol supports;
//! values it cannot represent are widened or rejected.

use crate::error::{DbError, DbResult};
use crate::models::{Parameter, Value, ValueKind};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};
use uuid::Uuid;

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;
type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;
type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn unbindable(param: &Parameter, backend: &str) -> DbError {
    DbError::invalid_input(format!(
        "Parameter {} of type {} cannot be bound for {}",
        param.name,
        param.value.type_name(),
        backend
    ))
}

fn out_of_range(param: &Parameter, target: &str) -> DbError {
    DbError::conversion(
        param.value.type_name(),
        target,
        format!("value of parameter {} is out of range", param.name),
    )
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: MySqlQuery<'q>,
    param: &'q Parameter,
) -> DbResult<MySqlQuery<'q>> {
    Ok(match &param.value {
        Value::Null => match param.db_type {
            Some(ValueKind::Bool) => query.bind(None::<bool>),
            Some(kind) if kind.is_integral() => query.bind(None::<i64>),
            Some(ValueKind::F32 | ValueKind::F64) => query.bind(None::<f64>),
            Some(ValueKind::Bytes) => query.bind(None::<Vec<u8>>),
            Some(ValueKind::DateTime) => query.bind(None::<NaiveDateTime>),
            Some(ValueKind::DateTimeUtc) => query.bind(None::<DateTime<Utc>>),
            _ => query.bind(None::<String>),
        },
        Value::Bool(v) => query.bind(*v),
        Value::I8(v) => query.bind(*v),
        Value::I16(v) => query.bind(*v),
        Value::I32(v) => query.bind(*v),
        Value::I64(v) => query.bind(*v),
        Value::U8(v) => query.bind(*v),
        Value::U16(v) => query.bind(*v),
        Value::U32(v) => query.bind(*v),
        Value::U64(v) => query.bind(*v),
        Value::F32(v) => query.bind(*v),
        Value::F64(v) => query.bind(*v),
        Value::Decimal(v) | Value::String(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
        Value::DateTime(v) => query.bind(*v),
        Value::DateTimeUtc(v) => query.bind(*v),
        Value::Uuid(v) => query.bind(v.to_string()),
        Value::Json(v) => query.bind(Json(v)),
        Value::List(_) => return Err(unbindable(param, "MySQL")),
    })
}

/// Bind a parameter to a PostgreSQL query.
///
/// PostgreSQL has no unsigned integers; they are widened to the next signed
/// type, and `u64` values above `i64::MAX` are rejected.
pub(crate) fn bind_postgres_param<'q>(
    query: PgQuery<'q>,
    param: &'q Parameter,
) -> DbResult<PgQuery<'q>> {
    Ok(match &param.value {
        Value::Null => match param.db_type {
            Some(ValueKind::Bool) => query.bind(None::<bool>),
            Some(ValueKind::I8 | ValueKind::I16 | ValueKind::U8) => query.bind(None::<i16>),
            Some(ValueKind::I32 | ValueKind::U16) => query.bind(None::<i32>),
            Some(kind) if kind.is_integral() => query.bind(None::<i64>),
            Some(ValueKind::F32 | ValueKind::F64) => query.bind(None::<f64>),
            Some(ValueKind::Bytes) => query.bind(None::<Vec<u8>>),
            Some(ValueKind::DateTime) => query.bind(None::<NaiveDateTime>),
            Some(ValueKind::DateTimeUtc) => query.bind(None::<DateTime<Utc>>),
            Some(ValueKind::Uuid) => query.bind(None::<Uuid>),
            Some(ValueKind::Json) => query.bind(None::<Json<serde_json::Value>>),
            _ => query.bind(None::<String>),
        },
        Value::Bool(v) => query.bind(*v),
        Value::I8(v) => query.bind(i16::from(*v)),
        Value::I16(v) => query.bind(*v),
        Value::I32(v) => query.bind(*v),
        Value::I64(v) => query.bind(*v),
        Value::U8(v) => query.bind(i16::from(*v)),
        Value::U16(v) => query.bind(i32::from(*v)),
        Value::U32(v) => query.bind(i64::from(*v)),
        Value::U64(v) => {
            let v = i64::try_from(*v).map_err(|_| out_of_range(param, "i64"))?;
            query.bind(v)
        }
        Value::F32(v) => query.bind(*v),
        Value::F64(v) => query.bind(*v),
        Value::Decimal(v) | Value::String(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
        Value::DateTime(v) => query.bind(*v),
        Value::DateTimeUtc(v) => query.bind(*v),
        Value::Uuid(v) => query.bind(*v),
        Value::Json(v) => query.bind(Json(v)),
        Value::List(_) => return Err(unbindable(param, "PostgreSQL")),
    })
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: SqliteQuery<'q>,
    param: &'q Parameter,
) -> DbResult<SqliteQuery<'q>> {
    Ok(match &param.value {
        Value::Null => match param.db_type {
            Some(ValueKind::Bool) => query.bind(None::<bool>),
            Some(kind) if kind.is_integral() => query.bind(None::<i64>),
            Some(ValueKind::F32 | ValueKind::F64) => query.bind(None::<f64>),
            Some(ValueKind::Bytes) => query.bind(None::<Vec<u8>>),
            _ => query.bind(None::<String>),
        },
        Value::Bool(v) => query.bind(*v),
        Value::I8(v) => query.bind(*v),
        Value::I16(v) => query.bind(*v),
        Value::I32(v) => query.bind(*v),
        Value::I64(v) => query.bind(*v),
        Value::U8(v) => query.bind(*v),
        Value::U16(v) => query.bind(*v),
        Value::U32(v) => query.bind(*v),
        Value::U64(v) => {
            let v = i64::try_from(*v).map_err(|_| out_of_range(param, "i64"))?;
            query.bind(v)
        }
        Value::F32(v) => query.bind(f64::from(*v)),
        Value::F64(v) => query.bind(*v),
        Value::Decimal(v) | Value::String(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
        Value::DateTime(v) => query.bind(*v),
        Value::DateTimeUtc(v) => query.bind(*v),
        Value::Uuid(v) => query.bind(v.to_string()),
        // SQLite doesn't have native JSON type, store as string
        Value::Json(v) => query.bind(v.to_string()),
        Value::List(_) => return Err(unbindable(param, "SQLite")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_parameters_are_rejected() {
        let param = Parameter::input(Value::List(vec![Value::I32(1)]));
        let result = bind_sqlite_param(sqlx::query::<Sqlite>("SELECT ?"), &param);
        assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    }

    #[test]
    fn test_large_unsigned_rejected_for_postgres() {
        let param = Parameter::input(Value::U64(u64::MAX));
        let result = bind_postgres_param(sqlx::query::<Postgres>("SELECT $1"), &param);
        assert!(matches!(result, Err(DbError::Conversion { .. })));

        let param = Parameter::input(Value::U64(42));
        assert!(bind_postgres_param(sqlx::query::<Postgres>("SELECT $1"), &param).is_ok());
    }
}
