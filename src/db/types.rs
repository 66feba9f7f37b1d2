//! Database-agnostic type mappings.
//!
//! This module maps database-specific column types onto [`Value`].
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction
//!
//! The category also fixes the [`ValueKind`] reported in the result schema,
//! so a column's schema kind and its decoded values agree. SQLite is the
//! exception: its values carry their own storage class, which can differ
//! from the declared type row by row.

use crate::error::DbResult;
use crate::models::{ColumnInfo, DatabaseType, ResultSchema, Value, ValueKind};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};
use tracing::warn;
use uuid::Uuid;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    UnsignedInteger,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Date,
    DateTime,
    DateTimeUtc,
    Unknown,
}

impl TypeCategory {
    /// Kind of the values decoded for this category.
    pub fn value_kind(self) -> ValueKind {
        match self {
            Self::Integer => ValueKind::I64,
            Self::UnsignedInteger => ValueKind::U64,
            Self::Float => ValueKind::F64,
            Self::Decimal => ValueKind::Decimal,
            Self::Boolean => ValueKind::Bool,
            Self::Binary => ValueKind::Bytes,
            Self::Json => ValueKind::Json,
            Self::Uuid => ValueKind::Uuid,
            Self::Date | Self::DateTime => ValueKind::DateTime,
            Self::DateTimeUtc => ValueKind::DateTimeUtc,
            Self::Text | Self::Unknown => ValueKind::String,
        }
    }
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite stores NUMERIC affinity values as integers or floats
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    // Date/time before integers: "interval" and "point" contain "int"
    if lower.contains("timestamptz") || lower.contains("with time zone") {
        return TypeCategory::DateTimeUtc;
    }
    if lower.starts_with("timestamp") {
        // MySQL TIMESTAMP values are stored in UTC
        if db == DatabaseType::MySQL {
            return TypeCategory::DateTimeUtc;
        }
        return TypeCategory::DateTime;
    }
    if lower.starts_with("datetime") {
        return TypeCategory::DateTime;
    }
    if lower == "date" {
        return TypeCategory::Date;
    }
    if lower.contains("interval") || lower.contains("point") {
        return TypeCategory::Unknown;
    }

    // Integer types
    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        if lower.contains("unsigned") {
            return TypeCategory::UnsignedInteger;
        }
        return TypeCategory::Integer;
    }

    // Boolean
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    // Float types
    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    // JSON types
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    // Binary types
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char")
        || lower.contains("text")
        || lower.contains("clob")
        || lower == "string"
        || lower == "name"
    {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Result schema of a row's columns.
pub fn row_schema<R: Row>(row: &R, db: DatabaseType) -> ResultSchema {
    ResultSchema::new(
        row.columns()
            .iter()
            .map(|col| {
                let type_name = col.type_info().name();
                ColumnInfo::new(
                    col.name(),
                    categorize_type(type_name, db).value_kind(),
                    normalize_type_name(type_name),
                )
            })
            .collect(),
    )
}

/// Trait for converting database rows to values in column order.
pub trait DecodeRow {
    fn schema(&self) -> ResultSchema;
    fn decode_values(&self) -> DbResult<Vec<Value>>;
}

impl DecodeRow for MySqlRow {
    fn schema(&self) -> ResultSchema {
        row_schema(self, DatabaseType::MySQL)
    }

    fn decode_values(&self) -> DbResult<Vec<Value>> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::MySQL);
                mysql::decode_column(self, idx, type_name, category)
            })
            .collect()
    }
}

impl DecodeRow for PgRow {
    fn schema(&self) -> ResultSchema {
        row_schema(self, DatabaseType::PostgreSQL)
    }

    fn decode_values(&self) -> DbResult<Vec<Value>> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::PostgreSQL);
                postgres::decode_column(self, idx, type_name, category)
            })
            .collect()
    }
}

impl DecodeRow for SqliteRow {
    fn schema(&self) -> ResultSchema {
        row_schema(self, DatabaseType::SQLite)
    }

    fn decode_values(&self) -> DbResult<Vec<Value>> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), DatabaseType::SQLite);
                sqlite::decode_column(self, idx, category)
            })
            .collect()
    }
}

fn opt<T>(value: Option<T>, wrap: impl FnOnce(T) -> Value) -> Value {
    value.map(wrap).unwrap_or(Value::Null)
}

fn midnight(date: NaiveDate) -> Value {
    Value::DateTime(date.and_time(NaiveTime::MIN))
}

fn float(v: f64) -> Value {
    Value::F64(v)
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<Value> {
        Ok(match category {
            TypeCategory::Decimal => {
                opt(row.try_get::<Option<RawDecimal>, _>(idx)?, |v| Value::Decimal(v.0))
            }
            TypeCategory::Integer => opt(row.try_get::<Option<i64>, _>(idx)?, Value::I64),
            TypeCategory::UnsignedInteger => opt(row.try_get::<Option<u64>, _>(idx)?, Value::U64),
            TypeCategory::Boolean => opt(row.try_get::<Option<bool>, _>(idx)?, Value::Bool),
            TypeCategory::Float => decode_float(row, idx)?,
            TypeCategory::Binary => opt(row.try_get::<Option<Vec<u8>>, _>(idx)?, Value::Bytes),
            // MySQL JSON type should be decoded as serde_json::Value directly
            TypeCategory::Json => opt(row.try_get::<Option<JsonValue>, _>(idx)?, Value::Json),
            TypeCategory::Date => opt(row.try_get::<Option<NaiveDate>, _>(idx)?, midnight),
            TypeCategory::DateTime => {
                opt(row.try_get::<Option<NaiveDateTime>, _>(idx)?, Value::DateTime)
            }
            TypeCategory::DateTimeUtc => {
                opt(row.try_get::<Option<DateTime<Utc>>, _>(idx)?, Value::DateTimeUtc)
            }
            _ => decode_text(row, idx, type_name),
        })
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> DbResult<Value> {
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return Ok(opt(v, |v| float(f64::from(v))));
        }
        Ok(opt(row.try_get::<Option<f64>, _>(idx)?, float))
    }

    fn decode_text(row: &MySqlRow, idx: usize, type_name: &str) -> Value {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(v) => opt(v, Value::String),
            Err(_) => match row.try_get::<Option<Vec<u8>>, _>(idx) {
                Ok(v) => opt(v, Value::Bytes),
                Err(e) => {
                    warn!(column = idx, type_name, error = %e, "Unsupported MySQL column type");
                    Value::Null
                }
            },
        }
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<Value> {
        Ok(match category {
            TypeCategory::Decimal => {
                opt(row.try_get::<Option<RawDecimal>, _>(idx)?, |v| Value::Decimal(v.0))
            }
            TypeCategory::Integer | TypeCategory::UnsignedInteger => decode_integer(row, idx)?,
            TypeCategory::Boolean => opt(row.try_get::<Option<bool>, _>(idx)?, Value::Bool),
            TypeCategory::Float => decode_float(row, idx)?,
            TypeCategory::Binary => opt(row.try_get::<Option<Vec<u8>>, _>(idx)?, Value::Bytes),
            TypeCategory::Json => opt(row.try_get::<Option<JsonValue>, _>(idx)?, Value::Json),
            TypeCategory::Uuid => opt(row.try_get::<Option<Uuid>, _>(idx)?, Value::Uuid),
            TypeCategory::Date => opt(row.try_get::<Option<NaiveDate>, _>(idx)?, midnight),
            TypeCategory::DateTime => {
                opt(row.try_get::<Option<NaiveDateTime>, _>(idx)?, Value::DateTime)
            }
            TypeCategory::DateTimeUtc => {
                opt(row.try_get::<Option<DateTime<Utc>>, _>(idx)?, Value::DateTimeUtc)
            }
            _ => decode_text(row, idx, type_name),
        })
    }

    fn decode_integer(row: &PgRow, idx: usize) -> DbResult<Value> {
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return Ok(opt(v, |v| Value::I64(v.into())));
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return Ok(opt(v, |v| Value::I64(v.into())));
        }
        Ok(opt(row.try_get::<Option<i64>, _>(idx)?, Value::I64))
    }

    fn decode_float(row: &PgRow, idx: usize) -> DbResult<Value> {
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return Ok(opt(v, |v| float(f64::from(v))));
        }
        Ok(opt(row.try_get::<Option<f64>, _>(idx)?, float))
    }

    fn decode_text(row: &PgRow, idx: usize, type_name: &str) -> Value {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(v) => opt(v, Value::String),
            Err(e) => {
                warn!(column = idx, type_name, error = %e, "Unsupported PostgreSQL column type");
                Value::Null
            }
        }
    }
}

mod sqlite {
    use super::*;

    /// Decode by the value's storage class, refined by the declared category.
    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> DbResult<Value> {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        let storage = raw.type_info().name().to_string();

        Ok(match storage.as_str() {
            "INTEGER" => decode_integer(row, idx, category)?,
            "REAL" => float(row.try_get::<f64, _>(idx)?),
            "BLOB" => {
                let bytes = row.try_get::<Vec<u8>, _>(idx)?;
                match category {
                    TypeCategory::Uuid => Uuid::from_slice(&bytes)
                        .map(Value::Uuid)
                        .unwrap_or(Value::Bytes(bytes)),
                    _ => Value::Bytes(bytes),
                }
            }
            _ => decode_text(row, idx, category)?,
        })
    }

    fn decode_integer(row: &SqliteRow, idx: usize, category: TypeCategory) -> DbResult<Value> {
        Ok(match category {
            TypeCategory::Boolean => Value::Bool(row.try_get::<i64, _>(idx)? != 0),
            TypeCategory::DateTime | TypeCategory::Date => row
                .try_get::<NaiveDateTime, _>(idx)
                .map(Value::DateTime)
                .or_else(|_| row.try_get::<i64, _>(idx).map(Value::I64))?,
            TypeCategory::Float => Value::F64(row.try_get::<i64, _>(idx)? as f64),
            _ => Value::I64(row.try_get::<i64, _>(idx)?),
        })
    }

    fn decode_text(row: &SqliteRow, idx: usize, category: TypeCategory) -> DbResult<Value> {
        let text = row.try_get::<String, _>(idx)?;
        Ok(match category {
            TypeCategory::DateTime | TypeCategory::DateTimeUtc => row
                .try_get::<NaiveDateTime, _>(idx)
                .map(Value::DateTime)
                .unwrap_or(Value::String(text)),
            TypeCategory::Date => row
                .try_get::<NaiveDate, _>(idx)
                .map(midnight)
                .unwrap_or(Value::String(text)),
            TypeCategory::Json => serde_json::from_str::<JsonValue>(&text)
                .map(Value::Json)
                .unwrap_or(Value::String(text)),
            TypeCategory::Uuid => Uuid::parse_str(&text)
                .map(Value::Uuid)
                .unwrap_or(Value::String(text)),
            _ => Value::String(text),
        })
    }
}

// =============================================================================
// Type Normalization
// =============================================================================

/// Normalize a database type name to a more consistent format.
pub fn normalize_type_name(type_name: &str) -> String {
    let lower = type_name.to_lowercase();

    match lower.as_str() {
        // Integers
        "int4" | "integer" | "int" => "integer".to_string(),
        "int8" | "bigint" | "bigserial" => "bigint".to_string(),
        "int2" | "smallint" => "smallint".to_string(),
        "tinyint" | "tiny" => "tinyint".to_string(),
        // Text
        "varchar" | "character varying" | "text" | "string" => "text".to_string(),
        "char" | "character" | "bpchar" => "char".to_string(),
        // Boolean
        "bool" | "boolean" => "boolean".to_string(),
        // Float
        "float4" | "real" | "float" => "real".to_string(),
        "float8" | "double precision" | "double" => "double".to_string(),
        // Binary
        "bytea" | "blob" | "binary" | "varbinary" => "binary".to_string(),
        // Date/Time
        "timestamp" | "datetime" => "timestamp".to_string(),
        "timestamptz" => "timestamptz".to_string(),
        "date" => "date".to_string(),
        "time" | "timetz" => "time".to_string(),
        // JSON
        "json" | "jsonb" => "json".to_string(),
        // UUID
        "uuid" => "uuid".to_string(),
        // Default
        _ => lower,
    }
}
