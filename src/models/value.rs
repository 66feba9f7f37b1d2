//! Dynamic database values.
//!
//! [`Value`] is what a driver hands back for a result cell and what the binder
//! hands to a driver for a parameter. [`FieldValue`] connects it to the concrete
//! member types an entity can declare.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A single database value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Exact numeric kept in its textual database representation.
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
    DateTimeUtc(DateTime<Utc>),
    Uuid(Uuid),
    Json(JsonValue),
    /// A collection; the binder expands it into one placeholder per element.
    List(Vec<Value>),
}

/// Runtime type of a [`Value`], also used to describe result columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Decimal,
    String,
    Bytes,
    DateTime,
    DateTimeUtc,
    Uuid,
    Json,
    List,
}

impl ValueKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Decimal => "decimal",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::DateTime => "datetime",
            Self::DateTimeUtc => "datetime_utc",
            Self::Uuid => "uuid",
            Self::Json => "json",
            Self::List => "list",
        }
    }

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            Self::I8
                | Self::I16
                | Self::I32
                | Self::I64
                | Self::U8
                | Self::U16
                | Self::U32
                | Self::U64
        )
    }

    pub fn is_date_time(&self) -> bool {
        matches!(self, Self::DateTime | Self::DateTimeUtc)
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::I8(_) => ValueKind::I8,
            Self::I16(_) => ValueKind::I16,
            Self::I32(_) => ValueKind::I32,
            Self::I64(_) => ValueKind::I64,
            Self::U8(_) => ValueKind::U8,
            Self::U16(_) => ValueKind::U16,
            Self::U32(_) => ValueKind::U32,
            Self::U64(_) => ValueKind::U64,
            Self::F32(_) => ValueKind::F32,
            Self::F64(_) => ValueKind::F64,
            Self::Decimal(_) => ValueKind::Decimal,
            Self::String(_) => ValueKind::String,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::DateTime(_) => ValueKind::DateTime,
            Self::DateTimeUtc(_) => ValueKind::DateTimeUtc,
            Self::Uuid(_) => ValueKind::Uuid,
            Self::Json(_) => ValueKind::Json,
            Self::List(_) => ValueKind::List,
        }
    }

    /// Get the type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Build a collection value that expands to one placeholder per element.
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            Self::I8(v) => Some(*v as i128),
            Self::I16(v) => Some(*v as i128),
            Self::I32(v) => Some(*v as i128),
            Self::I64(v) => Some(*v as i128),
            Self::U8(v) => Some(*v as i128),
            Self::U16(v) => Some(*v as i128),
            Self::U32(v) => Some(*v as i128),
            Self::U64(v) => Some(*v as i128),
            _ => None,
        }
    }

    /// Convert to JSON. Binary data is base64-encoded.
    pub fn to_json(&self) -> JsonValue {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::F32(v) => float_to_json(*v as f64),
            Self::F64(v) => float_to_json(*v),
            Self::Decimal(v) | Self::String(v) => JsonValue::String(v.clone()),
            Self::Bytes(v) => JsonValue::String(STANDARD.encode(v)),
            Self::DateTime(v) => JsonValue::String(v.to_string()),
            Self::DateTimeUtc(v) => JsonValue::String(v.to_rfc3339()),
            Self::Uuid(v) => JsonValue::String(v.to_string()),
            Self::Json(v) => v.clone(),
            Self::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            other => match other.as_i128() {
                Some(n) => i64::try_from(n)
                    .map(|n| JsonValue::Number(n.into()))
                    .or_else(|_| u64::try_from(n).map(|n| JsonValue::Number(n.into())))
                    .unwrap_or(JsonValue::Null),
                None => JsonValue::Null,
            },
        }
    }

    /// Build a value from a JSON literal. Arrays become lists.
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(v) => Self::Bool(v),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::I64(i)
                } else if let Some(u) = n.as_u64() {
                    Self::U64(u)
                } else {
                    Self::F64(n.as_f64().unwrap_or_default())
                }
            }
            JsonValue::String(s) => Self::String(s),
            JsonValue::Array(items) => Self::List(items.into_iter().map(Self::from_json).collect()),
            obj @ JsonValue::Object(_) => Self::Json(obj),
        }
    }
}

fn float_to_json(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{}", v),
            Self::F32(v) => write!(f, "{}", v),
            Self::F64(v) => write!(f, "{}", v),
            Self::Decimal(v) | Self::String(v) => f.write_str(v),
            Self::DateTime(v) => write!(f, "{}", v),
            Self::DateTimeUtc(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Uuid(v) => write!(f, "{}", v),
            Self::Bytes(_) | Self::Json(_) | Self::List(_) => {
                write!(f, "{}", self.to_json())
            }
            other => match other.as_i128() {
                Some(n) => write!(f, "{}", n),
                None => Ok(()),
            },
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

// =============================================================================
// Generic Coercion
// =============================================================================

fn conversion_error(value: &Value, target: ValueKind, message: impl Into<String>) -> DbError {
    DbError::conversion(value.type_name(), target.name(), message)
}

fn parse_date_time(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    const FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|d| d.naive_utc()))
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_integer(value: &Value, target: ValueKind) -> DbResult<i128> {
    if let Some(n) = value.as_i128() {
        return Ok(n);
    }
    let float = match value {
        Value::Bool(b) => return Ok(*b as i128),
        Value::F32(v) => *v as f64,
        Value::F64(v) => *v,
        Value::Decimal(s) | Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(n) = trimmed.parse::<i128>() {
                return Ok(n);
            }
            trimmed
                .parse::<f64>()
                .map_err(|e| conversion_error(value, target, e.to_string()))?
        }
        _ => return Err(conversion_error(value, target, "not a numeric value")),
    };
    if !float.is_finite() {
        return Err(conversion_error(value, target, "value is not finite"));
    }
    Ok(float.round() as i128)
}

fn parse_float(value: &Value, target: ValueKind) -> DbResult<f64> {
    if let Some(n) = value.as_i128() {
        return Ok(n as f64);
    }
    match value {
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::F32(v) => Ok(*v as f64),
        Value::F64(v) => Ok(*v),
        Value::Decimal(s) | Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| conversion_error(value, target, e.to_string())),
        _ => Err(conversion_error(value, target, "not a numeric value")),
    }
}

macro_rules! narrow {
    ($value:expr, $target:ident, $ty:ty) => {{
        let n = parse_integer(&$value, ValueKind::$target)?;
        <$ty>::try_from(n)
            .map(Value::$target)
            .map_err(|_| conversion_error(&$value, ValueKind::$target, "value out of range"))
    }};
}

/// Coerce a value to the requested kind.
///
/// Null stays null. Numeric narrowing is range checked and floats are
/// rounded when converted to integers.
pub fn coerce(value: Value, target: ValueKind) -> DbResult<Value> {
    if value.is_null() || value.kind() == target {
        return Ok(value);
    }
    match target {
        ValueKind::I8 => narrow!(value, I8, i8),
        ValueKind::I16 => narrow!(value, I16, i16),
        ValueKind::I32 => narrow!(value, I32, i32),
        ValueKind::I64 => narrow!(value, I64, i64),
        ValueKind::U8 => narrow!(value, U8, u8),
        ValueKind::U16 => narrow!(value, U16, u16),
        ValueKind::U32 => narrow!(value, U32, u32),
        ValueKind::U64 => narrow!(value, U64, u64),
        ValueKind::F32 => parse_float(&value, target).map(|v| Value::F32(v as f32)),
        ValueKind::F64 => parse_float(&value, target).map(Value::F64),
        ValueKind::Bool => match &value {
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(conversion_error(&value, target, "not a boolean literal")),
            },
            Value::F32(_) | Value::F64(_) | Value::Decimal(_) => {
                Ok(Value::Bool(parse_float(&value, target)? != 0.0))
            }
            other => other
                .as_i128()
                .map(|n| Value::Bool(n != 0))
                .ok_or_else(|| conversion_error(other, target, "not a boolean value")),
        },
        ValueKind::Decimal => match &value {
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|_| Value::Decimal(s.trim().to_string()))
                .map_err(|e| conversion_error(&value, target, e.to_string())),
            Value::Bool(_) | Value::Bytes(_) | Value::Uuid(_) | Value::Json(_) | Value::List(_) => {
                Err(conversion_error(&value, target, "not a numeric value"))
            }
            other => Ok(Value::Decimal(other.to_string())),
        },
        ValueKind::String => match value {
            Value::Bytes(bytes) => String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|e| DbError::conversion("bytes", "string", e.to_string())),
            other @ Value::List(_) => Err(conversion_error(
                &other,
                target,
                "collections are not text",
            )),
            Value::Json(JsonValue::String(s)) => Ok(Value::String(s)),
            other => Ok(Value::String(other.to_string())),
        },
        ValueKind::Bytes => match value {
            Value::String(s) => Ok(Value::Bytes(s.into_bytes())),
            Value::Uuid(u) => Ok(Value::Bytes(u.as_bytes().to_vec())),
            other => Err(conversion_error(&other, target, "not binary data")),
        },
        ValueKind::DateTime => match &value {
            Value::DateTimeUtc(d) => Ok(Value::DateTime(d.naive_utc())),
            Value::String(s) => parse_date_time(s)
                .map(Value::DateTime)
                .ok_or_else(|| conversion_error(&value, target, "unrecognized date format")),
            _ => Err(conversion_error(&value, target, "not a date")),
        },
        ValueKind::DateTimeUtc => match &value {
            Value::DateTime(d) => Ok(Value::DateTimeUtc(d.and_utc())),
            Value::String(s) => parse_date_time(s)
                .map(|d| Value::DateTimeUtc(d.and_utc()))
                .ok_or_else(|| conversion_error(&value, target, "unrecognized date format")),
            _ => Err(conversion_error(&value, target, "not a date")),
        },
        ValueKind::Uuid => match &value {
            Value::String(s) => Uuid::parse_str(s.trim())
                .map(Value::Uuid)
                .map_err(|e| conversion_error(&value, target, e.to_string())),
            Value::Bytes(b) => Uuid::from_slice(b)
                .map(Value::Uuid)
                .map_err(|e| conversion_error(&value, target, e.to_string())),
            _ => Err(conversion_error(&value, target, "not a uuid")),
        },
        ValueKind::Json => match value {
            Value::String(s) => serde_json::from_str(&s)
                .map(Value::Json)
                .map_err(|e| DbError::conversion("string", "json", e.to_string())),
            other => Ok(Value::Json(other.to_json())),
        },
        ValueKind::Null | ValueKind::List => Err(conversion_error(
            &value,
            target,
            "not a valid conversion target",
        )),
    }
}

// =============================================================================
// Member Types
// =============================================================================

/// Destination type of an entity member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldType {
    pub kind: ValueKind,
    pub is_enum: bool,
    pub nullable: bool,
    pub name: &'static str,
}

impl FieldType {
    pub const fn new(kind: ValueKind, name: &'static str) -> Self {
        Self {
            kind,
            is_enum: false,
            nullable: false,
            name,
        }
    }

    /// An enumeration stored as a 32-bit integer.
    pub const fn enumeration(name: &'static str) -> Self {
        Self {
            kind: ValueKind::I32,
            is_enum: true,
            nullable: false,
            name,
        }
    }

    pub const fn nullable(self) -> Self {
        Self {
            nullable: true,
            ..self
        }
    }

    /// True when a value of `source` kind can be assigned without conversion.
    pub fn accepts(&self, source: ValueKind) -> bool {
        self.kind == source
    }
}

/// A type that can be stored in an entity member and bound as a parameter.
pub trait FieldValue: Sized + Send + Sync + 'static {
    const FIELD_TYPE: FieldType;

    /// Take ownership of an already-converted value.
    fn from_value(value: Value) -> DbResult<Self>;

    fn to_value(&self) -> Value;
}

fn mismatch(value: &Value, expected: &'static str) -> DbError {
    DbError::conversion(
        value.type_name(),
        expected,
        "value does not match the member type",
    )
}

macro_rules! impl_field_value {
    ($($ty:ty => $kind:ident, $name:literal);+ $(;)?) => {
        $(
            impl FieldValue for $ty {
                const FIELD_TYPE: FieldType = FieldType::new(ValueKind::$kind, $name);

                fn from_value(value: Value) -> DbResult<Self> {
                    match value {
                        Value::$kind(v) => Ok(v),
                        other => Err(mismatch(&other, $name)),
                    }
                }

                fn to_value(&self) -> Value {
                    Value::$kind(self.clone())
                }
            }

            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$kind(v)
                }
            }
        )+
    };
}

impl_field_value! {
    bool => Bool, "bool";
    i8 => I8, "i8";
    i16 => I16, "i16";
    i32 => I32, "i32";
    i64 => I64, "i64";
    u8 => U8, "u8";
    u16 => U16, "u16";
    u32 => U32, "u32";
    u64 => U64, "u64";
    f32 => F32, "f32";
    f64 => F64, "f64";
    String => String, "string";
    Vec<u8> => Bytes, "bytes";
    Uuid => Uuid, "uuid";
    JsonValue => Json, "json";
}

impl FieldValue for NaiveDateTime {
    const FIELD_TYPE: FieldType = FieldType::new(ValueKind::DateTime, "datetime");

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::DateTime(v) => Ok(v),
            Value::DateTimeUtc(v) => Ok(v.naive_utc()),
            other => Err(mismatch(&other, "datetime")),
        }
    }

    fn to_value(&self) -> Value {
        Value::DateTime(*self)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl FieldValue for DateTime<Utc> {
    const FIELD_TYPE: FieldType = FieldType::new(ValueKind::DateTimeUtc, "datetime_utc");

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::DateTimeUtc(v) => Ok(v),
            Value::DateTime(v) => Ok(v.and_utc()),
            other => Err(mismatch(&other, "datetime_utc")),
        }
    }

    fn to_value(&self) -> Value {
        Value::DateTimeUtc(*self)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTimeUtc(v)
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    const FIELD_TYPE: FieldType = T::FIELD_TYPE.nullable();

    fn from_value(value: Value) -> DbResult<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }
}

impl<T: FieldValue> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.to_value()
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// Implement [`FieldValue`] for a fieldless enum stored as an `i32`.
///
/// ```
/// #[derive(Debug, Clone, Copy, Default, PartialEq)]
/// enum Status {
///     #[default]
///     Active,
///     Disabled,
/// }
///
/// rowshape::db_enum!(Status { Active = 1, Disabled = 2 });
/// ```
#[macro_export]
macro_rules! db_enum {
    ($ty:ident { $($variant:ident = $val:expr),+ $(,)? }) => {
        impl $crate::models::FieldValue for $ty {
            const FIELD_TYPE: $crate::models::FieldType =
                $crate::models::FieldType::enumeration(stringify!($ty));

            fn from_value(value: $crate::models::Value) -> $crate::error::DbResult<Self> {
                match value {
                    $(
                        $crate::models::Value::I32(v) if v == $val => Ok($ty::$variant),
                    )+
                    other => Err($crate::error::DbError::conversion(
                        other.type_name(),
                        stringify!($ty),
                        format!("{} is not a valid {}", other, stringify!($ty)),
                    )),
                }
            }

            fn to_value(&self) -> $crate::models::Value {
                match self {
                    $( $ty::$variant => $crate::models::Value::I32($val), )+
                }
            }
        }

        impl From<$ty> for $crate::models::Value {
            fn from(v: $ty) -> Self {
                $crate::models::FieldValue::to_value(&v)
            }
        }
    };
}
