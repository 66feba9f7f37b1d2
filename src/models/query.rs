//! Query-related data models.
//!
//! This module defines the argument, parameter and command types that travel
//! from the binder to a driver, plus the result schema and [`Page`] types
//! travelling back.

use crate::models::value::{FieldValue, Value, ValueKind};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Arguments
// =============================================================================

/// Something a named placeholder such as `@name` can be resolved against.
pub trait ArgObject: Send + Sync + std::fmt::Debug {
    /// Look up a member by name. `None` means the object has no such member.
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl ArgObject for serde_json::Map<String, JsonValue> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned().map(Value::from_json)
    }
}

impl ArgObject for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// A positional argument handed to a query.
#[derive(Debug, Clone)]
pub enum Arg {
    /// A plain value. [`Value::List`] expands into several placeholders.
    Value(Value),
    /// A source of named values for `@name` placeholders.
    Object(Arc<dyn ArgObject>),
    /// A fully specified driver parameter, passed through unchanged.
    Parameter(Parameter),
}

impl Arg {
    pub fn object(object: impl ArgObject + 'static) -> Self {
        Self::Object(Arc::new(object))
    }

    /// Build an argument from JSON: objects provide named values, everything
    /// else becomes a plain value.
    pub fn json(json: JsonValue) -> Self {
        match json {
            JsonValue::Object(map) => Self::object(map),
            other => Self::Value(Value::from_json(other)),
        }
    }

    /// Get the type name of this argument for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Value(v) => v.type_name(),
            Self::Object(_) => "object",
            Self::Parameter(p) => p.value.type_name(),
        }
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<Parameter> for Arg {
    fn from(p: Parameter) -> Self {
        Self::Parameter(p)
    }
}

impl<T: FieldValue> From<Option<T>> for Arg {
    fn from(v: Option<T>) -> Self {
        Self::Value(v.to_value())
    }
}

macro_rules! impl_arg_from {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(v: $ty) -> Self {
                    Self::Value(Value::from(v))
                }
            }
        )+
    };
}

impl_arg_from!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    f32,
    f64,
    String,
    &str,
    Vec<u8>,
    Uuid,
    NaiveDateTime,
    DateTime<Utc>,
    JsonValue,
);

/// Build a `Vec<Arg>` from a list of expressions.
///
/// ```
/// let args = rowshape::args![1, "two", rowshape::models::Value::list([3, 4])];
/// assert_eq!(args.len(), 3);
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::models::Arg>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        vec![$($crate::models::Arg::from($arg)),+]
    };
}

// =============================================================================
// Parameters and Commands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

/// A bound command parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Placeholder name including its prefix, e.g. `@0`. Assigned at bind time.
    pub name: String,
    pub value: Value,
    pub direction: ParameterDirection,
    /// Provider type hint.
    pub db_type: Option<ValueKind>,
    /// Provider size hint.
    pub size: Option<usize>,
}

impl Parameter {
    pub fn input(value: impl Into<Value>) -> Self {
        Self {
            name: String::new(),
            value: value.into(),
            direction: ParameterDirection::Input,
            db_type: None,
            size: None,
        }
    }

    pub fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_db_type(mut self, db_type: ValueKind) -> Self {
        self.db_type = Some(db_type);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
}

/// Byte range of a generated placeholder inside rewritten SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder {
    pub start: usize,
    pub end: usize,
    /// Index into the command's parameter list.
    pub index: usize,
}

/// A fully prepared command, ready for a driver.
#[derive(Debug, Clone, Default)]
pub struct Command {
    pub sql: String,
    pub parameters: Vec<Parameter>,
    /// Empty when named parameters are disabled and the SQL is native.
    pub placeholders: Vec<Placeholder>,
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    /// Rewrite generated placeholders with a driver-specific renderer.
    ///
    /// `render` receives each placeholder's parameter index and its position
    /// among all placeholders. Returns the new SQL plus the parameter index of
    /// each placeholder in order of appearance.
    pub fn render_placeholders<F>(&self, mut render: F) -> (String, Vec<usize>)
    where
        F: FnMut(usize, usize) -> String,
    {
        if self.placeholders.is_empty() {
            return (self.sql.clone(), (0..self.parameters.len()).collect());
        }
        let mut sql = String::with_capacity(self.sql.len());
        let mut order = Vec::with_capacity(self.placeholders.len());
        let mut last = 0;
        for placeholder in &self.placeholders {
            // Spans that no longer fit the SQL are left as literal text.
            let Some(text) = self.sql.get(last..placeholder.start) else {
                continue;
            };
            if self.sql.get(placeholder.start..placeholder.end).is_none() {
                continue;
            }
            sql.push_str(text);
            sql.push_str(&render(placeholder.index, order.len()));
            order.push(placeholder.index);
            last = placeholder.end;
        }
        sql.push_str(self.sql.get(last..).unwrap_or_default());
        (sql, order)
    }
}

// =============================================================================
// Results
// =============================================================================

/// Metadata for one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Source type the driver decodes this column into.
    #[serde(skip)]
    pub kind: ValueKind,
    /// Database type name as reported by the driver.
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, kind: ValueKind, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            type_name: type_name.into(),
        }
    }
}

/// Shape of a result set as reported by a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultSchema {
    columns: Vec<ColumnInfo>,
}

impl ResultSchema {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self { columns }
    }

    pub fn field_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn name(&self, index: usize) -> &str {
        self.columns.get(index).map(|c| c.name.as_str()).unwrap_or("")
    }

    pub fn kind(&self, index: usize) -> ValueKind {
        self.columns
            .get(index)
            .map(|c| c.kind)
            .unwrap_or(ValueKind::Null)
    }
}

/// One page of results plus the totals needed to render pagination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub current_page: u64,
    pub total_pages: u64,
    pub total_items: u64,
    pub items_per_page: u64,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(current_page: u64, items_per_page: u64, total_items: u64, items: Vec<T>) -> Self {
        let total_pages = if items_per_page == 0 {
            0
        } else {
            total_items.div_ceil(items_per_page)
        };
        Self {
            current_page,
            total_pages,
            total_items,
            items_per_page,
            items,
        }
    }
}
