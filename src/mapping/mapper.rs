//! Pluggable mapping hooks.
//!
//! A [`Mapper`] lets an application adjust table metadata, rename or drop
//! members, and supply value converters in either direction. Every method has
//! a no-op default, so implementors override only what they need.

use crate::error::DbResult;
use crate::models::{FieldType, Value, ValueKind};
use std::sync::Arc;

/// A value conversion installed into a materializer or parameter builder.
pub type Converter = Arc<dyn Fn(Value) -> DbResult<Value> + Send + Sync>;

/// Table-level metadata for a shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub table_name: String,
    pub primary_key: String,
    pub auto_increment: bool,
    /// Sequence used for key generation on backends that need one.
    pub sequence_name: Option<String>,
}

impl TableInfo {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            primary_key: DEFAULT_PRIMARY_KEY.to_string(),
            auto_increment: false,
            sequence_name: None,
        }
    }
}

/// Primary key column assumed when a shape does not declare one.
pub const DEFAULT_PRIMARY_KEY: &str = "ID";

/// Column naming decided for one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub column_name: String,
    pub result_column: bool,
}

/// Member context handed to member-specific converter lookups.
#[derive(Debug, Clone, Copy)]
pub struct MemberInfo<'a> {
    pub shape: &'a str,
    pub member: &'a str,
    pub column: &'a str,
    pub field_type: FieldType,
}

pub trait Mapper: Send + Sync {
    /// Adjust table metadata after the shape's own declaration is applied.
    fn table_info(&self, _shape: &str, _table: &mut TableInfo) {}

    /// Rename a member's column or mark it result-only.
    /// Returning `false` excludes the member from the shape.
    fn map_member(&self, _shape: &str, _member: &str, _mapping: &mut ColumnMapping) -> bool {
        true
    }

    /// Converter for reading a column into one specific member.
    fn from_db_converter(&self, _member: &MemberInfo<'_>, _source: ValueKind) -> Option<Converter> {
        None
    }

    /// Converter keyed by destination/source type pair. `target` is `None`
    /// for schema-less records.
    fn from_db_converter_for_type(
        &self,
        _target: Option<FieldType>,
        _source: ValueKind,
    ) -> Option<Converter> {
        None
    }

    /// Converter applied to an argument before it is bound as a parameter.
    fn to_db_converter(&self, _source: ValueKind) -> Option<Converter> {
        None
    }
}

/// Mapper that keeps every declaration as written.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMapper;

impl Mapper for DefaultMapper {}
