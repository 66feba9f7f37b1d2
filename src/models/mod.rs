//! Data models for rowshape.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod value;

// Re-export commonly used types
pub use connection::{DatabaseType, Dialect};
pub use query::{
    Arg, ArgObject, ColumnInfo, Command, Page, Parameter, ParameterDirection, Placeholder,
    ResultSchema,
};
pub use value::{FieldType, FieldValue, Value, ValueKind, coerce};
