//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - The driver contract the session runs on
//! - The session: connection and transaction lifecycle plus every query operation
//! - Observation hooks
//! - The sqlx driver with its parameter binding and type mappings

pub mod driver;
pub mod hooks;
pub mod params;
pub mod session;
pub mod sqlx_driver;
pub mod types;

pub use driver::{Connection, Cursor, Driver};
pub use hooks::{DatabaseHooks, NoHooks, TracingHooks};
pub use session::{Database, DatabaseBuilder, format_command};
pub use sqlx_driver::{SqlxConnection, SqlxDriver, native_sql};
pub use types::{DecodeRow, TypeCategory, categorize_type};
