//! rowshape
//!
//! A micro-ORM data-access core: it maps rows onto registered entity shapes
//! through compiled, cached materializers, splits joined rows across several
//! shapes, rewrites `@`-placeholder SQL for the target driver, plans paged
//! queries, and manages a reference-counted connection and nested
//! transactions on top of sqlx (SQLite, PostgreSQL, MySQL).

pub mod config;
pub mod db;
pub mod error;
pub mod mapping;
pub mod models;
pub mod sql;

pub use config::{Config, DatabaseConfig, SessionOptions};
pub use db::{Database, SqlxDriver};
pub use error::{DbError, DbResult};
pub use mapping::{Entity, MappingContext, Record};
pub use models::{Arg, Dialect, Page, Value};
