//! SQL rewriting.
//!
//! This module provides:
//! - Placeholder binding and parameter creation
//! - Count and page query planning
//! - Statement classification

pub mod binder;
pub mod classify;
pub mod paging;

pub use binder::{BoundSql, ParameterBinder, create_parameter, locate_placeholders};
pub use classify::{StatementKind, classify, ensure_query};
pub use paging::{
    PageQueries, PagingParts, add_select_clause, build_page_queries, page_offset,
    split_for_paging,
};
