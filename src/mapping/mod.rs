//! Shape mapping and row materialization.
//!
//! This module provides:
//! - Shape declarations and the shape registry
//! - Compiled, cached row materializers
//! - Multi-shape splitting and auto-join
//! - The pluggable [`Mapper`] hooks

mod cache;
pub mod context;
pub mod mapper;
pub mod materializer;
pub mod record;
pub mod shape;
pub mod split;

pub use context::MappingContext;
pub use mapper::{
    ColumnMapping, Converter, DEFAULT_PRIMARY_KEY, DefaultMapper, Mapper, MemberInfo, TableInfo,
};
pub use materializer::{
    BuildContext, Materializable, Materializer, MaterializerCache, MaterializerKey, RowFn,
    SelectSource, converter_for,
};
pub use record::Record;
pub use shape::{
    ColumnDescriptor, Entity, ErasedShape, MemberDef, RelationDescriptor, ShapeBuilder,
    ShapeDescriptor, ShapeHandle, ShapeRegistry,
};
pub use split::{
    ColumnRange, JoinPlan, MultiShapePlan, Part, PartMaterializer, ShapeTuple, split_points,
};
