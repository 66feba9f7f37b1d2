//! The cache context shared by sessions.

use crate::error::DbResult;
use crate::mapping::cache::CacheMap;
use crate::mapping::mapper::{DefaultMapper, Mapper};
use crate::mapping::materializer::{
    BuildContext, Materializable, Materializer, MaterializerCache, MaterializerKey,
};
use crate::mapping::shape::ShapeRegistry;
use crate::mapping::split::{JoinPlan, MultiShapePlan, ShapeTuple};
use crate::models::ResultSchema;
use std::any::TypeId;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MultiShapeKey {
    output: TypeId,
    shapes: Vec<TypeId>,
    connection: String,
    force_utc: bool,
    sql: String,
}

/// Mapper plus every mapping cache.
///
/// Caches live as long as the context. Create one per application and share
/// it between sessions through `Arc`; sessions built without one get their
/// own.
pub struct MappingContext {
    mapper: Arc<dyn Mapper>,
    shapes: ShapeRegistry,
    materializers: MaterializerCache,
    multi_shapes: CacheMap<MultiShapeKey, Arc<MultiShapePlan>>,
    joins: CacheMap<Vec<TypeId>, Arc<JoinPlan>>,
}

impl Default for MappingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingContext {
    pub fn new() -> Self {
        Self::with_mapper(Arc::new(DefaultMapper))
    }

    pub fn with_mapper(mapper: Arc<dyn Mapper>) -> Self {
        Self {
            shapes: ShapeRegistry::new(mapper.clone()),
            mapper,
            materializers: MaterializerCache::new(),
            multi_shapes: CacheMap::new("multi-shape"),
            joins: CacheMap::new("auto-join"),
        }
    }

    pub fn mapper(&self) -> &dyn Mapper {
        self.mapper.as_ref()
    }

    pub fn shapes(&self) -> &ShapeRegistry {
        &self.shapes
    }

    pub fn materializers(&self) -> &MaterializerCache {
        &self.materializers
    }

    fn build_context<'a>(&'a self, schema: &'a ResultSchema, force_utc: bool) -> BuildContext<'a> {
        BuildContext {
            registry: &self.shapes,
            mapper: self.mapper.as_ref(),
            schema,
            force_utc,
            first: 0,
            count: schema.field_count(),
        }
    }

    /// Materializer for the whole of `schema`, compiled on first use.
    pub fn materializer_for<T: Materializable>(
        &self,
        sql: &str,
        connection: &str,
        schema: &ResultSchema,
        force_utc: bool,
    ) -> DbResult<Arc<Materializer<T>>> {
        let key = MaterializerKey {
            shape: TypeId::of::<T>(),
            sql: sql.to_string(),
            connection: connection.to_string(),
            force_utc,
            first: 0,
            count: schema.field_count(),
        };
        self.materializers
            .get_or_build(key, || T::compile(&self.build_context(schema, force_utc)))
    }

    /// Split and per-shape materializers for a multi-shape query.
    pub fn multi_shape_plan<S: ShapeTuple>(
        &self,
        output: TypeId,
        sql: &str,
        connection: &str,
        schema: &ResultSchema,
        force_utc: bool,
    ) -> DbResult<Arc<MultiShapePlan>> {
        let key = MultiShapeKey {
            output,
            shapes: S::type_ids(),
            connection: connection.to_string(),
            force_utc,
            sql: sql.to_string(),
        };
        self.multi_shapes.get_or_try_insert(key, || {
            MultiShapePlan::compile::<S>(&self.build_context(schema, force_utc)).map(Arc::new)
        })
    }

    /// Auto-join plan for the shapes of `S`.
    pub fn join_plan<S: ShapeTuple>(&self) -> DbResult<Arc<JoinPlan>> {
        self.joins.get_or_try_insert(S::type_ids(), || {
            JoinPlan::build(S::handles(&self.shapes)?).map(Arc::new)
        })
    }
}
