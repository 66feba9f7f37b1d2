//! Multi-shape queries.
//!
//! A joined query returns the columns of several shapes side by side. The
//! split engine decides which column range belongs to which shape, compiles a
//! materializer per range, and either hands the parts to a caller-supplied
//! combinator or wires them together through the shapes' declared relations.

use crate::error::{DbError, DbResult};
use crate::mapping::materializer::{BuildContext, Materializable, Materializer};
use crate::mapping::shape::{Entity, ShapeHandle, ShapeRegistry};
use crate::models::{ResultSchema, Value};
use std::any::{Any, TypeId};
use std::collections::HashSet;
use tracing::debug;

/// Columns owned by one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRange {
    pub first: usize,
    pub count: usize,
}

/// Partition `schema` into one column range per shape.
///
/// A shape's range ends at the first column whose name it has already seen,
/// or that it lacks while the next shape has it. The last shape takes every
/// remaining column.
pub fn split_points(shapes: &[ShapeHandle], schema: &ResultSchema) -> DbResult<Vec<ColumnRange>> {
    let field_count = schema.field_count();
    let mut ranges = Vec::with_capacity(shapes.len());
    let mut pos = 0;

    for (i, shape) in shapes.iter().enumerate() {
        let first = pos;
        let Some(next) = shapes.get(i + 1) else {
            ranges.push(ColumnRange {
                first,
                count: field_count.saturating_sub(first),
            });
            break;
        };

        let mut seen = HashSet::new();
        let mut found = false;
        while pos < field_count {
            let name = schema.name(pos);
            let lower = name.to_lowercase();
            if seen.contains(&lower) || (!shape.has_column(name) && next.has_column(name)) {
                found = true;
                break;
            }
            seen.insert(lower);
            pos += 1;
        }

        if !found {
            return Err(DbError::mapping(
                shape.shape_name(),
                format!(
                    "Couldn't find split point between {} and {}",
                    shape.shape_name(),
                    next.shape_name()
                ),
            ));
        }
        ranges.push(ColumnRange {
            first,
            count: pos - first,
        });
    }

    Ok(ranges)
}

// =============================================================================
// Per-shape Parts
// =============================================================================

/// A materialized part, or `None` when the shape's columns were all null.
pub type Part = Option<Box<dyn Any + Send>>;

/// Type-erased materializer for one shape of a multi-shape row.
pub struct PartMaterializer {
    inner: Materializer<Box<dyn Any + Send>>,
}

impl PartMaterializer {
    fn compile<E: Entity>(ctx: &BuildContext<'_>, range: ColumnRange) -> DbResult<Self> {
        let ctx = BuildContext {
            first: range.first,
            count: range.count,
            ..*ctx
        };
        let func = E::compile(&ctx)?;
        Ok(Self {
            inner: Materializer::new(
                range.first,
                range.count,
                Box::new(move |row: &mut [Value]| {
                    let item: Box<dyn Any + Send> = Box::new(func(row)?);
                    Ok(item)
                }),
            ),
        })
    }

    pub fn range(&self) -> ColumnRange {
        ColumnRange {
            first: self.inner.first(),
            count: self.inner.count(),
        }
    }

    pub fn materialize(&self, row: &mut [Value]) -> DbResult<Part> {
        if self.inner.is_null_range(row) {
            return Ok(None);
        }
        self.inner.materialize(row).map(Some)
    }
}

/// Compiled materializers for every shape of a multi-shape query.
pub struct MultiShapePlan {
    parts: Vec<PartMaterializer>,
}

impl MultiShapePlan {
    /// Split `ctx.schema` across the shapes of `S` and compile each range.
    pub fn compile<S: ShapeTuple>(ctx: &BuildContext<'_>) -> DbResult<Self> {
        let handles = S::handles(ctx.registry)?;
        let ranges = split_points(&handles, ctx.schema)?;
        debug!(
            shapes = %handles.iter().map(|h| h.shape_name()).collect::<Vec<_>>().join(", "),
            ranges = ?ranges,
            "Split multi-shape result"
        );
        Ok(Self {
            parts: S::part_materializers(ctx, &ranges)?,
        })
    }

    pub fn ranges(&self) -> Vec<ColumnRange> {
        self.parts.iter().map(PartMaterializer::range).collect()
    }

    pub fn materialize(&self, row: &mut [Value]) -> DbResult<Vec<Part>> {
        self.parts.iter().map(|p| p.materialize(row)).collect()
    }
}

// =============================================================================
// Shape Tuples
// =============================================================================

/// An ordered list of entity shapes queried together.
pub trait ShapeTuple: Send + 'static {
    /// The shape auto-join returns.
    type First: Entity;
    /// One `Option` per shape, handed to a combinator.
    type Parts: Send;

    const LEN: usize;

    fn handles(registry: &ShapeRegistry) -> DbResult<Vec<ShapeHandle>>;

    fn type_ids() -> Vec<TypeId>;

    fn part_materializers(
        ctx: &BuildContext<'_>,
        ranges: &[ColumnRange],
    ) -> DbResult<Vec<PartMaterializer>>;

    fn into_parts(parts: Vec<Part>) -> DbResult<Self::Parts>;

    fn empty_parts() -> Self::Parts;
}

fn next_range<'a>(ranges: &mut impl Iterator<Item = &'a ColumnRange>) -> DbResult<ColumnRange> {
    ranges
        .next()
        .copied()
        .ok_or_else(|| DbError::internal("fewer column ranges than shapes"))
}

fn take_part<E: Entity>(parts: &mut impl Iterator<Item = Part>) -> DbResult<Option<E>> {
    match parts.next() {
        Some(Some(part)) => part
            .downcast::<E>()
            .map(|item| Some(*item))
            .map_err(|_| DbError::internal("multi-shape part has an unexpected type")),
        Some(None) => Ok(None),
        None => Err(DbError::internal("fewer parts than shapes")),
    }
}

macro_rules! shape_tuple {
    ($len:literal; $first:ident $(, $rest:ident)*) => {
        impl<$first: Entity $(, $rest: Entity)*> ShapeTuple for ($first, $($rest,)*) {
            type First = $first;
            type Parts = (Option<$first>, $(Option<$rest>,)*);

            const LEN: usize = $len;

            fn handles(registry: &ShapeRegistry) -> DbResult<Vec<ShapeHandle>> {
                Ok(vec![
                    registry.handle_for::<$first>()?,
                    $(registry.handle_for::<$rest>()?,)*
                ])
            }

            fn type_ids() -> Vec<TypeId> {
                vec![TypeId::of::<$first>(), $(TypeId::of::<$rest>(),)*]
            }

            fn part_materializers(
                ctx: &BuildContext<'_>,
                ranges: &[ColumnRange],
            ) -> DbResult<Vec<PartMaterializer>> {
                let mut ranges = ranges.iter();
                Ok(vec![
                    PartMaterializer::compile::<$first>(ctx, next_range(&mut ranges)?)?,
                    $(PartMaterializer::compile::<$rest>(ctx, next_range(&mut ranges)?)?,)*
                ])
            }

            fn into_parts(parts: Vec<Part>) -> DbResult<Self::Parts> {
                let mut parts = parts.into_iter();
                Ok((
                    take_part::<$first>(&mut parts)?,
                    $(take_part::<$rest>(&mut parts)?,)*
                ))
            }

            fn empty_parts() -> Self::Parts {
                (None::<$first>, $(None::<$rest>,)*)
            }
        }
    };
}

shape_tuple!(2; A, B);
shape_tuple!(3; A, B, C);
shape_tuple!(4; A, B, C, D);

// =============================================================================
// Auto Join
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinStep {
    owner: usize,
    target: usize,
}

/// Assignments that nest later shapes into the earlier shapes holding them.
pub struct JoinPlan {
    handles: Vec<ShapeHandle>,
    steps: Vec<JoinStep>,
}

impl JoinPlan {
    pub fn build(handles: Vec<ShapeHandle>) -> DbResult<Self> {
        let mut steps = Vec::new();
        for target in 1..handles.len() {
            let target_type = handles[target].shape_type();
            let mut handled = false;
            for owner in (0..target).rev() {
                match handles[owner].relation_count(target_type) {
                    0 => {}
                    1 => {
                        steps.push(JoinStep { owner, target });
                        handled = true;
                    }
                    _ => {
                        return Err(DbError::ambiguous_join(
                            handles[owner].shape_name(),
                            handles[target].shape_name(),
                        ));
                    }
                }
            }
            if !handled {
                return Err(DbError::unresolved_join(handles[target].shape_name()));
            }
        }
        // Innermost assignments first so owners are complete before they are copied
        steps.sort_by(|a, b| b.target.cmp(&a.target).then(b.owner.cmp(&a.owner)));
        Ok(Self { handles, steps })
    }

    /// Assign each present part into its present owners.
    pub fn apply(&self, parts: &mut [Part]) -> DbResult<()> {
        for step in &self.steps {
            let (left, right) = parts.split_at_mut(step.target);
            let (Some(owner), Some(source)) = (left[step.owner].as_deref_mut(), right[0].as_deref())
            else {
                continue;
            };
            self.handles[step.owner].assign_relation(owner, source)?;
        }
        Ok(())
    }

    /// Apply the plan and return the first shape.
    pub fn join<S: ShapeTuple>(&self, mut parts: Vec<Part>) -> DbResult<Option<S::First>> {
        self.apply(&mut parts)?;
        match parts.into_iter().next().flatten() {
            Some(first) => first
                .downcast::<S::First>()
                .map(|item| Some(*item))
                .map_err(|_| DbError::internal("joined row has an unexpected type")),
            None => Ok(None),
        }
    }
}
