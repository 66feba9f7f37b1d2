//! Row materializers.
//!
//! A materializer turns a range of one result row into a value of a single
//! shape. It is compiled once per [`MaterializerKey`] into a plan of column
//! slots and cached; materializing a row then only walks that plan.

use crate::error::{DbError, DbResult};
use crate::mapping::cache::CacheMap;
use crate::mapping::mapper::{Converter, Mapper, MemberInfo};
use crate::mapping::record::Record;
use crate::mapping::shape::{Entity, ShapeRegistry, short_type_name};
use crate::models::{FieldType, FieldValue, ResultSchema, Value, ValueKind, coerce};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use std::any::{Any, TypeId};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Compiled conversion from a row range to one value.
pub type RowFn<T> = dyn Fn(&mut [Value]) -> DbResult<T> + Send + Sync;

/// Everything a shape needs to compile its materializer.
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub registry: &'a ShapeRegistry,
    pub mapper: &'a dyn Mapper,
    pub schema: &'a ResultSchema,
    pub force_utc: bool,
    pub first: usize,
    pub count: usize,
}

impl BuildContext<'_> {
    fn columns(&self) -> std::ops::Range<usize> {
        let end = (self.first + self.count).min(self.schema.field_count());
        self.first.min(end)..end
    }
}

/// Table and column list used to synthesize a SELECT for a shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectSource {
    pub table: String,
    pub columns: Vec<String>,
}

/// A type rows can be materialized into.
///
/// Implemented for every [`Entity`], for [`Record`], and for scalar column
/// types (and their `Option`s) when a query returns a single value per row.
pub trait Materializable: Sized + Send + 'static {
    fn compile(ctx: &BuildContext<'_>) -> DbResult<Box<RowFn<Self>>>;

    /// Table and columns for auto-select. `None` for shapes without a table.
    fn select_source(_registry: &ShapeRegistry) -> DbResult<Option<SelectSource>> {
        Ok(None)
    }
}

/// A compiled materializer for one column range.
pub struct Materializer<T> {
    first: usize,
    count: usize,
    func: Box<RowFn<T>>,
}

impl<T> Materializer<T> {
    pub fn new(first: usize, count: usize, func: Box<RowFn<T>>) -> Self {
        Self { first, count, func }
    }

    pub fn first(&self) -> usize {
        self.first
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Materialize this materializer's range of `row`. Values in the range are
    /// moved out and left as [`Value::Null`].
    pub fn materialize(&self, row: &mut [Value]) -> DbResult<T> {
        let end = (self.first + self.count).min(row.len());
        let start = self.first.min(end);
        (self.func)(&mut row[start..end])
    }

    /// True when every value in this materializer's range is null.
    pub fn is_null_range(&self, row: &[Value]) -> bool {
        let end = (self.first + self.count).min(row.len());
        let start = self.first.min(end);
        row[start..end].iter().all(Value::is_null)
    }
}

// =============================================================================
// Converter Selection
// =============================================================================

fn utc_converter() -> Converter {
    Arc::new(|value| match value {
        Value::DateTime(d) => Ok(Value::DateTimeUtc(d.and_utc())),
        other => Ok(other),
    })
}

/// Pick the converter for reading `source` into `target`.
///
/// `target` is `None` for schema-less records. Returns `None` when the source
/// kind can be assigned as is.
pub fn converter_for(
    mapper: &dyn Mapper,
    member: Option<&MemberInfo<'_>>,
    target: Option<FieldType>,
    source: ValueKind,
    force_utc: bool,
) -> Option<Converter> {
    if let Some(converter) = member.and_then(|m| mapper.from_db_converter(m, source)) {
        return Some(converter);
    }
    if let Some(converter) = mapper.from_db_converter_for_type(target, source) {
        return Some(converter);
    }

    if force_utc
        && source == ValueKind::DateTime
        && target.is_none_or(|t| t.kind.is_date_time())
    {
        return Some(utc_converter());
    }

    let target = target?;
    if target.is_enum && source.is_integral() {
        if source == ValueKind::I32 {
            return None;
        }
        return Some(Arc::new(|value| coerce(value, ValueKind::I32)));
    }
    if !target.accepts(source) {
        let kind = target.kind;
        return Some(Arc::new(move |value| coerce(value, kind)));
    }
    None
}

// =============================================================================
// Typed Entities
// =============================================================================

struct Slot<T> {
    offset: usize,
    column: String,
    target: ValueKind,
    converter: Option<Converter>,
    setter: Arc<dyn Fn(&mut T, Value) -> DbResult<()> + Send + Sync>,
}

impl<E: Entity> Materializable for E {
    fn compile(ctx: &BuildContext<'_>) -> DbResult<Box<RowFn<Self>>> {
        let descriptor = ctx.registry.descriptor_for::<E>()?;
        let mut slots = Vec::new();

        for index in ctx.columns() {
            let name = ctx.schema.name(index);
            let Some(column) = descriptor.column(name) else {
                trace!(shape = %descriptor.shape_name(), column = %name, "Column has no member");
                continue;
            };
            let member = MemberInfo {
                shape: descriptor.shape_name(),
                member: &column.member_name,
                column: &column.column_name,
                field_type: column.field_type,
            };
            slots.push(Slot {
                offset: index - ctx.first,
                column: name.to_string(),
                target: column.field_type.kind,
                converter: converter_for(
                    ctx.mapper,
                    Some(&member),
                    Some(column.field_type),
                    ctx.schema.kind(index),
                    ctx.force_utc,
                ),
                setter: column.setter(),
            });
        }

        let shape = descriptor.shape_name().to_string();
        debug!(shape = %shape, slots = slots.len(), "Compiled materializer");

        Ok(Box::new(move |row: &mut [Value]| {
            let mut item = E::default();
            for slot in &slots {
                let value = row
                    .get_mut(slot.offset)
                    .map(std::mem::take)
                    .unwrap_or_default();
                if value.is_null() {
                    continue;
                }
                let value = match &slot.converter {
                    Some(convert) => convert(value),
                    // Dynamically typed backends can report a different kind per row
                    None if value.kind() != slot.target => coerce(value, slot.target),
                    None => Ok(value),
                };
                value
                    .and_then(|value| (slot.setter)(&mut item, value))
                    .map_err(|e| {
                        DbError::mapping(
                            shape.clone(),
                            format!("error reading column '{}': {}", slot.column, e),
                        )
                    })?;
            }
            item.on_loaded();
            Ok(item)
        }))
    }

    fn select_source(registry: &ShapeRegistry) -> DbResult<Option<SelectSource>> {
        let descriptor = registry.descriptor_for::<E>()?;
        Ok(Some(SelectSource {
            table: descriptor.table_name().to_string(),
            columns: descriptor
                .query_columns()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }))
    }
}

// =============================================================================
// Schema-less Records
// =============================================================================

impl Materializable for Record {
    fn compile(ctx: &BuildContext<'_>) -> DbResult<Box<RowFn<Self>>> {
        let columns: Vec<(String, Option<Converter>)> = ctx
            .columns()
            .map(|index| {
                (
                    ctx.schema.name(index).to_string(),
                    converter_for(ctx.mapper, None, None, ctx.schema.kind(index), ctx.force_utc),
                )
            })
            .collect();

        Ok(Box::new(move |row: &mut [Value]| {
            let mut record = Record::with_capacity(columns.len());
            for (offset, (name, converter)) in columns.iter().enumerate() {
                let value = row.get_mut(offset).map(std::mem::take).unwrap_or_default();
                let value = match converter {
                    Some(convert) if !value.is_null() => convert(value)?,
                    _ => value,
                };
                record.insert(name.clone(), value);
            }
            Ok(record)
        }))
    }
}

// =============================================================================
// Scalars
// =============================================================================

fn compile_scalar<V: FieldValue + Default>(ctx: &BuildContext<'_>) -> DbResult<Box<RowFn<V>>> {
    if ctx.columns().is_empty() {
        return Err(DbError::mapping(
            short_type_name::<V>(),
            "query returned no columns",
        ));
    }
    let target = V::FIELD_TYPE;
    let converter = converter_for(
        ctx.mapper,
        None,
        Some(target),
        ctx.schema.kind(ctx.first),
        ctx.force_utc,
    );

    Ok(Box::new(move |row: &mut [Value]| {
        let value = row.first_mut().map(std::mem::take).unwrap_or_default();
        if value.is_null() {
            return Ok(V::default());
        }
        let value = match &converter {
            Some(convert) => convert(value)?,
            None => value,
        };
        let value = if value.kind() == target.kind {
            value
        } else {
            coerce(value, target.kind)?
        };
        V::from_value(value)
    }))
}

macro_rules! scalar_materializable {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Materializable for $ty {
                fn compile(ctx: &BuildContext<'_>) -> DbResult<Box<RowFn<Self>>> {
                    compile_scalar::<Self>(ctx)
                }
            }

            impl Materializable for Option<$ty> {
                fn compile(ctx: &BuildContext<'_>) -> DbResult<Box<RowFn<Self>>> {
                    compile_scalar::<Self>(ctx)
                }
            }
        )+
    };
}

scalar_materializable!(
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
    Vec<u8>,
    Uuid,
    NaiveDateTime,
    DateTime<Utc>,
    JsonValue,
);

// =============================================================================
// Cache
// =============================================================================

/// Identity of a compiled materializer.
///
/// Keyed on SQL text, not on the observed schema: a result schema that
/// changes under the same SQL keeps using the first compiled materializer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaterializerKey {
    pub shape: TypeId,
    pub sql: String,
    pub connection: String,
    pub force_utc: bool,
    pub first: usize,
    pub count: usize,
}

/// Process-lifetime cache of compiled materializers. Entries are never evicted.
pub struct MaterializerCache {
    entries: CacheMap<MaterializerKey, Arc<dyn Any + Send + Sync>>,
}

impl Default for MaterializerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MaterializerCache {
    pub fn new() -> Self {
        Self {
            entries: CacheMap::new("materializer"),
        }
    }

    /// Get the cached materializer for `key`, compiling it with `build` on a miss.
    pub fn get_or_build<T, F>(&self, key: MaterializerKey, build: F) -> DbResult<Arc<Materializer<T>>>
    where
        T: Materializable,
        F: FnOnce() -> DbResult<Box<RowFn<T>>>,
    {
        if key.shape != TypeId::of::<T>() {
            return Err(DbError::internal(format!(
                "materializer key does not belong to {}",
                short_type_name::<T>()
            )));
        }
        let (first, count) = (key.first, key.count);
        let entry = self.entries.get_or_try_insert(key, || {
            let materializer: Arc<dyn Any + Send + Sync> =
                Arc::new(Materializer::new(first, count, build()?));
            Ok(materializer)
        })?;
        entry.downcast::<Materializer<T>>().map_err(|_| {
            DbError::internal(format!(
                "cached materializer is not for {}",
                short_type_name::<T>()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
