//! Shape registry.
//!
//! A shape is a type rows are materialized into. Entities declare their
//! members once through [`ShapeBuilder`]; the registry turns that declaration
//! into an immutable [`ShapeDescriptor`] and caches it for the lifetime of the
//! owning [`MappingContext`](crate::mapping::MappingContext).

use crate::error::{DbError, DbResult};
use crate::mapping::mapper::{ColumnMapping, Mapper, TableInfo};
use crate::mapping::record::Record;
use crate::models::{Arg, ArgObject, FieldType, FieldValue, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

type Getter<T> = Arc<dyn Fn(&T) -> Value + Send + Sync>;
type Setter<T> = Arc<dyn Fn(&mut T, Value) -> DbResult<()> + Send + Sync>;
type Assign<T> = Arc<dyn Fn(&mut T, &(dyn Any + Send)) -> bool + Send + Sync>;

/// A type that rows can be materialized into.
///
/// ```
/// use rowshape::mapping::{Entity, ShapeBuilder};
///
/// #[derive(Debug, Clone, Default)]
/// struct Person {
///     id: i64,
///     name: String,
/// }
///
/// impl Entity for Person {
///     fn describe(shape: &mut ShapeBuilder<Self>) {
///         shape.table("people").primary_key("id").auto_increment(true);
///         shape.member("id", |p| &p.id, |p| &mut p.id);
///         shape.member("name", |p| &p.name, |p| &mut p.name).column("full_name");
///     }
/// }
/// ```
pub trait Entity: Default + Clone + Send + Sync + 'static {
    fn describe(shape: &mut ShapeBuilder<Self>);

    /// Called after every column of a row has been assigned.
    fn on_loaded(&mut self) {}
}

/// Last path segment of a type name, without generic arguments.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// =============================================================================
// Builder
// =============================================================================

/// One declared member, before column discovery is applied.
pub struct MemberDef<T> {
    name: &'static str,
    column: Option<String>,
    annotated: bool,
    result_column: bool,
    ignored: bool,
    field_type: FieldType,
    get: Getter<T>,
    set: Setter<T>,
}

impl<T> MemberDef<T> {
    /// Map the member to a differently named column.
    pub fn column(&mut self, name: impl Into<String>) -> &mut Self {
        self.column = Some(name.into());
        self.annotated = true;
        self
    }

    /// Mark the member as explicitly mapped without renaming it.
    pub fn annotated(&mut self) -> &mut Self {
        self.annotated = true;
        self
    }

    /// Read during materialization but never written back.
    pub fn result_column(&mut self) -> &mut Self {
        self.result_column = true;
        self.annotated = true;
        self
    }

    pub fn ignore(&mut self) -> &mut Self {
        self.ignored = true;
        self
    }
}

/// Declarative description of an entity, filled in by [`Entity::describe`].
pub struct ShapeBuilder<T> {
    table: TableInfo,
    explicit_columns: bool,
    members: Vec<MemberDef<T>>,
    relations: Vec<RelationDescriptor<T>>,
}

impl<T: 'static> ShapeBuilder<T> {
    fn new(shape_name: &str) -> Self {
        Self {
            table: TableInfo::new(shape_name),
            explicit_columns: false,
            members: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn table(&mut self, name: impl Into<String>) -> &mut Self {
        self.table.table_name = name.into();
        self
    }

    pub fn primary_key(&mut self, column: impl Into<String>) -> &mut Self {
        self.table.primary_key = column.into();
        self
    }

    pub fn auto_increment(&mut self, auto_increment: bool) -> &mut Self {
        self.table.auto_increment = auto_increment;
        self
    }

    pub fn sequence(&mut self, name: impl Into<String>) -> &mut Self {
        self.table.sequence_name = Some(name.into());
        self
    }

    /// Only members marked with [`MemberDef::column`], [`MemberDef::annotated`]
    /// or [`MemberDef::result_column`] are mapped.
    pub fn explicit_columns(&mut self) -> &mut Self {
        self.explicit_columns = true;
        self
    }

    /// Declare a member together with its accessors.
    pub fn member<V: FieldValue>(
        &mut self,
        name: &'static str,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> &mut MemberDef<T> {
        self.members.push(MemberDef {
            name,
            column: None,
            annotated: false,
            result_column: false,
            ignored: false,
            field_type: V::FIELD_TYPE,
            get: Arc::new(move |item: &T| get(item).to_value()),
            set: Arc::new(move |item: &mut T, value: Value| {
                *get_mut(item) = V::from_value(value)?;
                Ok(())
            }),
        });
        let last = self.members.len() - 1;
        &mut self.members[last]
    }

    /// Declare a member that holds another entity, for automatic joins.
    pub fn relation<R: Entity>(&mut self, name: &'static str, assign: fn(&mut T, R)) -> &mut Self {
        self.relations.push(RelationDescriptor {
            name,
            target: TypeId::of::<R>(),
            target_name: short_type_name::<R>(),
            assign: Arc::new(move |item: &mut T, value: &(dyn Any + Send)| {
                match value.downcast_ref::<R>() {
                    Some(related) => {
                        assign(item, related.clone());
                        true
                    }
                    None => false,
                }
            }),
        });
        self
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// A mapped column of a shape.
pub struct ColumnDescriptor<T> {
    pub column_name: String,
    pub member_name: String,
    pub result_column: bool,
    pub field_type: FieldType,
    get: Getter<T>,
    set: Setter<T>,
}

impl<T> ColumnDescriptor<T> {
    pub fn get(&self, item: &T) -> Value {
        (self.get)(item)
    }

    pub fn set(&self, item: &mut T, value: Value) -> DbResult<()> {
        (self.set)(item, value)
    }

    pub(crate) fn setter(&self) -> Setter<T> {
        self.set.clone()
    }
}

impl<T> std::fmt::Debug for ColumnDescriptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnDescriptor")
            .field("column_name", &self.column_name)
            .field("member_name", &self.member_name)
            .field("result_column", &self.result_column)
            .field("field_type", &self.field_type)
            .finish()
    }
}

/// A member holding another entity.
pub struct RelationDescriptor<T> {
    pub name: &'static str,
    pub target: TypeId,
    pub target_name: &'static str,
    assign: Assign<T>,
}

/// Immutable mapping metadata for one shape.
pub struct ShapeDescriptor<T> {
    shape_name: String,
    table: TableInfo,
    columns: Vec<ColumnDescriptor<T>>,
    index: HashMap<String, usize>,
    relations: Vec<RelationDescriptor<T>>,
}

impl<T> ShapeDescriptor<T> {
    fn assemble(
        shape_name: String,
        table: TableInfo,
        columns: Vec<ColumnDescriptor<T>>,
        relations: Vec<RelationDescriptor<T>>,
    ) -> DbResult<Self> {
        let mut index = HashMap::with_capacity(columns.len());
        for (pos, column) in columns.iter().enumerate() {
            if index
                .insert(column.column_name.to_lowercase(), pos)
                .is_some()
            {
                return Err(DbError::mapping(
                    shape_name,
                    format!("column '{}' is mapped more than once", column.column_name),
                ));
            }
        }
        Ok(Self {
            shape_name,
            table,
            columns,
            index,
            relations,
        })
    }

    pub fn shape_name(&self) -> &str {
        &self.shape_name
    }

    pub fn table_info(&self) -> &TableInfo {
        &self.table
    }

    pub fn table_name(&self) -> &str {
        &self.table.table_name
    }

    pub fn primary_key(&self) -> &str {
        &self.table.primary_key
    }

    pub fn auto_increment(&self) -> bool {
        self.table.auto_increment
    }

    pub fn sequence_name(&self) -> Option<&str> {
        self.table.sequence_name.as_deref()
    }

    pub fn columns(&self) -> &[ColumnDescriptor<T>] {
        &self.columns
    }

    /// Find a column by name, ignoring case.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor<T>> {
        self.index
            .get(&name.to_lowercase())
            .map(|&pos| &self.columns[pos])
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_lowercase())
    }

    /// Columns used when synthesizing a SELECT list, in declaration order.
    /// Result columns are left out.
    pub fn query_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !c.result_column)
            .map(|c| c.column_name.as_str())
            .collect()
    }

    /// Columns that can be written back (everything but result columns).
    pub fn writable_columns(&self) -> impl Iterator<Item = &ColumnDescriptor<T>> {
        self.columns.iter().filter(|c| !c.result_column)
    }

    /// The column named by the primary key.
    pub fn primary_key_column(&self) -> DbResult<&ColumnDescriptor<T>> {
        self.column(&self.table.primary_key).ok_or_else(|| {
            DbError::mapping(
                self.shape_name.clone(),
                format!(
                    "primary key column '{}' is not mapped",
                    self.table.primary_key
                ),
            )
        })
    }

    pub fn relations(&self) -> &[RelationDescriptor<T>] {
        &self.relations
    }
}

impl<T> std::fmt::Debug for ShapeDescriptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapeDescriptor")
            .field("shape_name", &self.shape_name)
            .field("table", &self.table)
            .field("columns", &self.columns)
            .finish()
    }
}

fn build_descriptor<T: Entity>(mapper: &dyn Mapper) -> DbResult<ShapeDescriptor<T>> {
    let shape_name = short_type_name::<T>();
    let mut builder = ShapeBuilder::<T>::new(shape_name);
    T::describe(&mut builder);

    let ShapeBuilder {
        mut table,
        explicit_columns,
        members,
        relations,
    } = builder;
    mapper.table_info(shape_name, &mut table);

    let mut columns = Vec::with_capacity(members.len());
    for member in members {
        if explicit_columns {
            if !member.annotated {
                continue;
            }
        } else if member.ignored {
            continue;
        }

        let mut mapping = ColumnMapping {
            column_name: member.column.unwrap_or_else(|| member.name.to_string()),
            result_column: member.result_column,
        };
        if !mapper.map_member(shape_name, member.name, &mut mapping) {
            continue;
        }

        columns.push(ColumnDescriptor {
            column_name: mapping.column_name,
            member_name: member.name.to_string(),
            result_column: mapping.result_column,
            field_type: member.field_type,
            get: member.get,
            set: member.set,
        });
    }

    ShapeDescriptor::assemble(shape_name.to_string(), table, columns, relations)
}

// =============================================================================
// Type-erased Shapes
// =============================================================================

/// What the multi-shape engine needs to know about a shape without its type.
pub trait ErasedShape: Send + Sync {
    fn shape_name(&self) -> &str;

    fn shape_type(&self) -> TypeId;

    fn has_column(&self, name: &str) -> bool;

    /// Number of relations pointing at `target`.
    fn relation_count(&self, target: TypeId) -> usize;

    /// Assign `value` into the relation of `owner` that accepts its type.
    fn assign_relation(
        &self,
        owner: &mut (dyn Any + Send),
        value: &(dyn Any + Send),
    ) -> DbResult<()>;
}

pub type ShapeHandle = Arc<dyn ErasedShape>;

impl<T: Entity> ErasedShape for ShapeDescriptor<T> {
    fn shape_name(&self) -> &str {
        &self.shape_name
    }

    fn shape_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn has_column(&self, name: &str) -> bool {
        ShapeDescriptor::has_column(self, name)
    }

    fn relation_count(&self, target: TypeId) -> usize {
        self.relations.iter().filter(|r| r.target == target).count()
    }

    fn assign_relation(
        &self,
        owner: &mut (dyn Any + Send),
        value: &(dyn Any + Send),
    ) -> DbResult<()> {
        let owner = owner.downcast_mut::<T>().ok_or_else(|| {
            DbError::internal(format!("join owner is not a {}", self.shape_name))
        })?;
        let target = (*value).type_id();
        let relation = self
            .relations
            .iter()
            .find(|r| r.target == target)
            .ok_or_else(|| DbError::unresolved_join(self.shape_name.clone()))?;
        if (relation.assign)(owner, value) {
            Ok(())
        } else {
            Err(DbError::internal(format!(
                "relation '{}' rejected a {}",
                relation.name, relation.target_name
            )))
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Per-context cache of shape descriptors.
pub struct ShapeRegistry {
    mapper: Arc<dyn Mapper>,
    shapes: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ShapeRegistry {
    pub fn new(mapper: Arc<dyn Mapper>) -> Self {
        Self {
            mapper,
            shapes: RwLock::new(HashMap::new()),
        }
    }

    pub fn mapper(&self) -> &dyn Mapper {
        self.mapper.as_ref()
    }

    /// Get the descriptor for `T`, building it on first use.
    pub fn descriptor_for<T: Entity>(&self) -> DbResult<Arc<ShapeDescriptor<T>>> {
        let id = TypeId::of::<T>();
        {
            let shapes = self
                .shapes
                .read()
                .map_err(|_| DbError::internal("shape registry lock poisoned"))?;
            if let Some(found) = shapes.get(&id) {
                return downcast_descriptor(found.clone());
            }
        }

        let mut shapes = self
            .shapes
            .write()
            .map_err(|_| DbError::internal("shape registry lock poisoned"))?;
        // Another caller may have built it between the two locks
        if let Some(found) = shapes.get(&id) {
            return downcast_descriptor(found.clone());
        }
        let descriptor = Arc::new(build_descriptor::<T>(self.mapper.as_ref())?);
        debug!(
            shape = %descriptor.shape_name(),
            table = %descriptor.table_name(),
            columns = descriptor.columns().len(),
            "Shape registered"
        );
        shapes.insert(id, descriptor.clone());
        Ok(descriptor)
    }

    pub fn handle_for<T: Entity>(&self) -> DbResult<ShapeHandle> {
        let descriptor: ShapeHandle = self.descriptor_for::<T>()?;
        Ok(descriptor)
    }

    /// Synthesize a descriptor for a schema-less record. Not cached; the
    /// primary key is always treated as auto-increment.
    pub fn descriptor_for_record(
        &self,
        record: &Record,
        primary_key: &str,
    ) -> DbResult<ShapeDescriptor<Record>> {
        let table = TableInfo {
            table_name: String::new(),
            primary_key: primary_key.to_string(),
            auto_increment: true,
            sequence_name: None,
        };
        let columns = record
            .iter()
            .map(|(name, value)| {
                let read_name = name.to_string();
                let write_name = name.to_string();
                ColumnDescriptor {
                    column_name: name.to_string(),
                    member_name: name.to_string(),
                    result_column: false,
                    field_type: FieldType::new(value.kind(), value.kind().name()),
                    get: Arc::new(move |r: &Record| r.get(&read_name).cloned().unwrap_or_default())
                        as Getter<Record>,
                    set: Arc::new(move |r: &mut Record, v: Value| {
                        r.insert(write_name.clone(), v);
                        Ok(())
                    }) as Setter<Record>,
                }
            })
            .collect();
        ShapeDescriptor::assemble("Record".to_string(), table, columns, Vec::new())
    }

    /// Wrap an entity so its members can resolve named placeholders.
    pub fn args<T: Entity>(&self, value: T) -> DbResult<Arg> {
        let descriptor = self.descriptor_for::<T>()?;
        Ok(Arg::object(EntityArgs { descriptor, value }))
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.shapes.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn downcast_descriptor<T: Entity>(
    found: Arc<dyn Any + Send + Sync>,
) -> DbResult<Arc<ShapeDescriptor<T>>> {
    found.downcast::<ShapeDescriptor<T>>().map_err(|_| {
        DbError::internal(format!(
            "cached descriptor for {} has the wrong type",
            short_type_name::<T>()
        ))
    })
}

/// An entity value exposed to the binder by member name.
struct EntityArgs<T> {
    descriptor: Arc<ShapeDescriptor<T>>,
    value: T,
}

impl<T: Entity> ArgObject for EntityArgs<T> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.descriptor
            .columns()
            .iter()
            .find(|c| c.member_name == name)
            .map(|c| c.get(&self.value))
    }
}

impl<T> std::fmt::Debug for EntityArgs<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityArgs")
            .field("shape", &self.descriptor.shape_name())
            .finish()
    }
}
