//! Entity definitions and their field accessor tables.
//!
//! An entity declares its persisted properties once, in [`Entity::fields`],
//! as typed getter/setter pairs. The resulting [`FieldTable`] drives the row
//! mapping and the keyed `get`/`set` access.

use std::any::type_name;
use std::collections::HashSet;

use tracing::warn;

use crate::codec::{self, CodecError};
use crate::error::{Error, Result};
use crate::sqlite::Row;
use crate::value::{FieldValue, Value, ValueKind};

/// Name of the primary key column every entity table carries.
pub const ID_COLUMN: &str = "id";

/// A persisted record type.
///
/// ```ignore
/// #[derive(Debug, Clone, Default, PartialEq)]
/// struct User {
///     id: Option<String>,
///     name: String,
///     age: i64,
/// }
///
/// impl Entity for User {
///     fn table_name() -> String {
///         "users".to_string()
///     }
///
///     fn fields(fields: &mut FieldTable<Self>) {
///         fields
///             .field("name", |u| u.name.clone(), |u, v| u.name = v)
///             .field("age", |u| u.age, |u, v| u.age = v);
///     }
///
///     fn id(&self) -> Option<&str> {
///         self.id.as_deref()
///     }
///
///     fn set_id(&mut self, id: String) {
///         self.id = Some(id);
///     }
/// }
/// ```
pub trait Entity: Default + Clone + Send + Sync + 'static {
    /// Schema version the current definition expects.
    const VERSION: u32 = 1;

    /// Backing table; defaults to the snake_case type name.
    fn table_name() -> String {
        normalize_name(type_name::<Self>())
    }

    /// Declare the persisted properties.
    fn fields(fields: &mut FieldTable<Self>);

    fn id(&self) -> Option<&str>;

    fn set_id(&mut self, id: String);

    /// Text stored for `name`. Override for custom per-property formats.
    fn serialize_property(&self, name: &str, value: &Value) -> Option<String> {
        let _ = name;
        codec::encode(value)
    }

    /// Inverse of [`Entity::serialize_property`].
    fn deserialize_property(
        name: &str,
        kind: ValueKind,
        text: Option<&str>,
    ) -> std::result::Result<Value, CodecError> {
        let _ = name;
        codec::decode(kind, text)
    }
}

type Getter<E> = Box<dyn Fn(&E) -> Value + Send + Sync>;
type Setter<E> = Box<dyn Fn(&mut E, Value) -> Result<()> + Send + Sync>;
type Resetter<E> = Box<dyn Fn(&mut E) + Send + Sync>;

/// One declared property: its name, kind and accessors.
pub struct Field<E> {
    name: &'static str,
    kind: ValueKind,
    get: Getter<E>,
    set: Setter<E>,
    reset: Resetter<E>,
}

impl<E> Field<E> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }
}

/// Accessor table for one entity type, keyed by property name.
pub struct FieldTable<E> {
    entity: &'static str,
    fields: Vec<Field<E>>,
}

impl<E: Entity> FieldTable<E> {
    /// Build the table from the entity's declaration.
    pub fn build() -> Self {
        let mut table = Self {
            entity: type_name::<E>(),
            fields: Vec::new(),
        };
        E::fields(&mut table);
        table
    }

    /// Declare a property backed by a value of type `T`.
    pub fn field<T>(&mut self, name: &'static str, get: fn(&E) -> T, set: fn(&mut E, T)) -> &mut Self
    where
        T: FieldValue + 'static,
    {
        self.fields.push(Field {
            name,
            kind: T::KIND,
            get: Box::new(move |entity: &E| -> Value { get(entity).into() }),
            set: Box::new(move |entity: &mut E, value: Value| -> Result<()> {
                set(entity, T::from_value(value)?);
                Ok(())
            }),
            reset: Box::new(move |entity: &mut E| set(entity, T::default())),
        });
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field<E>> {
        self.fields.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|field| field.name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn find(&self, key: &str) -> Result<&Field<E>> {
        self.fields
            .iter()
            .find(|field| field.name == key)
            .ok_or_else(|| Error::unknown_field(self.entity, key))
    }

    /// Reject reserved or duplicate property names.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name == ID_COLUMN {
                return Err(Error::Config(format!(
                    "`{}` declares reserved field `{ID_COLUMN}`",
                    self.entity
                )));
            }
            if !seen.insert(field.name) {
                return Err(Error::Config(format!(
                    "`{}` declares field `{}` twice",
                    self.entity, field.name
                )));
            }
        }
        Ok(())
    }

    /// Read a property by name. `"id"` is addressable too.
    pub fn get(&self, entity: &E, key: &str) -> Result<Value> {
        if key == ID_COLUMN {
            return Ok(entity.id().map(str::to_string).into());
        }
        Ok((self.find(key)?.get)(entity))
    }

    /// Assign a property by name.
    pub fn set(&self, entity: &mut E, key: &str, value: Value) -> Result<()> {
        if key == ID_COLUMN {
            return self.assign_id(entity, value);
        }
        (self.find(key)?.set)(entity, value)
    }

    fn assign_id(&self, entity: &mut E, value: Value) -> Result<()> {
        let id = String::from_value(value)?;
        match entity.id() {
            Some(current) if current != id => Err(Error::ImmutableId {
                entity: self.entity.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                entity.set_id(id);
                Ok(())
            }
        }
    }

    /// Column values for a write, in declaration order (without `id`).
    pub(crate) fn to_columns(&self, entity: &E) -> Vec<(&'static str, Option<String>)> {
        self.fields
            .iter()
            .map(|field| {
                let value = (field.get)(entity);
                (field.name, entity.serialize_property(field.name, &value))
            })
            .collect()
    }

    /// Build an entity from a row. Unreadable or missing values fall back to
    /// the property type's default.
    pub(crate) fn from_row(&self, row: &Row) -> E {
        let mut entity = E::default();
        if let Some(id) = row.get(ID_COLUMN) {
            entity.set_id(id.to_string());
        }
        for field in &self.fields {
            let applied = E::deserialize_property(field.name, field.kind, row.get(field.name))
                .map_err(Error::from)
                .and_then(|value| (field.set)(&mut entity, value));
            if let Err(err) = applied {
                warn!(
                    entity = self.entity,
                    field = field.name,
                    error = %err,
                    "unreadable stored value, using default"
                );
                (field.reset)(&mut entity);
            }
        }
        entity
    }
}

/// Derive a table name from a type name: module path and generic arguments
/// are dropped, CamelCase becomes snake_case (`my_app::UserProfile` →
/// `user_profile`, `HTTPLog` → `http_log`).
pub fn normalize_name(name: &str) -> String {
    let base = name.split('<').next().unwrap_or(name);
    let base = base.rsplit("::").next().unwrap_or(base);
    let chars: Vec<char> = base.chars().collect();
    let mut out = String::with_capacity(base.len() + 4);
    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|c| c.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.extend(ch.to_lowercase());
    }
    out
}
