//! Schema registry and migrations.
//!
//! Each entity type is registered once, with either the default migration or
//! a custom hook. When a [`crate::Store`] opens, every registered type whose
//! stored version differs from [`Entity::VERSION`] is migrated inside its own
//! transaction. A failed migration makes that type unusable; other types are
//! unaffected.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::entity::{Entity, FieldTable, ID_COLUMN};
use crate::error::{Error, Result};
use crate::query::quote_identifier;
use crate::sqlite::{Database, TxOutcome};
use crate::value::ValueKind;

/// Metadata table holding one schema version per entity table.
pub const VERSION_TABLE: &str = "_schema_versions";

/// Migration hook: receives the database and the stored version (`0` when the
/// type has never been created).
pub type MigrationFn = Box<dyn Fn(&Database, u32) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Text,
    Real,
    Blob,
}

impl DataType {
    /// Column affinity used to store a property of `kind`.
    pub fn for_kind(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Integer | ValueKind::Boolean => DataType::Integer,
            ValueKind::Real => DataType::Real,
            ValueKind::Blob => DataType::Blob,
            ValueKind::Null | ValueKind::Text | ValueKind::Timestamp | ValueKind::Json => {
                DataType::Text
            }
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Text => "TEXT",
            DataType::Real => "REAL",
            DataType::Blob => "BLOB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnConstraint {
    PrimaryKey,
    NotNull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: DataType,
    pub constraints: Vec<ColumnConstraint>,
}

impl ColumnDefinition {
    pub fn to_sql(&self) -> Result<String> {
        let mut sql = format!("{} {}", quote_identifier(&self.name)?, self.data_type.as_sql());
        for constraint in &self.constraints {
            sql.push_str(match constraint {
                ColumnConstraint::PrimaryKey => " PRIMARY KEY",
                ColumnConstraint::NotNull => " NOT NULL",
            });
        }
        Ok(sql)
    }
}

/// Table layout derived from an entity definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    /// `id` primary key followed by one column per declared field.
    pub fn for_entity<E: Entity>() -> Self {
        let fields = FieldTable::<E>::build();
        let mut columns = vec![ColumnDefinition {
            name: ID_COLUMN.to_string(),
            data_type: DataType::Text,
            constraints: vec![ColumnConstraint::PrimaryKey, ColumnConstraint::NotNull],
        }];
        columns.extend(fields.iter().map(|field| ColumnDefinition {
            name: field.name().to_string(),
            data_type: DataType::for_kind(field.kind()),
            constraints: Vec::new(),
        }));
        Self {
            name: E::table_name(),
            columns,
        }
    }

    pub fn create_sql(&self) -> Result<String> {
        let columns = self
            .columns
            .iter()
            .map(ColumnDefinition::to_sql)
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&self.name)?,
            columns.join(", ")
        ))
    }
}

/// Create the entity's table if it does not exist yet.
pub fn create_table<E: Entity>(db: &Database) -> Result<()> {
    let table = TableDefinition::for_entity::<E>();
    db.execute_update(&table.create_sql()?, &[])
}

/// Add declared columns that the stored table lacks.
pub fn add_missing_columns<E: Entity>(db: &Database) -> Result<()> {
    let table = TableDefinition::for_entity::<E>();
    let quoted = quote_identifier(&table.name)?;
    let existing: Vec<String> = db
        .execute_query(&format!("PRAGMA table_info({quoted})"), &[])?
        .iter()
        .filter_map(|row| row.get("name").map(str::to_string))
        .collect();
    for column in &table.columns {
        if existing.iter().any(|name| name == &column.name) {
            continue;
        }
        info!(table = %table.name, column = %column.name, "adding column");
        db.execute_update(
            &format!("ALTER TABLE {quoted} ADD COLUMN {}", column.to_sql()?),
            &[],
        )?;
    }
    Ok(())
}

/// Migration used by [`SchemaRegistry::register`]: create the table on first
/// use, add new columns on upgrade, refuse downgrades.
pub fn default_migration<E: Entity>(db: &Database, stored_version: u32) -> anyhow::Result<()> {
    if stored_version > E::VERSION {
        anyhow::bail!(
            "stored schema version {stored_version} is newer than declared version {}",
            E::VERSION
        );
    }
    if stored_version == 0 {
        create_table::<E>(db)?;
    }
    add_missing_columns::<E>(db)?;
    Ok(())
}

/// Resolved table name and accessor table for one entity type.
pub struct EntityModel<E> {
    pub(crate) table: String,
    pub(crate) quoted_table: String,
    pub(crate) fields: FieldTable<E>,
}

impl<E: Entity> EntityModel<E> {
    fn build() -> Result<Self> {
        if E::VERSION == 0 {
            return Err(Error::Config(format!(
                "`{}` declares schema version 0; versions start at 1",
                type_name::<E>()
            )));
        }
        let table = E::table_name();
        let quoted_table = quote_identifier(&table)?;
        let fields = FieldTable::<E>::build();
        fields.validate()?;
        for name in fields.names() {
            quote_identifier(name)?;
        }
        Ok(Self {
            table,
            quoted_table,
            fields,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &FieldTable<E> {
        &self.fields
    }
}

/// Outcome of an entity type's startup migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    Ready,
    Failed(String),
}

struct Registration {
    type_id: TypeId,
    type_name: &'static str,
    table: String,
    version: u32,
    model: Result<Arc<dyn Any + Send + Sync>>,
    migrate: MigrationFn,
}

/// A registered type after startup migration.
pub(crate) struct RegisteredEntity {
    pub(crate) type_name: &'static str,
    pub(crate) table: String,
    pub(crate) model: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) status: MigrationStatus,
}

/// Entity types known to a store, with their migration hooks.
#[derive(Default)]
pub struct SchemaRegistry {
    entries: Vec<Registration>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` with [`default_migration`].
    pub fn register<E: Entity>(&mut self) -> &mut Self {
        self.register_with::<E, _>(default_migration::<E>)
    }

    /// Register `E` with a custom migration hook. Registering a type again
    /// replaces its earlier registration.
    pub fn register_with<E, F>(&mut self, migrate: F) -> &mut Self
    where
        E: Entity,
        F: Fn(&Database, u32) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let registration = Registration {
            type_id: TypeId::of::<E>(),
            type_name: type_name::<E>(),
            table: E::table_name(),
            version: E::VERSION,
            model: EntityModel::<E>::build()
                .map(|model| Arc::new(model) as Arc<dyn Any + Send + Sync>),
            migrate: Box::new(migrate),
        };
        self.entries
            .retain(|entry| entry.type_id != registration.type_id);
        self.entries.push(registration);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bring every registered type up to its declared version.
    ///
    /// Only a failure to prepare the metadata table is an error; individual
    /// migration failures are reported through [`MigrationStatus`].
    pub(crate) fn migrate(self, db: &Database) -> Result<HashMap<TypeId, RegisteredEntity>> {
        ensure_version_table(db)?;
        let mut entities = HashMap::with_capacity(self.entries.len());
        for entry in self.entries {
            let status = match &entry.model {
                Ok(_) => run_migration(db, &entry),
                Err(err) => {
                    error!(table = %entry.table, error = %err, "invalid entity definition");
                    MigrationStatus::Failed(err.to_string())
                }
            };
            entities.insert(
                entry.type_id,
                RegisteredEntity {
                    type_name: entry.type_name,
                    table: entry.table,
                    model: entry.model.ok(),
                    status,
                },
            );
        }
        Ok(entities)
    }
}

fn run_migration(db: &Database, entry: &Registration) -> MigrationStatus {
    let stored = match stored_version(db, &entry.table) {
        Ok(version) => version,
        Err(err) => {
            error!(table = %entry.table, error = %err, "cannot read schema version");
            return MigrationStatus::Failed(err.to_string());
        }
    };
    if stored == entry.version {
        return MigrationStatus::Ready;
    }
    info!(table = %entry.table, from = stored, to = entry.version, "migrating entity table");
    let result = db.in_transaction(|db| {
        (entry.migrate)(db, stored)
            .map_err(|err| Error::migration(&entry.table, format!("{err:#}")))?;
        store_version(db, &entry.table, entry.version)?;
        Ok(TxOutcome::Commit)
    });
    match result {
        Ok(_) => MigrationStatus::Ready,
        Err(err) => {
            error!(table = %entry.table, error = %err, "migration failed");
            MigrationStatus::Failed(err.to_string())
        }
    }
}

fn ensure_version_table(db: &Database) -> Result<()> {
    db.execute_update(
        &format!(
            "CREATE TABLE IF NOT EXISTS {} (entity TEXT PRIMARY KEY NOT NULL, version INTEGER NOT NULL)",
            quote_identifier(VERSION_TABLE)?
        ),
        &[],
    )
}

/// Stored schema version for `table`; `0` when none is recorded.
pub fn stored_version(db: &Database, table: &str) -> Result<u32> {
    let rows = db.execute_query(
        &format!(
            "SELECT version FROM {} WHERE entity = ?1",
            quote_identifier(VERSION_TABLE)?
        ),
        &[Some(table.to_string())],
    )?;
    let Some(text) = rows.first().and_then(|row| row.get("version")) else {
        return Ok(0);
    };
    text.parse().map_err(|_| {
        Error::migration(table, format!("stored schema version is not a number: {text:?}"))
    })
}

fn store_version(db: &Database, table: &str, version: u32) -> Result<()> {
    db.execute_update(
        &format!(
            "INSERT INTO {} (entity, version) VALUES (?1, ?2) \
             ON CONFLICT(entity) DO UPDATE SET version = excluded.version",
            quote_identifier(VERSION_TABLE)?
        ),
        &[Some(table.to_string()), Some(version.to_string())],
    )
}
