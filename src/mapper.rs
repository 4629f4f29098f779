//! The record mapper: entity lifecycle operations translated into SQL.
//!
//! [`Store`] holds the database handle, the migrated entity models, the
//! observer registry and the query builder. Every operation is generic over
//! the entity type; [`Record`] offers the same operations in active-record
//! style (`user.save(&store)`, `User::all(&store)`).

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;
use uuid::Uuid;

use crate::entity::{Entity, ID_COLUMN};
use crate::error::{Error, Result};
use crate::observer::{Events, ObserverContext, ObserverRegistry};
use crate::query::{find_clause, has_clause, quote_identifier, QueryBuilder};
use crate::schema::{EntityModel, MigrationStatus, RegisteredEntity, SchemaRegistry};
use crate::sqlite::{Database, TxOutcome};
use crate::value::Value;

#[derive(Clone, Copy)]
enum Join {
    Inner,
    Left,
}

/// A notification held back until the surrounding transaction commits.
struct PendingEvent {
    type_id: TypeId,
    event: Events,
    entity: Box<dyn Any + Send>,
}

type PendingQueue = Option<Vec<PendingEvent>>;

/// Maps entities to rows of one database.
pub struct Store {
    db: Arc<Database>,
    entities: HashMap<TypeId, RegisteredEntity>,
    observers: ObserverRegistry,
    builder: QueryBuilder,
    pending: Mutex<PendingQueue>,
}

impl Store {
    /// Run the startup migrations for every registered type and return the
    /// store. Types whose migration fails stay unusable; see
    /// [`Store::migration_status`].
    pub fn open(db: Arc<Database>, schema: SchemaRegistry) -> Result<Self> {
        let entities = schema.migrate(&db)?;
        Ok(Self {
            db,
            entities,
            observers: ObserverRegistry::new(),
            builder: QueryBuilder::new(),
            pending: Mutex::new(None),
        })
    }

    /// [`Store::open`] on the handle installed by [`Database::configure`].
    pub fn open_shared(schema: SchemaRegistry) -> Result<Self> {
        Self::open(Database::shared()?, schema)
    }

    /// Replace the query builder, e.g. to change the substitution marker.
    pub fn with_query_builder(mut self, builder: QueryBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// Startup migration outcome for `E`, or `None` if it is not registered.
    pub fn migration_status<E: Entity>(&self) -> Option<MigrationStatus> {
        self.entities
            .get(&TypeId::of::<E>())
            .map(|entry| entry.status.clone())
    }

    fn model<E: Entity>(&self) -> Result<&EntityModel<E>> {
        let unregistered = || Error::Unregistered(type_name::<E>().to_string());
        let entry = self
            .entities
            .get(&TypeId::of::<E>())
            .ok_or_else(unregistered)?;
        if let MigrationStatus::Failed(reason) = &entry.status {
            return Err(Error::migration(&entry.table, reason.clone()));
        }
        debug_assert_eq!(entry.type_name, type_name::<E>());
        entry
            .model
            .as_deref()
            .and_then(|model| model.downcast_ref::<EntityModel<E>>())
            .ok_or_else(unregistered)
    }

    /// Whether exactly one row has this id.
    pub fn exists<E: Entity>(&self, id: &str) -> Result<bool> {
        let model = self.model::<E>()?;
        let sql = format!(
            "SELECT count(*) AS matches FROM {} WHERE {} = ?1",
            model.quoted_table,
            quote_identifier(ID_COLUMN)?
        );
        let rows = self.db.execute_query(&sql, &[Some(id.to_string())])?;
        Ok(rows.first().and_then(|row| row.get("matches")) == Some("1"))
    }

    /// Fetch one entity by id; `Ok(None)` when there is no such row.
    pub fn with_id<E: Entity>(&self, id: &str) -> Result<Option<E>> {
        let model = self.model::<E>()?;
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1 LIMIT 1",
            model.quoted_table,
            quote_identifier(ID_COLUMN)?
        );
        let rows = self.db.execute_query(&sql, &[Some(id.to_string())])?;
        Ok(rows.first().map(|row| model.fields.from_row(row)))
    }

    /// Every entity, in insertion order.
    pub fn all<E: Entity>(&self) -> Result<Vec<E>> {
        self.select(None, None, &[], false)
    }

    /// Entities matching `predicate`, in insertion order unless the
    /// predicate carries its own top-level `ORDER BY`. A top-level `LIMIT`
    /// applies to rows in insertion order.
    pub fn all_where<E: Entity>(&self, predicate: &str, args: &[Value]) -> Result<Vec<E>> {
        self.select(None, Some(predicate), args, false)
    }

    /// `join` is the text following `INNER JOIN`, e.g.
    /// `orders ON orders.user_id = users.id WHERE orders.total > ?`.
    /// Only the primary table's columns are mapped.
    pub fn all_where_inner_join<E: Entity>(&self, join: &str, args: &[Value]) -> Result<Vec<E>> {
        self.select(Some(Join::Inner), Some(join), args, false)
    }

    /// Like [`Store::all_where_inner_join`] with a `LEFT JOIN`.
    pub fn all_where_left_join<E: Entity>(&self, join: &str, args: &[Value]) -> Result<Vec<E>> {
        self.select(Some(Join::Left), Some(join), args, false)
    }

    pub fn first_where<E: Entity>(&self, predicate: &str, args: &[Value]) -> Result<Option<E>> {
        Ok(self
            .select(None, Some(predicate), args, true)?
            .into_iter()
            .next())
    }

    pub fn first_where_inner_join<E: Entity>(
        &self,
        join: &str,
        args: &[Value],
    ) -> Result<Option<E>> {
        Ok(self
            .select(Some(Join::Inner), Some(join), args, true)?
            .into_iter()
            .next())
    }

    /// Delete every row matching `predicate`.
    ///
    /// Success means the statement executed; deleting nothing is not an
    /// error. Observers are not notified.
    pub fn delete_all_where<E: Entity>(&self, predicate: &str, args: &[Value]) -> Result<()> {
        let model = self.model::<E>()?;
        let fragment = self.builder.render(predicate, args)?;
        let sql = format!("DELETE FROM {} WHERE {fragment}", model.quoted_table);
        self.db.execute_update(&sql, &[])
    }

    /// Insert a new entity (assigning a fresh id) or update an existing one.
    pub fn save<E: Entity>(&self, entity: &mut E) -> Result<()> {
        let model = self.model::<E>()?;
        let columns = model.fields.to_columns(entity);
        let event = match entity.id() {
            None => {
                let id = Uuid::new_v4().to_string();
                self.insert(model, &id, &columns)?;
                entity.set_id(id);
                Events::INSERTION
            }
            Some(id) => {
                let id = id.to_string();
                if self.update(model, &id, &columns)? > 0 {
                    Events::MODIFICATION
                } else {
                    self.insert(model, &id, &columns)?;
                    Events::INSERTION
                }
            }
        };
        debug!(table = %model.table, id = ?entity.id(), ?event, "saved entity");
        self.notify(entity, event);
        Ok(())
    }

    /// Delete the entity's row. Succeeds (and notifies) even when no row
    /// matched; an entity that was never saved is left alone.
    pub fn delete<E: Entity>(&self, entity: &E) -> Result<()> {
        let model = self.model::<E>()?;
        let Some(id) = entity.id() else {
            debug!(table = %model.table, "delete of unsaved entity ignored");
            return Ok(());
        };
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            model.quoted_table,
            quote_identifier(ID_COLUMN)?
        );
        self.db.execute_update(&sql, &[Some(id.to_string())])?;
        debug!(table = %model.table, id, "deleted entity");
        self.notify(entity, Events::DELETION);
        Ok(())
    }

    /// Read a declared property (or `"id"`) by name.
    pub fn get<E: Entity>(&self, entity: &E, key: &str) -> Result<Value> {
        self.model::<E>()?.fields.get(entity, key)
    }

    /// Assign a declared property (or an unset `"id"`) by name.
    pub fn set<E: Entity>(&self, entity: &mut E, key: &str, value: impl Into<Value>) -> Result<()> {
        self.model::<E>()?.fields.set(entity, key, value.into())
    }

    pub fn add_observer<E, F>(&self, events: Events, context: &ObserverContext, callback: F)
    where
        E: Entity,
        F: Fn(&E, Events) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.observers.add_observer(events, context, callback);
    }

    pub fn remove_observer(&self, context: ObserverContext) -> usize {
        self.observers.remove_observer(context)
    }

    /// Run `body` in a transaction. Notifications raised inside it are
    /// delivered after a commit and discarded on rollback.
    pub fn in_transaction<F>(&self, body: F) -> Result<TxOutcome>
    where
        F: FnOnce(&Store) -> Result<TxOutcome>,
    {
        {
            let mut pending = self.pending();
            if pending.is_some() {
                return Err(Error::NestedTransaction);
            }
            *pending = Some(Vec::new());
        }
        let _reset = PendingReset(&self.pending);
        let result = self.db.in_transaction(|_| body(self));
        let queued = self.pending().take().unwrap_or_default();
        match result {
            Ok(TxOutcome::Commit) => {
                for pending in queued {
                    self.observers
                        .notify_any(pending.type_id, pending.entity.as_ref(), pending.event);
                }
            }
            _ if !queued.is_empty() => {
                debug!(discarded = queued.len(), "dropping notifications of rolled back transaction");
            }
            _ => {}
        }
        result
    }

    /// Directory for files belonging to `E`, created on demand.
    pub fn content_path<E: Entity>(&self) -> Result<PathBuf> {
        let model = self.model::<E>()?;
        let path = self.db.config().content_root().join(&model.table);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    fn select<E: Entity>(
        &self,
        join: Option<Join>,
        predicate: Option<&str>,
        args: &[Value],
        first: bool,
    ) -> Result<Vec<E>> {
        let model = self.model::<E>()?;
        let table = &model.quoted_table;
        let fragment = match predicate {
            Some(predicate) => self.builder.render(predicate, args)?,
            None => self.builder.render("", args)?,
        };
        let mut sql = format!("SELECT {table}.* FROM {table}");
        match join {
            Some(Join::Inner) => sql.push_str(" INNER JOIN "),
            Some(Join::Left) => sql.push_str(" LEFT JOIN "),
            None if !fragment.trim().is_empty() => sql.push_str(" WHERE "),
            None => {}
        }
        let limit = find_clause(&fragment, &["LIMIT"]);
        let storage_order = format!("ORDER BY {table}.rowid");
        match limit {
            _ if has_clause(&fragment, &["ORDER", "BY"]) => sql.push_str(&fragment),
            Some(at) => {
                let (filter, limit_clause) = fragment.split_at(at);
                sql.push_str(filter.trim_end());
                sql.push_str(&format!(" {storage_order} {limit_clause}"));
            }
            None => {
                sql.push_str(&fragment);
                sql.push_str(&format!(" {storage_order}"));
            }
        }
        if first && limit.is_none() {
            sql.push_str(" LIMIT 1");
        }
        let rows = self.db.execute_query(&sql, &[])?;
        Ok(rows.iter().map(|row| model.fields.from_row(row)).collect())
    }

    fn insert<E: Entity>(
        &self,
        model: &EntityModel<E>,
        id: &str,
        columns: &[(&'static str, Option<String>)],
    ) -> Result<()> {
        let mut names = vec![quote_identifier(ID_COLUMN)?];
        for (name, _) in columns {
            names.push(quote_identifier(name)?);
        }
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            model.quoted_table,
            names.join(", "),
            placeholders.join(", ")
        );
        let mut args = vec![Some(id.to_string())];
        args.extend(columns.iter().map(|(_, value)| value.clone()));
        self.db.execute_update(&sql, &args)
    }

    /// Returns the number of rows updated (0 or 1).
    fn update<E: Entity>(
        &self,
        model: &EntityModel<E>,
        id: &str,
        columns: &[(&'static str, Option<String>)],
    ) -> Result<usize> {
        let id_column = quote_identifier(ID_COLUMN)?;
        let assignments = if columns.is_empty() {
            format!("{id_column} = {id_column}")
        } else {
            columns
                .iter()
                .enumerate()
                .map(|(i, (name, _))| {
                    quote_identifier(name).map(|column| format!("{column} = ?{}", i + 2))
                })
                .collect::<Result<Vec<_>>>()?
                .join(", ")
        };
        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {id_column} = ?1",
            model.quoted_table
        );
        let mut args = vec![Some(id.to_string())];
        args.extend(columns.iter().map(|(_, value)| value.clone()));
        self.db.execute_changes(&sql, &args)
    }

    fn notify<E: Entity>(&self, entity: &E, event: Events) {
        {
            let mut pending = self.pending();
            if let Some(queue) = pending.as_mut() {
                queue.push(PendingEvent {
                    type_id: TypeId::of::<E>(),
                    event,
                    entity: Box::new(entity.clone()),
                });
                return;
            }
        }
        self.observers.notify(entity, event);
    }

    fn pending(&self) -> MutexGuard<'_, PendingQueue> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the notification buffer when a transaction body unwinds.
struct PendingReset<'a>(&'a Mutex<PendingQueue>);

impl Drop for PendingReset<'_> {
    fn drop(&mut self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Active-record style access to [`Store`] operations.
pub trait Record: Entity {
    fn save(&mut self, store: &Store) -> Result<()> {
        store.save(self)
    }

    fn delete(&self, store: &Store) -> Result<()> {
        store.delete(self)
    }

    fn exists(store: &Store, id: &str) -> Result<bool> {
        store.exists::<Self>(id)
    }

    fn with_id(store: &Store, id: &str) -> Result<Option<Self>> {
        store.with_id(id)
    }

    fn all(store: &Store) -> Result<Vec<Self>> {
        store.all()
    }

    fn all_where(store: &Store, predicate: &str, args: &[Value]) -> Result<Vec<Self>> {
        store.all_where(predicate, args)
    }

    fn all_where_inner_join(store: &Store, join: &str, args: &[Value]) -> Result<Vec<Self>> {
        store.all_where_inner_join(join, args)
    }

    fn all_where_left_join(store: &Store, join: &str, args: &[Value]) -> Result<Vec<Self>> {
        store.all_where_left_join(join, args)
    }

    fn first_where(store: &Store, predicate: &str, args: &[Value]) -> Result<Option<Self>> {
        store.first_where(predicate, args)
    }

    fn first_where_inner_join(store: &Store, join: &str, args: &[Value]) -> Result<Option<Self>> {
        store.first_where_inner_join(join, args)
    }

    fn delete_all_where(store: &Store, predicate: &str, args: &[Value]) -> Result<()> {
        store.delete_all_where::<Self>(predicate, args)
    }

    fn get(&self, store: &Store, key: &str) -> Result<Value> {
        store.get(self, key)
    }

    fn set(&mut self, store: &Store, key: &str, value: impl Into<Value>) -> Result<()> {
        store.set(self, key, value)
    }

    fn content_path(store: &Store) -> Result<PathBuf> {
        store.content_path::<Self>()
    }
}

impl<E: Entity> Record for E {}
