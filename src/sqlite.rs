//! The SQLite database handle: one connection, raw statement execution and
//! scoped transactions.
//!
//! Every value crosses this boundary as text. Arguments are bound as
//! `Option<String>` and result columns come back as `Option<String>`, with
//! `None` standing for `NULL`.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use rusqlite::{params_from_iter, types::ValueRef, Connection};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Process-wide handle installed by [`Database::configure`].
static SHARED: OnceLock<Arc<Database>> = OnceLock::new();

/// Path SQLite recognises as a private in-memory database.
const IN_MEMORY_PATH: &str = ":memory:";

/// One result row: column names in select order, each with its text value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<(String, Option<String>)>,
}

impl Row {
    pub fn new(columns: Vec<(String, Option<String>)>) -> Self {
        Self { columns }
    }

    /// Text of the named column; `None` when the column is missing or NULL.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .and_then(|(_, value)| value.as_deref())
    }

    /// Every column in select order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }
}

/// How a transaction body wants its transaction to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Commit,
    Rollback,
}

/// SQLite database handle
pub struct Database {
    config: DatabaseConfig,
    connection: Mutex<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (creating if needed) the database file described by `config`.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let connection = Connection::open(&config.path)?;
        apply_pragmas(&connection, &config)?;
        info!(path = %config.path.display(), "opened sqlite database");
        Ok(Self {
            config,
            connection: Mutex::new(connection),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let config = DatabaseConfig::new(IN_MEMORY_PATH);
        let connection = Connection::open_in_memory()?;
        apply_pragmas(&connection, &config)?;
        Ok(Self {
            config,
            connection: Mutex::new(connection),
        })
    }

    /// Open the database and install it as the process-wide handle.
    ///
    /// Can succeed only once per process.
    pub fn configure(config: DatabaseConfig) -> Result<Arc<Database>> {
        if SHARED.get().is_some() {
            return Err(Error::AlreadyConfigured);
        }
        let database = Arc::new(Database::open(config)?);
        SHARED
            .set(Arc::clone(&database))
            .map_err(|_| Error::AlreadyConfigured)?;
        Ok(database)
    }

    /// The handle installed by [`Database::configure`].
    pub fn shared() -> Result<Arc<Database>> {
        SHARED.get().cloned().ok_or(Error::NotConfigured)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Execute a statement that returns no rows.
    ///
    /// Success means the statement ran; it says nothing about how many rows
    /// were affected.
    pub fn execute_update(&self, sql: &str, args: &[Option<String>]) -> Result<()> {
        self.execute_changes(sql, args).map(|_| ())
    }

    /// Execute a statement and report the number of rows it changed.
    pub(crate) fn execute_changes(&self, sql: &str, args: &[Option<String>]) -> Result<usize> {
        debug!(sql, args = args.len(), "execute update");
        let conn = self.connection();
        let changed = conn.execute(sql, params_from_iter(args.iter()))?;
        Ok(changed)
    }

    /// Execute a query and collect every row as text.
    pub fn execute_query(&self, sql: &str, args: &[Option<String>]) -> Result<Vec<Row>> {
        debug!(sql, args = args.len(), "execute query");
        let conn = self.connection();
        let mut stmt = conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(args.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut columns = Vec::with_capacity(names.len());
            for (index, name) in names.iter().enumerate() {
                columns.push((name.clone(), column_text(row.get_ref(index)?)));
            }
            result.push(Row::new(columns));
        }
        Ok(result)
    }

    /// Execute one or more statements separated by semicolons, without
    /// arguments. Meant for DDL in migrations.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        debug!(sql, "execute batch");
        self.connection().execute_batch(sql)?;
        Ok(())
    }

    /// Whether a transaction is currently open on the connection.
    pub fn is_in_transaction(&self) -> bool {
        !self.connection().is_autocommit()
    }

    /// Run `body` inside a transaction.
    ///
    /// Commits when the body returns `Ok(TxOutcome::Commit)`; rolls back when
    /// it returns `Ok(TxOutcome::Rollback)`, an error, or panics. Transactions
    /// do not nest.
    pub fn in_transaction<F>(&self, body: F) -> Result<TxOutcome>
    where
        F: FnOnce(&Database) -> Result<TxOutcome>,
    {
        {
            let conn = self.connection();
            if !conn.is_autocommit() {
                return Err(Error::NestedTransaction);
            }
            conn.execute_batch("BEGIN")?;
        }
        debug!("transaction started");
        let mut guard = RollbackGuard {
            database: self,
            armed: true,
        };
        let outcome = body(self);
        guard.armed = false;
        match outcome {
            Ok(TxOutcome::Commit) => {
                let committed = self.connection().execute_batch("COMMIT");
                if let Err(err) = committed {
                    self.rollback();
                    return Err(err.into());
                }
                debug!("transaction committed");
                Ok(TxOutcome::Commit)
            }
            Ok(TxOutcome::Rollback) => {
                self.rollback();
                Ok(TxOutcome::Rollback)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    fn rollback(&self) {
        let conn = self.connection();
        if conn.is_autocommit() {
            return;
        }
        match conn.execute_batch("ROLLBACK") {
            Ok(()) => debug!("transaction rolled back"),
            Err(err) => warn!(error = %err, "rollback failed"),
        }
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rolls back an open transaction if the body unwinds.
struct RollbackGuard<'a> {
    database: &'a Database,
    armed: bool,
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.database.rollback();
        }
    }
}

fn apply_pragmas(connection: &Connection, config: &DatabaseConfig) -> Result<()> {
    connection.pragma_update(None, "foreign_keys", config.foreign_keys)?;
    let mode: String = connection.pragma_update_and_check(
        None,
        "journal_mode",
        config.journal_mode.pragma_value(),
        |row| row.get(0),
    )?;
    debug!(journal_mode = %mode, "applied pragmas");
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    Ok(())
}

fn column_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(v) => Some(v.to_string()),
        ValueRef::Real(v) => Some(v.to_string()),
        ValueRef::Text(v) => Some(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Some(hex::encode(v)),
    }
}
