//! Active-record persistence over SQLite for the Runar ecosystem.
//!
//! # Intention
//!
//! - Map application entities to rows: `save`, `delete`, `all`, `all_where`
//!   and friends, with property values crossing the SQLite boundary as text.
//! - Run per-entity schema migrations at startup from an explicit registry.
//! - Notify observers after inserts, modifications and deletions commit.
//!
//! # Architectural Boundaries
//!
//! - One process, one connection. No pooling, no async, no retries.
//! - Predicates are opaque SQL fragments; nothing here parses or plans them.
//!
//! # Example
//!
//! ```ignore
//! let db = Arc::new(Database::open(DatabaseConfig::new("app.db"))?);
//! let mut schema = SchemaRegistry::new();
//! schema.register::<User>();
//! let store = Store::open(db, schema)?;
//!
//! let mut alice = User { name: "Alice".into(), age: 30, ..Default::default() };
//! alice.save(&store)?;
//! let adults = User::all_where(&store, "age > ?", &sql_args![18])?;
//! ```

pub mod codec;
pub mod config;
pub mod entity;
pub mod error;
pub mod mapper;
pub mod observer;
pub mod query;
pub mod schema;
pub mod sqlite;
pub mod value;

pub use codec::CodecError;
pub use config::{DatabaseConfig, JournalMode};
pub use entity::{normalize_name, Entity, Field, FieldTable, ID_COLUMN};
pub use error::{Error, Result};
pub use mapper::{Record, Store};
pub use observer::{Events, ObserverContext, ObserverRegistry};
pub use query::{quote_identifier, QueryBuilder};
pub use schema::{MigrationStatus, SchemaRegistry, TableDefinition};
pub use sqlite::{Database, Row, TxOutcome};
pub use value::{FieldValue, Value, ValueKind};
