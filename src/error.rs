//! Error types for the record layer.

use thiserror::Error;

use crate::codec::CodecError;
use crate::value::ValueKind;

/// Main error type for database and mapping operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (bad path, bad identifier, etc.)
    #[error("configuration error: {0}")]
    Config(String),

    /// The process-wide handle was requested before `Database::configure`.
    #[error("database is not configured")]
    NotConfigured,

    /// `Database::configure` was called a second time.
    #[error("database is already configured")]
    AlreadyConfigured,

    /// Statement preparation or execution failed in SQLite.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error (content directories)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored text could not be decoded as the declared kind.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Keyed access to a property the entity does not declare.
    #[error("unknown field `{field}` on `{entity}`")]
    UnknownField { entity: String, field: String },

    /// A value of the wrong kind was assigned to a property.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: ValueKind,
        actual: ValueKind,
    },

    /// An assigned id cannot be replaced with a different one.
    #[error("id of `{entity}` cannot change once assigned")]
    ImmutableId { entity: String },

    /// Placeholder count and argument count disagree.
    #[error("query expects {expected} argument(s), got {actual}")]
    ArgumentCount { expected: usize, actual: usize },

    /// The entity type was never registered with the schema registry.
    #[error("entity `{0}` is not registered")]
    Unregistered(String),

    /// The entity type's migration failed; the type is unusable.
    #[error("migration failed for table {table}: {reason}")]
    MigrationFailed { table: String, reason: String },

    /// `in_transaction` was entered while a transaction is open.
    #[error("nested transactions are not supported")]
    NestedTransaction,
}

impl Error {
    /// Create an UnknownField error
    pub fn unknown_field(entity: impl Into<String>, field: impl Into<String>) -> Self {
        Error::UnknownField {
            entity: entity.into(),
            field: field.into(),
        }
    }

    /// Create a MigrationFailed error
    pub fn migration(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MigrationFailed {
            table: table.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for record operations.
pub type Result<T> = std::result::Result<T, Error>;
