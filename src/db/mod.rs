pub mod draft_store;
pub mod repository;
pub mod sqlite;

pub use draft_store::*;
pub use repository::*;
pub use sqlite::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Stored JSON is corrupt for {entity_type} {id}: {reason}")]
    CorruptRecord {
        entity_type: String,
        id: String,
        reason: String,
    },

    #[error("Version conflict on {id}: expected version {expected}, found {found}")]
    VersionConflict { id: String, expected: i64, found: i64 },

    #[error("Draft {id} is {status} and cannot be modified")]
    InvalidTransition { id: String, status: String },

    #[error("Internal lock error")]
    LockPoisoned,
}
