//! Graph projection of validated clinical entities.
//!
//! The graph is derived data: every node and edge can be rebuilt from a
//! draft, so writes here are best-effort and never authoritative.

pub mod projector;
pub mod sqlite_store;
pub mod store;

pub use projector::*;
pub use sqlite_store::*;
pub use store::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("Graph SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Graph migration failed: {0}")]
    Migration(String),

    #[error("Edge {kind} references missing node {label}:{key}")]
    MissingEndpoint {
        kind: String,
        label: String,
        key: String,
    },

    #[error("Internal lock error")]
    LockPoisoned,
}
