//! Repository layer: entity-scoped database operations.

mod draft;
mod semantic_node;

pub use draft::*;
pub use semantic_node::*;
