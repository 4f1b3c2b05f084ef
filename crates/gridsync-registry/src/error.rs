//! Error types for structural registry operations.
//!
//! Lookups never fail: they return `Option`. Only structural changes that
//! name a parent or entity that does not exist produce an error.

use thiserror::Error;

use crate::types::EntityId;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown parent entity {0}")]
    UnknownParent(EntityId),

    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error("server `{server}` already exists on node `{node}`")]
    DuplicateServer { node: String, server: String },
}
