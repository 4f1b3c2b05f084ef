//! Error types for the synchronizer.

use thiserror::Error;

use gridsync_core::DescriptorError;
use gridsync_registry::RegistryError;

/// Result type alias for synchronizer operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("synchronizer is not running")]
    Closed,

    #[error("server `{server}` on node `{node}` belongs to application `{owner}`")]
    ServerConflict {
        node: String,
        server: String,
        owner: String,
    },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
}
