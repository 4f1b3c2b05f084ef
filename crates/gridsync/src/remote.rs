//! Failures of remote administrative requests.
//!
//! Only two outcomes matter to the tree: the target is transiently
//! unreachable (show a status, keep everything else) or the request failed
//! for another reason (surface the error text on the entity).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum RemoteError {
    /// The node or server object is not registered (anymore).
    #[error("object does not exist: {0}")]
    ObjectNotExist(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The target is down or not reachable right now.
    Unavailable,
    /// Anything else; reported to the user as is.
    Failed,
}

impl RemoteError {
    pub fn classify(&self) -> FailureClass {
        match self {
            RemoteError::ObjectNotExist(_) | RemoteError::ConnectionRefused(_) => {
                FailureClass::Unavailable
            }
            RemoteError::Timeout(_) | RemoteError::Other(_) => FailureClass::Failed,
        }
    }
}
