//! Tree change events.
//!
//! Every structural or dynamic change to the registry is recorded as a
//! [`TreeEvent`]. Paths are `/`-separated names from the node down, e.g.
//! `node1/server1/Service/Adapter`; applications and registries use their
//! bare name.

use serde::{Deserialize, Serialize};

use crate::types::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Added,
    Removed,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEvent {
    pub change: Change,
    pub kind: EntityKind,
    pub path: String,
}

impl TreeEvent {
    pub fn new(change: Change, kind: EntityKind, path: impl Into<String>) -> Self {
        Self {
            change,
            kind,
            path: path.into(),
        }
    }
}
