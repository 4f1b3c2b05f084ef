//! Dynamic (live) information pushed by registry and node observers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a server process as reported by its node.
///
/// `Unknown` is the local state of a server whose node is unreachable: it is
/// distinct from `Destroyed`, which the node reports explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerState {
    #[default]
    Unknown,
    Inactive,
    Activating,
    ActivationTimedOut,
    Active,
    Deactivating,
    Destroying,
    Destroyed,
}

impl ServerState {
    /// Whether `self` is a normal successor of `prev`.
    ///
    /// Notifications are authoritative, so this is only used to flag
    /// unusual sequences in the logs.
    pub fn follows(self, prev: ServerState) -> bool {
        use ServerState::*;
        match (prev, self) {
            (a, b) if a == b => true,
            (Unknown, _) => true,
            (Inactive, Activating | Destroying) => true,
            (Activating, Active | ActivationTimedOut | Deactivating | Inactive) => true,
            (ActivationTimedOut, Active | Deactivating | Inactive) => true,
            (Active, Deactivating | Inactive) => true,
            (Deactivating, Inactive | Destroying) => true,
            (Destroying, Destroyed | Inactive) => true,
            (Destroyed, Inactive) => true,
            _ => false,
        }
    }

    pub fn is_active(self) -> bool {
        self == ServerState::Active
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Unknown => "unknown",
            ServerState::Inactive => "inactive",
            ServerState::Activating => "activating",
            ServerState::ActivationTimedOut => "activation-timed-out",
            ServerState::Active => "active",
            ServerState::Deactivating => "deactivating",
            ServerState::Destroying => "destroying",
            ServerState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Static information about a node, known only while the node is up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeInfo {
    pub name: String,
    pub os: String,
    pub hostname: String,
    pub release: String,
    pub version: String,
    pub machine: String,
    pub n_processors: u32,
    pub data_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDynamicInfo {
    pub id: String,
    pub state: ServerState,
    #[serde(default)]
    pub pid: u32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterDynamicInfo {
    pub id: String,
    /// Published endpoint; `None` when the adapter is inactive.
    #[serde(default)]
    pub proxy: Option<String>,
}

/// Everything a node reports when it comes up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDynamicInfo {
    pub info: NodeInfo,
    pub servers: Vec<ServerDynamicInfo>,
    pub adapters: Vec<AdapterDynamicInfo>,
}

/// A master or replica registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryInfo {
    pub name: String,
    pub hostname: String,
}

/// Node load averages over 1, 5 and 15 minutes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadInfo {
    pub avg1: f32,
    pub avg5: f32,
    pub avg15: f32,
}
