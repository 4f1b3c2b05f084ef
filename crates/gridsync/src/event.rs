//! Observation events: everything that can change the tree.
//!
//! Observer callbacks and poll responses are turned into
//! [`ObservationEvent`]s and queued to the worker, which applies them one at
//! a time in arrival order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use gridsync_core::{
    AdapterDynamicInfo, ApplicationInfo, ApplicationUpdateInfo, LoadInfo, NodeDynamicInfo,
    RegistryInfo, ServerDynamicInfo,
};
use gridsync_registry::EntityId;

use crate::remote::RemoteError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservationEvent {
    // ── Registry observer ──────────────────────────────────────────
    RegistryInit {
        registries: Vec<RegistryInfo>,
    },
    RegistryUp {
        info: RegistryInfo,
    },
    RegistryDown {
        name: String,
    },

    // ── Application observer ───────────────────────────────────────
    /// Full application list; `serial` restarts the sequence.
    ApplicationInit {
        #[serde(default)]
        serial: u64,
        applications: Vec<ApplicationInfo>,
    },
    ApplicationAdded {
        #[serde(default)]
        serial: u64,
        info: ApplicationInfo,
    },
    ApplicationRemoved {
        #[serde(default)]
        serial: u64,
        name: String,
    },
    ApplicationUpdated {
        #[serde(default)]
        serial: u64,
        info: ApplicationUpdateInfo,
    },

    // ── Node observer ──────────────────────────────────────────────
    /// Nodes that are up when the observer attaches.
    NodeInit {
        nodes: Vec<NodeDynamicInfo>,
    },
    NodeUp {
        info: NodeDynamicInfo,
    },
    NodeDown {
        name: String,
    },
    ServerUpdated {
        node: String,
        info: ServerDynamicInfo,
    },
    AdapterUpdated {
        node: String,
        info: AdapterDynamicInfo,
    },
    ServicesStarted {
        node: String,
        server: String,
        services: Vec<String>,
    },
    ServicesStopped {
        node: String,
        server: String,
        services: Vec<String>,
    },

    // ── Poll responses ─────────────────────────────────────────────
    NodeLoadReported {
        target: EntityId,
        result: Result<LoadInfo, RemoteError>,
    },
    ServerPropertiesReported {
        target: EntityId,
        result: Result<BTreeMap<String, String>, RemoteError>,
    },
}

impl ObservationEvent {
    /// Short name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ObservationEvent::RegistryInit { .. } => "registry_init",
            ObservationEvent::RegistryUp { .. } => "registry_up",
            ObservationEvent::RegistryDown { .. } => "registry_down",
            ObservationEvent::ApplicationInit { .. } => "application_init",
            ObservationEvent::ApplicationAdded { .. } => "application_added",
            ObservationEvent::ApplicationRemoved { .. } => "application_removed",
            ObservationEvent::ApplicationUpdated { .. } => "application_updated",
            ObservationEvent::NodeInit { .. } => "node_init",
            ObservationEvent::NodeUp { .. } => "node_up",
            ObservationEvent::NodeDown { .. } => "node_down",
            ObservationEvent::ServerUpdated { .. } => "server_updated",
            ObservationEvent::AdapterUpdated { .. } => "adapter_updated",
            ObservationEvent::ServicesStarted { .. } => "services_started",
            ObservationEvent::ServicesStopped { .. } => "services_stopped",
            ObservationEvent::NodeLoadReported { .. } => "node_load_reported",
            ObservationEvent::ServerPropertiesReported { .. } => "server_properties_reported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsync_core::ServerState;

    #[test]
    fn parse_tagged_json() {
        let event: ObservationEvent = serde_json::from_str(
            r#"{"type":"server_updated","node":"n1","info":{"id":"s1","state":"active","pid":12}}"#,
        )
        .unwrap();
        match &event {
            ObservationEvent::ServerUpdated { node, info } => {
                assert_eq!(node, "n1");
                assert_eq!(info.state, ServerState::Active);
                assert_eq!(info.pid, 12);
                assert!(info.enabled);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(event.name(), "server_updated");
    }

    #[test]
    fn serial_defaults_to_zero() {
        let event: ObservationEvent =
            serde_json::from_str(r#"{"type":"application_removed","name":"demo"}"#).unwrap();
        assert_eq!(
            event,
            ObservationEvent::ApplicationRemoved {
                serial: 0,
                name: "demo".to_string()
            }
        );
    }
}
