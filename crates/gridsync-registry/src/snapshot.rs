//! Serializable point-in-time view of the registry.
//!
//! Snapshots are sorted the same way the tree is (nodes by name, servers
//! by id, services and adapters by name), so two registries holding the
//! same deployment produce equal snapshots.

use serde::{Deserialize, Serialize};

use gridsync_core::{LoadInfo, NodeInfo, PropertyDescriptor, RegistryInfo, ServerState};

use crate::registry::Registry;
use crate::types::EntityId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub registries: Vec<RegistryInfo>,
    pub applications: Vec<ApplicationSnapshot>,
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSnapshot {
    pub name: String,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<NodeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadInfo>,
    pub applications: Vec<String>,
    pub servers: Vec<ServerSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub id: String,
    pub application: String,
    pub state: ServerState,
    pub pid: u32,
    pub enabled: bool,
    pub exe: String,
    pub properties: Vec<PropertyDescriptor>,
    pub adapters: Vec<AdapterSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceSnapshot>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub entry: String,
    pub started: bool,
    pub properties: Vec<PropertyDescriptor>,
    pub adapters: Vec<AdapterSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSnapshot {
    pub name: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Snapshot {
    pub fn server_count(&self) -> usize {
        self.nodes.iter().map(|n| n.servers.len()).sum()
    }

    pub fn node(&self, name: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

impl Registry {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            registries: self.registries().cloned().collect(),
            applications: self
                .applications()
                .map(|a| ApplicationSnapshot {
                    name: a.descriptor.name.clone(),
                    revision: a.revision,
                })
                .collect(),
            nodes: self
                .nodes()
                .map(|(id, node)| NodeSnapshot {
                    name: node.name().to_string(),
                    up: node.up,
                    info: node.info.clone(),
                    load: node.load,
                    applications: node.application_names().map(str::to_string).collect(),
                    servers: self
                        .servers_of(id)
                        .into_iter()
                        .filter_map(|s| self.server_snapshot(s))
                        .collect(),
                })
                .collect(),
        }
    }

    fn server_snapshot(&self, id: EntityId) -> Option<ServerSnapshot> {
        let server = self.get_server(id)?;
        let services: Option<Vec<ServiceSnapshot>> = server.is_container().then(|| {
            server
                .services()
                .filter_map(|(_, svc)| self.get_service(svc))
                .map(|svc| ServiceSnapshot {
                    name: svc.name().to_string(),
                    entry: svc.spec().entry.clone(),
                    started: svc.started,
                    properties: svc.spec().properties.clone(),
                    adapters: self.adapter_snapshots(svc.adapters().map(|(_, a)| a)),
                })
                .collect()
        });

        Some(ServerSnapshot {
            id: server.id().to_string(),
            application: server.application().to_string(),
            state: server.state,
            pid: server.pid,
            enabled: server.enabled,
            exe: server.spec().resolved.exe.clone(),
            properties: server.spec().resolved.properties.clone(),
            adapters: self.adapter_snapshots(server.adapters().map(|(_, a)| a)),
            services,
        })
    }

    fn adapter_snapshots(&self, ids: impl Iterator<Item = EntityId>) -> Vec<AdapterSnapshot> {
        ids.filter_map(|id| self.get_adapter(id))
            .map(|a| AdapterSnapshot {
                name: a.name().to_string(),
                id: a.adapter_id().to_string(),
                endpoint: a.endpoint.clone(),
            })
            .collect()
    }
}
