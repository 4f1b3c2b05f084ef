//! Entity types held by the registry.
//!
//! Nodes, servers, services and adapters live in the registry arena and are
//! addressed by [`EntityId`]. Descriptor-derived data comes in as a
//! [`ServerBuild`] / [`ServiceBuild`] produced by the synchronizer's builder;
//! dynamic fields (state, pid, endpoints, ...) are updated in place.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use gridsync_core::{
    ActivationMode, AdapterDescriptor, LoadInfo, NodeDescriptor, NodeInfo, PropertyDescriptor,
    Resolver, ServerDescriptor, ServerDynamicInfo, ServerInstanceDescriptor, ServerState,
    ServiceDescriptor, ServiceInstanceDescriptor,
};

/// Generational handle into the registry arena.
///
/// A handle stays valid for the lifetime of the entity, including in-place
/// rebuilds. Once the entity is removed the handle never resolves again,
/// even if its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Registry,
    Application,
    Node,
    Server,
    Service,
    Adapter,
}

// ── Builds ─────────────────────────────────────────────────────────

/// Where a server's descriptor came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOrigin {
    Plain,
    Instance(ServerInstanceDescriptor),
}

impl ServerOrigin {
    pub fn template(&self) -> Option<&str> {
        match self {
            ServerOrigin::Plain => None,
            ServerOrigin::Instance(instance) => Some(instance.template.as_str()),
        }
    }
}

/// Server fields after variable substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedServer {
    pub exe: String,
    pub pwd: String,
    pub options: Vec<String>,
    pub envs: Vec<String>,
    pub user: String,
    pub activation: ActivationMode,
    pub activation_timeout: Option<u32>,
    pub deactivation_timeout: Option<u32>,
    pub properties: Vec<PropertyDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub id: String,
    pub application: String,
    pub origin: ServerOrigin,
    /// Descriptor with any template applied, before substitution.
    pub descriptor: ServerDescriptor,
    pub resolver: Resolver,
    pub resolved: ResolvedServer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub instance: ServiceInstanceDescriptor,
    /// Descriptor with any template applied, before substitution.
    pub descriptor: ServiceDescriptor,
    pub resolver: Resolver,
    pub entry: String,
    pub properties: Vec<PropertyDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSpec {
    pub name: String,
    /// Resolved adapter id; empty for adapters that are not published.
    pub id: String,
    pub replica_group_id: String,
    pub descriptor: AdapterDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBuild {
    pub spec: ServiceSpec,
    pub adapters: Vec<AdapterSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerBuild {
    pub spec: ServerSpec,
    pub adapters: Vec<AdapterSpec>,
    /// `Some` for container servers.
    pub services: Option<Vec<ServiceBuild>>,
}

// ── Entities ───────────────────────────────────────────────────────

/// What one application deploys on a node, with the resolver its servers
/// are built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeApplication {
    pub descriptor: NodeDescriptor,
    pub resolver: Resolver,
}

#[derive(Debug, Clone)]
pub struct NodeEntity {
    pub(crate) name: String,
    pub up: bool,
    /// Present only while the node is up.
    pub info: Option<NodeInfo>,
    pub load: Option<LoadInfo>,
    /// Transient status such as "unreachable".
    pub status: Option<String>,
    pub last_error: Option<String>,
    pub(crate) applications: BTreeMap<String, NodeApplication>,
    pub(crate) servers: BTreeMap<String, EntityId>,
    /// Last server info reported by the node, by server id, including
    /// servers not (yet) in the tree.
    pub(crate) server_infos: BTreeMap<String, ServerDynamicInfo>,
    /// Last published endpoint reported by the node, by adapter id.
    pub(crate) adapter_endpoints: BTreeMap<String, String>,
}

impl NodeEntity {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            up: false,
            info: None,
            load: None,
            status: None,
            last_error: None,
            applications: BTreeMap::new(),
            servers: BTreeMap::new(),
            server_infos: BTreeMap::new(),
            adapter_endpoints: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn application(&self, name: &str) -> Option<&NodeApplication> {
        self.applications.get(name)
    }

    pub fn application_names(&self) -> impl Iterator<Item = &str> {
        self.applications.keys().map(String::as_str)
    }

    pub fn has_applications(&self) -> bool {
        !self.applications.is_empty()
    }

    /// Servers sorted by id.
    pub fn servers(&self) -> impl Iterator<Item = (&str, EntityId)> {
        self.servers.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }
}

#[derive(Debug, Clone)]
pub struct ServerEntity {
    pub(crate) spec: ServerSpec,
    pub(crate) node: EntityId,
    pub state: ServerState,
    pub pid: u32,
    pub enabled: bool,
    pub runtime_properties: Option<BTreeMap<String, String>>,
    pub status: Option<String>,
    pub last_error: Option<String>,
    pub(crate) adapters: BTreeMap<String, EntityId>,
    pub(crate) services: Option<BTreeMap<String, EntityId>>,
}

impl ServerEntity {
    pub(crate) fn new(spec: ServerSpec, node: EntityId, container: bool) -> Self {
        Self {
            spec,
            node,
            state: ServerState::Unknown,
            pid: 0,
            enabled: true,
            runtime_properties: None,
            status: None,
            last_error: None,
            adapters: BTreeMap::new(),
            services: container.then(BTreeMap::new),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn application(&self) -> &str {
        &self.spec.application
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub fn node(&self) -> EntityId {
        self.node
    }

    pub fn is_container(&self) -> bool {
        self.services.is_some()
    }

    pub fn adapters(&self) -> impl Iterator<Item = (&str, EntityId)> {
        self.adapters.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Services sorted by name; empty for plain servers.
    pub fn services(&self) -> impl Iterator<Item = (&str, EntityId)> {
        self.services
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), *v))
    }
}

#[derive(Debug, Clone)]
pub struct ServiceEntity {
    pub(crate) spec: ServiceSpec,
    pub(crate) server: EntityId,
    pub started: bool,
    pub(crate) adapters: BTreeMap<String, EntityId>,
}

impl ServiceEntity {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn server(&self) -> EntityId {
        self.server
    }

    pub fn adapters(&self) -> impl Iterator<Item = (&str, EntityId)> {
        self.adapters.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[derive(Debug, Clone)]
pub struct AdapterEntity {
    pub(crate) spec: AdapterSpec,
    pub(crate) owner: EntityId,
    /// Published endpoint; `None` while inactive.
    pub endpoint: Option<String>,
}

impl AdapterEntity {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn adapter_id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &AdapterSpec {
        &self.spec
    }

    /// The owning server or service.
    pub fn owner(&self) -> EntityId {
        self.owner
    }
}

#[derive(Debug, Clone)]
pub enum Entity {
    Node(NodeEntity),
    Server(ServerEntity),
    Service(ServiceEntity),
    Adapter(AdapterEntity),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Node(_) => EntityKind::Node,
            Entity::Server(_) => EntityKind::Server,
            Entity::Service(_) => EntityKind::Service,
            Entity::Adapter(_) => EntityKind::Adapter,
        }
    }
}
