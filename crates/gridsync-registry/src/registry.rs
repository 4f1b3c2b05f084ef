//! Registry — the live deployment tree.
//!
//! Nodes, servers, services and adapters are stored in a generational arena
//! and linked parent → children through `BTreeMap`s keyed by id, so
//! siblings stay sorted and insert/remove is O(log n). Applications and
//! registries are plain keyed maps.
//!
//! Lookups return `Option`: observer notifications routinely race with
//! topology changes, so a missing entity is an expected outcome.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, trace};

use gridsync_core::{
    AdapterDynamicInfo, ApplicationInfo, RegistryInfo, ServerDynamicInfo, ServerState,
};

use crate::error::{RegistryError, RegistryResult};
use crate::events::{Change, TreeEvent};
use crate::types::*;

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

/// Dynamic data carried over when a server's children are recreated.
#[derive(Debug, Default)]
struct Carry {
    /// Endpoint by adapter id.
    endpoints: HashMap<String, String>,
    /// Names of started services.
    started: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    registries: BTreeMap<String, RegistryInfo>,
    applications: BTreeMap<String, ApplicationInfo>,
    nodes: BTreeMap<String, EntityId>,
    adapter_index: HashMap<String, EntityId>,
    events: Vec<TreeEvent>,
}

fn remove_if(map: &mut BTreeMap<String, EntityId>, key: &str, id: EntityId) {
    if map.get(key) == Some(&id) {
        map.remove(key);
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Arena ──────────────────────────────────────────────────────

    fn alloc(&mut self, entity: Entity) -> EntityId {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entity = Some(entity);
                EntityId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entity: Some(entity),
                });
                EntityId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn release(&mut self, id: EntityId) -> Option<Entity> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entity = slot.entity.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(entity)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entity.as_ref()
    }

    fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entity.as_mut()
    }

    /// Whether `id` still designates a live entity. This is the staleness
    /// check for anything that captured a handle earlier.
    pub fn is_live(&self, id: EntityId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live arena entities (nodes, servers, services, adapters).
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0 && self.applications.is_empty() && self.registries.is_empty()
    }

    pub fn get_node(&self, id: EntityId) -> Option<&NodeEntity> {
        match self.get(id)? {
            Entity::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn node_mut(&mut self, id: EntityId) -> Option<&mut NodeEntity> {
        match self.get_mut(id)? {
            Entity::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn get_server(&self, id: EntityId) -> Option<&ServerEntity> {
        match self.get(id)? {
            Entity::Server(s) => Some(s),
            _ => None,
        }
    }

    pub fn server_mut(&mut self, id: EntityId) -> Option<&mut ServerEntity> {
        match self.get_mut(id)? {
            Entity::Server(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_service(&self, id: EntityId) -> Option<&ServiceEntity> {
        match self.get(id)? {
            Entity::Service(s) => Some(s),
            _ => None,
        }
    }

    pub fn service_mut(&mut self, id: EntityId) -> Option<&mut ServiceEntity> {
        match self.get_mut(id)? {
            Entity::Service(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_adapter(&self, id: EntityId) -> Option<&AdapterEntity> {
        match self.get(id)? {
            Entity::Adapter(a) => Some(a),
            _ => None,
        }
    }

    pub fn adapter_mut(&mut self, id: EntityId) -> Option<&mut AdapterEntity> {
        match self.get_mut(id)? {
            Entity::Adapter(a) => Some(a),
            _ => None,
        }
    }

    // ── Lookup by name ─────────────────────────────────────────────

    pub fn find_node(&self, name: &str) -> Option<EntityId> {
        self.nodes.get(name).copied()
    }

    pub fn node(&self, name: &str) -> Option<&NodeEntity> {
        self.get_node(self.find_node(name)?)
    }

    pub fn find_server(&self, node: &str, server: &str) -> Option<EntityId> {
        self.node(node)?.servers.get(server).copied()
    }

    pub fn server(&self, node: &str, server: &str) -> Option<&ServerEntity> {
        self.get_server(self.find_server(node, server)?)
    }

    pub fn find_service(&self, node: &str, server: &str, service: &str) -> Option<EntityId> {
        self.server(node, server)?
            .services
            .as_ref()?
            .get(service)
            .copied()
    }

    pub fn service(&self, node: &str, server: &str, service: &str) -> Option<&ServiceEntity> {
        self.get_service(self.find_service(node, server, service)?)
    }

    /// Find a published adapter by its adapter id.
    pub fn find_adapter(&self, adapter_id: &str) -> Option<EntityId> {
        self.adapter_index.get(adapter_id).copied()
    }

    pub fn adapter(&self, adapter_id: &str) -> Option<&AdapterEntity> {
        self.get_adapter(self.find_adapter(adapter_id)?)
    }

    /// Nodes sorted by name.
    pub fn nodes(&self) -> impl Iterator<Item = (EntityId, &NodeEntity)> {
        self.nodes
            .values()
            .filter_map(|id| self.get_node(*id).map(|n| (*id, n)))
    }

    pub fn servers_of(&self, node: EntityId) -> Vec<EntityId> {
        self.get_node(node)
            .map(|n| n.servers.values().copied().collect())
            .unwrap_or_default()
    }

    /// Servers on `node` deployed by `application`.
    pub fn application_servers(&self, node: EntityId, application: &str) -> Vec<EntityId> {
        self.servers_of(node)
            .into_iter()
            .filter(|id| {
                self.get_server(*id)
                    .is_some_and(|s| s.spec.application == application)
            })
            .collect()
    }

    /// Adapters of a server and of all its services.
    pub fn server_adapters(&self, server: EntityId) -> Vec<EntityId> {
        let Some(s) = self.get_server(server) else {
            return Vec::new();
        };
        let mut out: Vec<EntityId> = s.adapters.values().copied().collect();
        for (_, service) in s.services() {
            if let Some(svc) = self.get_service(service) {
                out.extend(svc.adapters.values().copied());
            }
        }
        out
    }

    /// `/`-separated path of an entity, from its node down.
    pub fn path(&self, id: EntityId) -> Option<String> {
        match self.get(id)? {
            Entity::Node(n) => Some(n.name.clone()),
            Entity::Server(s) => Some(format!("{}/{}", self.path(s.node)?, s.spec.id)),
            Entity::Service(s) => Some(format!("{}/{}", self.path(s.server)?, s.spec.name)),
            Entity::Adapter(a) => Some(format!("{}/{}", self.path(a.owner)?, a.spec.name)),
        }
    }

    /// Node an entity lives on.
    pub fn node_of(&self, id: EntityId) -> Option<EntityId> {
        match self.get(id)? {
            Entity::Node(_) => Some(id),
            Entity::Server(s) => self.node_of(s.node),
            Entity::Service(s) => self.node_of(s.server),
            Entity::Adapter(a) => self.node_of(a.owner),
        }
    }

    // ── Events ─────────────────────────────────────────────────────

    fn emit(&mut self, change: Change, id: EntityId) {
        let Some(kind) = self.get(id).map(Entity::kind) else {
            return;
        };
        if let Some(path) = self.path(id) {
            trace!(?change, ?kind, %path, "tree event");
            self.events.push(TreeEvent::new(change, kind, path));
        }
    }

    fn emit_named(&mut self, change: Change, kind: EntityKind, name: &str) {
        trace!(?change, ?kind, %name, "tree event");
        self.events.push(TreeEvent::new(change, kind, name));
    }

    /// Record that dynamic fields of `id` changed.
    pub fn mark_changed(&mut self, id: EntityId) {
        self.emit(Change::Changed, id);
    }

    /// Take all events recorded since the last drain.
    pub fn drain_events(&mut self) -> Vec<TreeEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Registries ─────────────────────────────────────────────────

    pub fn registry_up(&mut self, info: RegistryInfo) {
        let name = info.name.clone();
        let change = match self.registries.insert(name.clone(), info) {
            Some(_) => Change::Changed,
            None => Change::Added,
        };
        self.emit_named(change, EntityKind::Registry, &name);
    }

    pub fn registry_down(&mut self, name: &str) -> bool {
        let existed = self.registries.remove(name).is_some();
        if existed {
            self.emit_named(Change::Removed, EntityKind::Registry, name);
        }
        existed
    }

    pub fn registries(&self) -> impl Iterator<Item = &RegistryInfo> {
        self.registries.values()
    }

    // ── Applications ───────────────────────────────────────────────

    pub fn application(&self, name: &str) -> Option<&ApplicationInfo> {
        self.applications.get(name)
    }

    pub fn application_mut(&mut self, name: &str) -> Option<&mut ApplicationInfo> {
        self.applications.get_mut(name)
    }

    pub fn applications(&self) -> impl Iterator<Item = &ApplicationInfo> {
        self.applications.values()
    }

    /// Insert or replace an application. Returns true if it was new.
    pub fn insert_application(&mut self, info: ApplicationInfo) -> bool {
        let name = info.descriptor.name.clone();
        let added = self.applications.insert(name.clone(), info).is_none();
        let change = if added { Change::Added } else { Change::Changed };
        self.emit_named(change, EntityKind::Application, &name);
        added
    }

    pub fn remove_application(&mut self, name: &str) -> Option<ApplicationInfo> {
        let removed = self.applications.remove(name);
        if removed.is_some() {
            self.emit_named(Change::Removed, EntityKind::Application, name);
        }
        removed
    }

    pub fn mark_application_changed(&mut self, name: &str) {
        if self.applications.contains_key(name) {
            self.emit_named(Change::Changed, EntityKind::Application, name);
        }
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert a node (down, hosting nothing) or return the existing one.
    pub fn insert_node(&mut self, name: &str) -> EntityId {
        if let Some(id) = self.find_node(name) {
            return id;
        }
        let id = self.alloc(Entity::Node(NodeEntity::new(name)));
        self.nodes.insert(name.to_string(), id);
        self.emit(Change::Added, id);
        debug!(node = %name, "node added");
        id
    }

    /// Remove a node with all its servers.
    pub fn remove_node(&mut self, id: EntityId) -> bool {
        let Some(node) = self.get_node(id) else {
            return false;
        };
        let name = node.name.clone();
        for server in self.servers_of(id) {
            self.remove_server(server);
        }
        self.emit(Change::Removed, id);
        self.release(id);
        remove_if(&mut self.nodes, &name, id);
        debug!(node = %name, "node removed");
        true
    }

    pub fn set_node_application(
        &mut self,
        node: EntityId,
        application: &str,
        value: NodeApplication,
    ) -> RegistryResult<()> {
        let n = self
            .node_mut(node)
            .ok_or(RegistryError::UnknownEntity(node))?;
        n.applications.insert(application.to_string(), value);
        Ok(())
    }

    /// Forget what `application` deploys on `node`. Servers are left to
    /// the caller.
    pub fn remove_node_application(
        &mut self,
        node: EntityId,
        application: &str,
    ) -> Option<NodeApplication> {
        self.node_mut(node)?.applications.remove(application)
    }

    /// Remove `node` if it is down and hosts no application. Returns true if
    /// it was removed.
    pub fn prune_node(&mut self, node: EntityId) -> bool {
        let unused = self
            .get_node(node)
            .is_some_and(|n| !n.up && n.applications.is_empty());
        unused && self.remove_node(node)
    }

    // ── Node dynamic info ──────────────────────────────────────────

    /// Replace everything `node` reported about its servers and adapters.
    pub fn reset_dynamic_info(
        &mut self,
        node: EntityId,
        servers: &[ServerDynamicInfo],
        adapters: &[AdapterDynamicInfo],
    ) {
        if let Some(n) = self.node_mut(node) {
            n.server_infos = servers.iter().map(|s| (s.id.clone(), s.clone())).collect();
            n.adapter_endpoints = adapters
                .iter()
                .filter_map(|a| a.proxy.clone().map(|p| (a.id.clone(), p)))
                .collect();
        }
    }

    pub fn record_server_info(&mut self, node: EntityId, info: &ServerDynamicInfo) {
        if let Some(n) = self.node_mut(node) {
            n.server_infos.insert(info.id.clone(), info.clone());
        }
    }

    pub fn record_adapter_endpoint(
        &mut self,
        node: EntityId,
        adapter_id: &str,
        endpoint: Option<&str>,
    ) {
        if let Some(n) = self.node_mut(node) {
            match endpoint {
                Some(endpoint) => {
                    n.adapter_endpoints
                        .insert(adapter_id.to_string(), endpoint.to_string());
                }
                None => {
                    n.adapter_endpoints.remove(adapter_id);
                }
            }
        }
    }

    pub fn clear_dynamic_info(&mut self, node: EntityId) {
        self.reset_dynamic_info(node, &[], &[]);
    }

    // ── Servers ────────────────────────────────────────────────────

    pub fn insert_server(&mut self, node: EntityId, build: ServerBuild) -> RegistryResult<EntityId> {
        let n = self
            .get_node(node)
            .ok_or(RegistryError::UnknownParent(node))?;
        if n.servers.contains_key(&build.spec.id) {
            return Err(RegistryError::DuplicateServer {
                node: n.name.clone(),
                server: build.spec.id,
            });
        }
        let carry = self.node_carry(node);
        Ok(self.attach_server(node, build, &carry))
    }

    /// Replace a server's descriptor-derived data in place.
    ///
    /// The server keeps its handle, its position among its siblings and its
    /// dynamic state; adapters and services are recreated, keeping known
    /// endpoints (by adapter id) and started flags (by service name). A
    /// build with a different id replaces the server with a new entity.
    pub fn rebuild_server(&mut self, id: EntityId, build: ServerBuild) -> RegistryResult<EntityId> {
        let server = self
            .get_server(id)
            .ok_or(RegistryError::UnknownEntity(id))?;
        let node = server.node;

        if server.spec.id != build.spec.id {
            debug!(old = %server.spec.id, new = %build.spec.id, "server id changed by rebuild");
            if let Some(n) = self.get_node(node) {
                if n.servers.contains_key(&build.spec.id) {
                    return Err(RegistryError::DuplicateServer {
                        node: n.name.clone(),
                        server: build.spec.id,
                    });
                }
            }
            self.remove_server(id);
            return self.insert_server(node, build);
        }

        let carry = self.carry(node, id);
        self.remove_children(id);

        let ServerBuild {
            spec,
            adapters,
            services,
        } = build;
        if let Some(server) = self.server_mut(id) {
            server.spec = spec;
            server.services = services.as_ref().map(|_| BTreeMap::new());
        }
        self.attach_children(id, adapters, services, &carry);
        self.emit(Change::Changed, id);
        Ok(id)
    }

    /// Remove a server with its services and adapters.
    pub fn remove_server(&mut self, id: EntityId) -> bool {
        let Some(server) = self.get_server(id) else {
            return false;
        };
        let node = server.node;
        let key = server.spec.id.clone();

        self.remove_children(id);
        self.emit(Change::Removed, id);
        self.release(id);
        if let Some(n) = self.node_mut(node) {
            remove_if(&mut n.servers, &key, id);
        }
        true
    }

    fn attach_server(&mut self, node: EntityId, build: ServerBuild, carry: &Carry) -> EntityId {
        let ServerBuild {
            spec,
            adapters,
            services,
        } = build;
        let key = spec.id.clone();
        let mut server = ServerEntity::new(spec, node, services.is_some());
        if let Some(n) = self.get_node(node) {
            match n.server_infos.get(&key) {
                Some(info) => {
                    server.state = info.state;
                    server.pid = info.pid;
                    server.enabled = info.enabled;
                }
                None if n.up => server.state = ServerState::Inactive,
                None => {}
            }
        }
        let id = self.alloc(Entity::Server(server));
        if let Some(n) = self.node_mut(node) {
            n.servers.insert(key, id);
        }
        self.emit(Change::Added, id);
        self.attach_children(id, adapters, services, carry);
        id
    }

    fn attach_children(
        &mut self,
        server: EntityId,
        adapters: Vec<AdapterSpec>,
        services: Option<Vec<ServiceBuild>>,
        carry: &Carry,
    ) {
        for spec in adapters {
            self.insert_adapter(server, spec, carry);
        }

        for ServiceBuild { spec, adapters } in services.into_iter().flatten() {
            let key = spec.name.clone();
            let started = carry.started.contains(&key);
            let id = self.alloc(Entity::Service(ServiceEntity {
                spec,
                server,
                started,
                adapters: BTreeMap::new(),
            }));
            let previous = self
                .server_mut(server)
                .and_then(|s| s.services.as_mut())
                .and_then(|m| m.insert(key, id));
            if let Some(previous) = previous {
                self.remove_service(previous);
            }
            self.emit(Change::Added, id);
            for spec in adapters {
                self.insert_adapter(id, spec, carry);
            }
        }
    }

    fn remove_children(&mut self, server: EntityId) {
        let Some(s) = self.get_server(server) else {
            return;
        };
        let services: Vec<EntityId> = s.services().map(|(_, id)| id).collect();
        let adapters: Vec<EntityId> = s.adapters.values().copied().collect();
        for service in services {
            self.remove_service(service);
        }
        for adapter in adapters {
            self.remove_adapter(adapter);
        }
    }

    fn node_carry(&self, node: EntityId) -> Carry {
        let endpoints = self
            .get_node(node)
            .map(|n| n.adapter_endpoints.clone().into_iter().collect())
            .unwrap_or_default();
        Carry {
            endpoints,
            started: BTreeSet::new(),
        }
    }

    fn carry(&self, node: EntityId, server: EntityId) -> Carry {
        let mut carry = self.node_carry(node);
        for id in self.server_adapters(server) {
            if let Some(a) = self.get_adapter(id) {
                if let Some(endpoint) = a.endpoint.as_ref().filter(|_| !a.spec.id.is_empty()) {
                    carry.endpoints.insert(a.spec.id.clone(), endpoint.clone());
                }
            }
        }
        if let Some(s) = self.get_server(server) {
            for (name, id) in s.services() {
                if self.get_service(id).is_some_and(|svc| svc.started) {
                    carry.started.insert(name.to_string());
                }
            }
        }
        carry
    }

    // ── Services & adapters ────────────────────────────────────────

    fn remove_service(&mut self, id: EntityId) -> bool {
        let Some(service) = self.get_service(id) else {
            return false;
        };
        let server = service.server;
        let key = service.spec.name.clone();
        let adapters: Vec<EntityId> = service.adapters.values().copied().collect();

        for adapter in adapters {
            self.remove_adapter(adapter);
        }
        self.emit(Change::Removed, id);
        self.release(id);
        if let Some(map) = self.server_mut(server).and_then(|s| s.services.as_mut()) {
            remove_if(map, &key, id);
        }
        true
    }

    fn insert_adapter(&mut self, owner: EntityId, spec: AdapterSpec, carry: &Carry) -> EntityId {
        let key = spec.name.clone();
        let adapter_id = spec.id.clone();
        let endpoint = if adapter_id.is_empty() {
            None
        } else {
            carry.endpoints.get(&adapter_id).cloned()
        };

        let id = self.alloc(Entity::Adapter(AdapterEntity {
            spec,
            owner,
            endpoint,
        }));
        let previous = match self.get_mut(owner) {
            Some(Entity::Server(s)) => s.adapters.insert(key, id),
            Some(Entity::Service(s)) => s.adapters.insert(key, id),
            _ => None,
        };
        if let Some(previous) = previous {
            self.remove_adapter(previous);
        }
        if !adapter_id.is_empty() {
            if let Some(other) = self.adapter_index.insert(adapter_id.clone(), id) {
                if self.is_live(other) {
                    debug!(adapter = %adapter_id, "adapter id now designates another adapter");
                }
            }
        }
        self.emit(Change::Added, id);
        id
    }

    fn remove_adapter(&mut self, id: EntityId) -> bool {
        let Some(adapter) = self.get_adapter(id) else {
            return false;
        };
        let owner = adapter.owner;
        let key = adapter.spec.name.clone();
        let adapter_id = adapter.spec.id.clone();

        self.emit(Change::Removed, id);
        self.release(id);
        match self.get_mut(owner) {
            Some(Entity::Server(s)) => remove_if(&mut s.adapters, &key, id),
            Some(Entity::Service(s)) => remove_if(&mut s.adapters, &key, id),
            _ => {}
        }
        if self.adapter_index.get(&adapter_id) == Some(&id) {
            self.adapter_index.remove(&adapter_id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsync_core::{
        AdapterDescriptor, NodeDescriptor, Resolver, ServerDescriptor, ServerState,
        ServiceDescriptor, ServiceInstanceDescriptor,
    };

    fn adapter(name: &str, id: &str) -> AdapterSpec {
        AdapterSpec {
            name: name.to_string(),
            id: id.to_string(),
            replica_group_id: String::new(),
            descriptor: AdapterDescriptor::default(),
        }
    }

    fn server_build(id: &str, exe: &str, adapters: Vec<AdapterSpec>) -> ServerBuild {
        ServerBuild {
            spec: ServerSpec {
                id: id.to_string(),
                application: "demo".to_string(),
                origin: ServerOrigin::Plain,
                descriptor: ServerDescriptor {
                    id: id.to_string(),
                    exe: exe.to_string(),
                    ..Default::default()
                },
                resolver: Resolver::new(),
                resolved: ResolvedServer {
                    exe: exe.to_string(),
                    ..Default::default()
                },
            },
            adapters,
            services: None,
        }
    }

    fn service_build(name: &str, adapters: Vec<AdapterSpec>) -> ServiceBuild {
        ServiceBuild {
            spec: ServiceSpec {
                name: name.to_string(),
                instance: ServiceInstanceDescriptor::default(),
                descriptor: ServiceDescriptor::default(),
                resolver: Resolver::new(),
                entry: format!("{name}:create"),
                properties: Vec::new(),
            },
            adapters,
        }
    }

    fn container_build(id: &str, services: Vec<ServiceBuild>) -> ServerBuild {
        ServerBuild {
            services: Some(services),
            ..server_build(id, "icebox", Vec::new())
        }
    }

    #[test]
    fn lookups_on_empty_registry_return_none() {
        let reg = Registry::new();
        assert!(reg.node("n1").is_none());
        assert!(reg.server("n1", "s1").is_none());
        assert!(reg.service("n1", "s1", "svc").is_none());
        assert!(reg.adapter("a1").is_none());
        assert!(reg.application("demo").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn servers_are_sorted_by_id() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        for id in ["s3", "s1", "s2"] {
            reg.insert_server(node, server_build(id, "./a", Vec::new())).unwrap();
        }
        let ids: Vec<&str> = reg.node("n1").unwrap().servers().map(|(k, _)| k).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn duplicate_server_is_rejected() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        reg.insert_server(node, server_build("s1", "./a", Vec::new())).unwrap();
        let err = reg
            .insert_server(node, server_build("s1", "./b", Vec::new()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateServer { .. }));
    }

    #[test]
    fn insert_into_missing_node_fails() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        reg.remove_node(node);
        let err = reg
            .insert_server(node, server_build("s1", "./a", Vec::new()))
            .unwrap_err();
        assert_eq!(err, RegistryError::UnknownParent(node));
    }

    #[test]
    fn removed_handle_is_stale_even_after_slot_reuse() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        let s1 = reg.insert_server(node, server_build("s1", "./a", Vec::new())).unwrap();
        assert!(reg.remove_server(s1));
        assert!(!reg.is_live(s1));

        let s2 = reg.insert_server(node, server_build("s2", "./a", Vec::new())).unwrap();
        assert_eq!(s2.index, s1.index);
        assert!(reg.get_server(s1).is_none());
        assert_eq!(reg.get_server(s2).unwrap().id(), "s2");
    }

    #[test]
    fn adapters_are_indexed_by_id() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        let s1 = reg
            .insert_server(
                node,
                server_build("s1", "./a", vec![adapter("Public", "s1.Public"), adapter("Local", "")]),
            )
            .unwrap();

        let a = reg.adapter("s1.Public").unwrap();
        assert_eq!(a.owner(), s1);
        assert_eq!(reg.server_adapters(s1).len(), 2);
        assert!(reg.find_adapter("").is_none());
        assert_eq!(reg.path(reg.find_adapter("s1.Public").unwrap()).unwrap(), "n1/s1/Public");

        reg.remove_server(s1);
        assert!(reg.adapter("s1.Public").is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn rebuild_keeps_identity_state_and_endpoints() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        reg.insert_server(node, server_build("s0", "./z", Vec::new())).unwrap();
        let s1 = reg
            .insert_server(node, server_build("s1", "./a", vec![adapter("A", "s1.A")]))
            .unwrap();
        reg.insert_server(node, server_build("s2", "./z", Vec::new())).unwrap();

        {
            let server = reg.server_mut(s1).unwrap();
            server.state = ServerState::Active;
            server.pid = 42;
        }
        let a = reg.find_adapter("s1.A").unwrap();
        reg.adapter_mut(a).unwrap().endpoint = Some("tcp -p 10000".to_string());

        let rebuilt = reg
            .rebuild_server(
                s1,
                server_build("s1", "./b", vec![adapter("A", "s1.A"), adapter("B", "s1.B")]),
            )
            .unwrap();

        assert_eq!(rebuilt, s1);
        let server = reg.get_server(s1).unwrap();
        assert_eq!(server.spec().resolved.exe, "./b");
        assert_eq!(server.state, ServerState::Active);
        assert_eq!(server.pid, 42);
        assert_eq!(server.adapters().count(), 2);
        assert_eq!(reg.adapter("s1.A").unwrap().endpoint.as_deref(), Some("tcp -p 10000"));
        assert!(reg.adapter("s1.B").unwrap().endpoint.is_none());
        // The old adapter handle is gone, the id now points at the new one.
        assert!(!reg.is_live(a));

        let ids: Vec<&str> = reg.node("n1").unwrap().servers().map(|(k, _)| k).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2"]);
    }

    #[test]
    fn rebuild_with_new_id_replaces_entity() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        let s1 = reg.insert_server(node, server_build("s1", "./a", Vec::new())).unwrap();
        let s9 = reg
            .rebuild_server(s1, server_build("s9", "./a", Vec::new()))
            .unwrap();
        assert_ne!(s1, s9);
        assert!(!reg.is_live(s1));
        assert!(reg.server("n1", "s1").is_none());
        assert!(reg.server("n1", "s9").is_some());
    }

    #[test]
    fn rebuild_onto_existing_id_keeps_both_servers() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        let s1 = reg.insert_server(node, server_build("s1", "./a", Vec::new())).unwrap();
        let s2 = reg.insert_server(node, server_build("s2", "./b", Vec::new())).unwrap();

        let err = reg
            .rebuild_server(s1, server_build("s2", "./c", Vec::new()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateServer { .. }));
        assert!(reg.is_live(s1));
        assert_eq!(reg.find_server("n1", "s1"), Some(s1));
        assert_eq!(reg.find_server("n1", "s2"), Some(s2));
        assert_eq!(reg.server("n1", "s2").unwrap().spec().resolved.exe, "./b");
    }

    #[test]
    fn container_services_and_started_flags() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        let boxed = reg
            .insert_server(
                node,
                container_build(
                    "box",
                    vec![
                        service_build("Hello", vec![adapter("Hello", "box.Hello")]),
                        service_build("Other", Vec::new()),
                    ],
                ),
            )
            .unwrap();

        let hello = reg.find_service("n1", "box", "Hello").unwrap();
        reg.service_mut(hello).unwrap().started = true;
        assert_eq!(reg.path(hello).unwrap(), "n1/box/Hello");
        assert_eq!(reg.path(reg.find_adapter("box.Hello").unwrap()).unwrap(), "n1/box/Hello/Hello");

        reg.rebuild_server(
            boxed,
            container_build("box", vec![service_build("Hello", Vec::new()), service_build("Other", Vec::new())]),
        )
        .unwrap();
        assert!(reg.service("n1", "box", "Hello").unwrap().started);
        assert!(!reg.service("n1", "box", "Other").unwrap().started);
        assert!(reg.adapter("box.Hello").is_none());
    }

    #[test]
    fn removing_node_cascades() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        reg.insert_server(node, container_build("box", vec![service_build("Hello", vec![adapter("H", "h")])]))
            .unwrap();
        reg.insert_server(node, server_build("s1", "./a", vec![adapter("A", "a")])).unwrap();
        assert_eq!(reg.len(), 6);

        assert!(reg.remove_node(node));
        assert_eq!(reg.len(), 0);
        assert!(reg.node("n1").is_none());
        assert!(reg.adapter("h").is_none());
        assert!(!reg.remove_node(node));
    }

    #[test]
    fn events_are_recorded_and_drained() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        let s1 = reg
            .insert_server(node, server_build("s1", "./a", vec![adapter("A", "a")]))
            .unwrap();
        reg.mark_changed(s1);
        reg.remove_server(s1);

        let events = reg.drain_events();
        let summary: Vec<(Change, EntityKind, &str)> = events
            .iter()
            .map(|e| (e.change, e.kind, e.path.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (Change::Added, EntityKind::Node, "n1"),
                (Change::Added, EntityKind::Server, "n1/s1"),
                (Change::Added, EntityKind::Adapter, "n1/s1/A"),
                (Change::Changed, EntityKind::Server, "n1/s1"),
                (Change::Removed, EntityKind::Adapter, "n1/s1/A"),
                (Change::Removed, EntityKind::Server, "n1/s1"),
            ]
        );
        assert!(reg.drain_events().is_empty());
    }

    #[test]
    fn node_applications_and_application_servers() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        reg.set_node_application(
            node,
            "demo",
            NodeApplication {
                descriptor: NodeDescriptor::default(),
                resolver: Resolver::new(),
            },
        )
        .unwrap();
        reg.insert_server(node, server_build("s1", "./a", Vec::new())).unwrap();
        let mut other = server_build("s2", "./a", Vec::new());
        other.spec.application = "other".to_string();
        reg.insert_server(node, other).unwrap();

        assert!(reg.node("n1").unwrap().has_applications());
        assert_eq!(reg.application_servers(node, "demo").len(), 1);
        assert!(reg.remove_node_application(node, "demo").is_some());
        assert!(!reg.node("n1").unwrap().has_applications());
    }

    #[test]
    fn new_server_state_follows_node_and_reported_info() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        let s1 = reg.insert_server(node, server_build("s1", "./a", Vec::new())).unwrap();
        assert_eq!(reg.get_server(s1).unwrap().state, ServerState::Unknown);

        reg.node_mut(node).unwrap().up = true;
        reg.record_server_info(
            node,
            &ServerDynamicInfo {
                id: "s3".to_string(),
                state: ServerState::Active,
                pid: 7,
                enabled: false,
            },
        );
        reg.record_adapter_endpoint(node, "s3.A", Some("tcp -p 4061"));

        let s2 = reg.insert_server(node, server_build("s2", "./a", Vec::new())).unwrap();
        let s3 = reg
            .insert_server(node, server_build("s3", "./a", vec![adapter("A", "s3.A")]))
            .unwrap();
        assert_eq!(reg.get_server(s2).unwrap().state, ServerState::Inactive);
        let s3 = reg.get_server(s3).unwrap();
        assert_eq!((s3.state, s3.pid, s3.enabled), (ServerState::Active, 7, false));
        assert_eq!(reg.adapter("s3.A").unwrap().endpoint.as_deref(), Some("tcp -p 4061"));

        reg.clear_dynamic_info(node);
        reg.remove_server(reg.find_server("n1", "s3").unwrap());
        reg.insert_server(node, server_build("s3", "./a", vec![adapter("A", "s3.A")]))
            .unwrap();
        assert_eq!(reg.server("n1", "s3").unwrap().state, ServerState::Inactive);
        assert!(reg.adapter("s3.A").unwrap().endpoint.is_none());
    }

    #[test]
    fn prune_only_removes_idle_down_nodes() {
        let mut reg = Registry::new();
        let node = reg.insert_node("n1");
        reg.set_node_application(
            node,
            "demo",
            NodeApplication {
                descriptor: NodeDescriptor::default(),
                resolver: Resolver::new(),
            },
        )
        .unwrap();
        assert!(!reg.prune_node(node));

        reg.remove_node_application(node, "demo");
        reg.node_mut(node).unwrap().up = true;
        assert!(!reg.prune_node(node));

        reg.node_mut(node).unwrap().up = false;
        assert!(reg.prune_node(node));
        assert!(reg.node("n1").is_none());
    }

    #[test]
    fn registries_up_and_down() {
        let mut reg = Registry::new();
        reg.registry_up(RegistryInfo {
            name: "Master".to_string(),
            hostname: "h1".to_string(),
        });
        reg.registry_up(RegistryInfo {
            name: "Replica1".to_string(),
            hostname: "h2".to_string(),
        });
        assert_eq!(reg.registries().count(), 2);
        assert!(reg.registry_down("Replica1"));
        assert!(!reg.registry_down("Replica1"));
        assert_eq!(reg.registries().count(), 1);
    }
}
