//! Dynamic state merger.
//!
//! Applies what nodes and registries report (node up/down, server state,
//! adapter endpoints, started services, poll results) to the tree built by
//! the applier. Notifications are authoritative: states are never derived
//! locally, and a notification about an entity the tree does not know is a
//! no-op.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use gridsync_core::{
    AdapterDynamicInfo, LoadInfo, NodeDynamicInfo, RegistryInfo, ServerDynamicInfo, ServerState,
};
use gridsync_registry::{EntityId, Registry};

use crate::remote::{FailureClass, RemoteError};

// ── Registries ─────────────────────────────────────────────────────

pub fn registry_up(registry: &mut Registry, info: RegistryInfo) {
    info!(registry = %info.name, hostname = %info.hostname, "registry up");
    registry.registry_up(info);
}

pub fn registry_down(registry: &mut Registry, name: &str) {
    if registry.registry_down(name) {
        info!(registry = %name, "registry down");
    } else {
        debug!(registry = %name, "down notification for unknown registry");
    }
}

// ── Nodes ──────────────────────────────────────────────────────────

/// Mark a node up with everything it reported. Returns true if its static
/// info differs from what was known, in which case its servers need a
/// rebind.
pub fn node_up(registry: &mut Registry, dynamic: NodeDynamicInfo) -> bool {
    let name = dynamic.info.name.clone();
    let node = registry.insert_node(&name);
    let Some(entity) = registry.node_mut(node) else {
        return false;
    };
    let info_changed = entity.info.as_ref() != Some(&dynamic.info);
    entity.up = true;
    entity.info = Some(dynamic.info.clone());
    entity.status = None;
    entity.last_error = None;
    registry.reset_dynamic_info(node, &dynamic.servers, &dynamic.adapters);

    let servers: HashMap<&str, &ServerDynamicInfo> =
        dynamic.servers.iter().map(|s| (s.id.as_str(), s)).collect();
    for server in registry.servers_of(node) {
        let reported = registry
            .get_server(server)
            .and_then(|s| servers.get(s.id()).copied());
        match reported {
            Some(info) => apply_server_info(registry, server, info.state, info.pid, info.enabled),
            None => {
                let enabled = registry.get_server(server).is_some_and(|s| s.enabled);
                apply_server_info(registry, server, ServerState::Inactive, 0, enabled);
            }
        }
    }

    let endpoints: HashMap<&str, Option<&str>> = dynamic
        .adapters
        .iter()
        .map(|a| (a.id.as_str(), a.proxy.as_deref()))
        .collect();
    for server in registry.servers_of(node) {
        for adapter in registry.server_adapters(server) {
            let endpoint = registry
                .get_adapter(adapter)
                .and_then(|a| endpoints.get(a.adapter_id()).copied().flatten())
                .map(str::to_string);
            set_endpoint(registry, adapter, endpoint);
        }
    }

    registry.mark_changed(node);
    info!(
        node = %name,
        servers = dynamic.servers.len(),
        adapters = dynamic.adapters.len(),
        "node up"
    );
    info_changed
}

/// Mark a node down. Its servers become `Unknown`; the node itself goes
/// away if no application deploys on it.
pub fn node_down(registry: &mut Registry, name: &str) {
    let Some(node) = registry.find_node(name) else {
        debug!(node = %name, "down notification for unknown node");
        return;
    };
    if let Some(entity) = registry.node_mut(node) {
        entity.up = false;
        entity.info = None;
        entity.load = None;
        entity.status = None;
    }
    registry.clear_dynamic_info(node);

    for server in registry.servers_of(node) {
        let enabled = registry.get_server(server).is_some_and(|s| s.enabled);
        apply_server_info(registry, server, ServerState::Unknown, 0, enabled);
        for adapter in registry.server_adapters(server) {
            set_endpoint(registry, adapter, None);
        }
    }

    if registry.prune_node(node) {
        info!(node = %name, "node down, removed");
    } else {
        registry.mark_changed(node);
        info!(node = %name, "node down");
    }
}

// ── Servers, adapters, services ────────────────────────────────────

pub fn server_updated(registry: &mut Registry, node_name: &str, info: &ServerDynamicInfo) {
    let Some(node) = registry.find_node(node_name) else {
        debug!(node = %node_name, server = %info.id, "server update for unknown node ignored");
        return;
    };
    registry.record_server_info(node, info);
    match registry.find_server(node_name, &info.id) {
        Some(server) => apply_server_info(registry, server, info.state, info.pid, info.enabled),
        None => debug!(node = %node_name, server = %info.id, "server update for unknown server ignored"),
    }
}

pub fn adapter_updated(registry: &mut Registry, node_name: &str, info: &AdapterDynamicInfo) {
    let Some(node) = registry.find_node(node_name) else {
        debug!(node = %node_name, adapter = %info.id, "adapter update for unknown node ignored");
        return;
    };
    registry.record_adapter_endpoint(node, &info.id, info.proxy.as_deref());
    match registry.find_adapter(&info.id) {
        Some(adapter) if registry.node_of(adapter) == Some(node) => {
            set_endpoint(registry, adapter, info.proxy.clone())
        }
        Some(_) => debug!(
            node = %node_name,
            adapter = %info.id,
            "adapter update from another node ignored"
        ),
        None => debug!(node = %node_name, adapter = %info.id, "adapter update for unknown adapter ignored"),
    }
}

/// Set the started flag of the named services of a container server.
pub fn services_changed(
    registry: &mut Registry,
    node_name: &str,
    server_id: &str,
    services: &[String],
    started: bool,
) {
    if registry.find_server(node_name, server_id).is_none() {
        debug!(node = %node_name, server = %server_id, "service update for unknown server ignored");
        return;
    }
    for name in services {
        let Some(service) = registry.find_service(node_name, server_id, name) else {
            debug!(server = %server_id, service = %name, "unknown service ignored");
            continue;
        };
        if let Some(entity) = registry.service_mut(service) {
            if entity.started != started {
                entity.started = started;
                registry.mark_changed(service);
            }
        }
    }
}

// ── Poll results ───────────────────────────────────────────────────

/// Apply a load poll. Returns false when the node is gone or down, in which
/// case the result is discarded.
pub fn load_reported(
    registry: &mut Registry,
    target: EntityId,
    result: Result<LoadInfo, RemoteError>,
) -> bool {
    let Some(node) = registry.node_mut(target).filter(|n| n.up) else {
        debug!(%target, "stale load report discarded");
        return false;
    };
    let name = node.name().to_string();
    match result {
        Ok(load) => {
            node.load = Some(load);
            node.status = None;
        }
        Err(e) => match e.classify() {
            FailureClass::Unavailable => {
                info!(node = %name, error = %e, "node unreachable");
                node.status = Some(format!("unreachable: {e}"));
            }
            FailureClass::Failed => {
                warn!(node = %name, error = %e, "load request failed");
                node.last_error = Some(e.to_string());
            }
        },
    }
    registry.mark_changed(target);
    true
}

/// Apply a runtime properties poll. Returns false when the server is gone
/// or no longer active.
pub fn properties_reported(
    registry: &mut Registry,
    target: EntityId,
    result: Result<BTreeMap<String, String>, RemoteError>,
) -> bool {
    let Some(server) = registry.server_mut(target).filter(|s| s.state.is_active()) else {
        debug!(%target, "stale properties report discarded");
        return false;
    };
    let id = server.id().to_string();
    match result {
        Ok(properties) => {
            server.runtime_properties = Some(properties);
            server.status = None;
        }
        Err(e) => match e.classify() {
            FailureClass::Unavailable => {
                info!(server = %id, error = %e, "server unreachable");
                server.status = Some(format!("unreachable: {e}"));
            }
            FailureClass::Failed => {
                warn!(server = %id, error = %e, "properties request failed");
                server.last_error = Some(e.to_string());
            }
        },
    }
    registry.mark_changed(target);
    true
}

// ── Helpers ────────────────────────────────────────────────────────

fn apply_server_info(
    registry: &mut Registry,
    id: EntityId,
    state: ServerState,
    pid: u32,
    enabled: bool,
) {
    let Some(server) = registry.server_mut(id) else {
        return;
    };
    if !state.follows(server.state) {
        debug!(server = %server.id(), from = %server.state, to = %state, "unusual server state transition");
    }
    let changed = server.state != state || server.pid != pid || server.enabled != enabled;
    server.state = state;
    server.pid = pid;
    server.enabled = enabled;
    if !state.is_active() {
        server.runtime_properties = None;
    }
    if changed {
        registry.mark_changed(id);
    }
    if !state.is_active() {
        stop_services(registry, id);
    }
}

fn stop_services(registry: &mut Registry, server: EntityId) {
    let services: Vec<EntityId> = registry
        .get_server(server)
        .map(|s| s.services().map(|(_, id)| id).collect())
        .unwrap_or_default();
    for service in services {
        if let Some(entity) = registry.service_mut(service) {
            if entity.started {
                entity.started = false;
                registry.mark_changed(service);
            }
        }
    }
}

fn set_endpoint(registry: &mut Registry, adapter: EntityId, endpoint: Option<String>) {
    let Some(entity) = registry.adapter_mut(adapter) else {
        return;
    };
    if entity.endpoint != endpoint {
        entity.endpoint = endpoint;
        registry.mark_changed(adapter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsync_core::{
        AdapterDescriptor, ApplicationDescriptor, ApplicationInfo, NodeDescriptor, NodeInfo,
        ServerDescriptor, ServiceDescriptor, ServiceInstanceDescriptor,
    };

    use crate::applier::{application_added, application_removed};

    fn deployed() -> Registry {
        let mut app = ApplicationDescriptor::new("demo");
        app.nodes.insert(
            "n1".into(),
            NodeDescriptor {
                servers: vec![
                    ServerDescriptor {
                        id: "s1".into(),
                        adapters: vec![AdapterDescriptor {
                            name: "A".into(),
                            id: "s1.A".into(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                    ServerDescriptor {
                        id: "box".into(),
                        services: Some(vec![ServiceInstanceDescriptor {
                            descriptor: Some(ServiceDescriptor {
                                name: "Hello".into(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
        );
        let mut reg = Registry::new();
        application_added(
            &mut reg,
            ApplicationInfo {
                descriptor: app,
                ..Default::default()
            },
        );
        reg
    }

    fn node(name: &str) -> NodeDynamicInfo {
        NodeDynamicInfo {
            info: NodeInfo {
                name: name.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn state(id: &str, state: ServerState) -> ServerDynamicInfo {
        ServerDynamicInfo {
            id: id.into(),
            state,
            pid: 0,
            enabled: true,
        }
    }

    #[test]
    fn node_up_applies_reported_state() {
        let mut reg = deployed();
        let mut info = node("n1");
        info.servers.push(ServerDynamicInfo {
            id: "s1".into(),
            state: ServerState::Active,
            pid: 99,
            enabled: true,
        });
        info.adapters.push(AdapterDynamicInfo {
            id: "s1.A".into(),
            proxy: Some("tcp -p 5000".into()),
        });
        assert!(node_up(&mut reg, info));

        assert!(reg.node("n1").unwrap().up);
        let s1 = reg.server("n1", "s1").unwrap();
        assert_eq!((s1.state, s1.pid), (ServerState::Active, 99));
        assert_eq!(reg.server("n1", "box").unwrap().state, ServerState::Inactive);
        assert_eq!(reg.adapter("s1.A").unwrap().endpoint.as_deref(), Some("tcp -p 5000"));
    }

    #[test]
    fn node_up_twice_with_same_info_needs_no_rebind() {
        let mut reg = deployed();
        assert!(node_up(&mut reg, node("n1")));
        assert!(!node_up(&mut reg, node("n1")));
    }

    #[test]
    fn adapter_update_from_another_node_is_ignored() {
        let mut reg = deployed();
        node_up(&mut reg, node("n1"));
        node_up(&mut reg, node("n2"));
        reg.drain_events();
        let before = reg.snapshot();

        adapter_updated(
            &mut reg,
            "n2",
            &AdapterDynamicInfo {
                id: "s1.A".into(),
                proxy: Some("tcp -h n2 -p 1".into()),
            },
        );

        assert!(reg.adapter("s1.A").unwrap().endpoint.is_none());
        assert_eq!(reg.snapshot(), before);
        assert!(reg.drain_events().is_empty());
    }

    #[test]
    fn node_down_sets_unknown_and_clears_endpoints() {
        let mut reg = deployed();
        node_up(&mut reg, node("n1"));
        server_updated(&mut reg, "n1", &state("s1", ServerState::Active));
        adapter_updated(
            &mut reg,
            "n1",
            &AdapterDynamicInfo {
                id: "s1.A".into(),
                proxy: Some("tcp".into()),
            },
        );

        node_down(&mut reg, "n1");
        let node = reg.node("n1").unwrap();
        assert!(!node.up);
        assert!(node.info.is_none());
        assert_eq!(reg.server("n1", "s1").unwrap().state, ServerState::Unknown);
        assert!(reg.adapter("s1.A").unwrap().endpoint.is_none());
    }

    #[test]
    fn node_down_prunes_idle_node() {
        let mut reg = Registry::new();
        node_up(&mut reg, node("n9"));
        assert!(reg.node("n9").is_some());
        node_down(&mut reg, "n9");
        assert!(reg.node("n9").is_none());
    }

    #[test]
    fn leaving_active_stops_services() {
        let mut reg = deployed();
        node_up(&mut reg, node("n1"));
        server_updated(&mut reg, "n1", &state("box", ServerState::Active));
        services_changed(&mut reg, "n1", "box", &["Hello".to_string(), "Ghost".to_string()], true);
        assert!(reg.service("n1", "box", "Hello").unwrap().started);

        server_updated(&mut reg, "n1", &state("box", ServerState::Deactivating));
        assert!(!reg.service("n1", "box", "Hello").unwrap().started);
    }

    #[test]
    fn unknown_server_notification_is_a_no_op() {
        let mut reg = deployed();
        node_up(&mut reg, node("n1"));
        let before = reg.snapshot();
        let size = reg.len();
        reg.drain_events();

        server_updated(&mut reg, "n1", &state("ghost", ServerState::Active));
        server_updated(&mut reg, "n7", &state("s1", ServerState::Active));
        services_changed(&mut reg, "n1", "ghost", &["Hello".to_string()], true);

        assert_eq!(reg.snapshot(), before);
        assert_eq!(reg.len(), size);
        assert!(reg.drain_events().is_empty());
    }

    #[test]
    fn early_server_state_is_kept_for_later_deploys() {
        let mut reg = Registry::new();
        node_up(&mut reg, node("n1"));
        server_updated(&mut reg, "n1", &state("s1", ServerState::Active));
        assert!(reg.server("n1", "s1").is_none());

        let mut app = ApplicationDescriptor::new("demo");
        app.nodes.insert(
            "n1".into(),
            NodeDescriptor {
                servers: vec![ServerDescriptor {
                    id: "s1".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        application_added(
            &mut reg,
            ApplicationInfo {
                descriptor: app,
                ..Default::default()
            },
        );
        assert_eq!(reg.server("n1", "s1").unwrap().state, ServerState::Active);
    }

    #[test]
    fn stale_adapter_update_after_removal() {
        let mut reg = deployed();
        node_up(&mut reg, node("n1"));
        server_updated(&mut reg, "n1", &state("s1", ServerState::Active));
        application_removed(&mut reg, "demo");
        node_down(&mut reg, "n1");
        assert!(reg.node("n1").is_none());

        let size = reg.len();
        adapter_updated(
            &mut reg,
            "n1",
            &AdapterDynamicInfo {
                id: "s1.A".into(),
                proxy: Some("tcp".into()),
            },
        );
        assert_eq!(reg.len(), size);
        assert!(reg.adapter("s1.A").is_none());
    }

    #[test]
    fn load_results_by_failure_class() {
        let mut reg = deployed();
        node_up(&mut reg, node("n1"));
        let n1 = reg.find_node("n1").unwrap();

        let load = LoadInfo {
            avg1: 0.5,
            avg5: 0.25,
            avg15: 0.1,
        };
        assert!(load_reported(&mut reg, n1, Ok(load)));
        assert_eq!(reg.node("n1").unwrap().load, Some(load));

        assert!(load_reported(&mut reg, n1, Err(RemoteError::ConnectionRefused("n1".into()))));
        let node = reg.node("n1").unwrap();
        assert!(node.status.as_deref().unwrap().starts_with("unreachable"));
        assert!(node.last_error.is_none());
        assert_eq!(node.load, Some(load));

        assert!(load_reported(&mut reg, n1, Err(RemoteError::Other("boom".into()))));
        assert_eq!(reg.node("n1").unwrap().last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn results_for_gone_targets_are_discarded() {
        let mut reg = deployed();
        node_up(&mut reg, node("n1"));
        server_updated(&mut reg, "n1", &state("s1", ServerState::Active));
        let s1 = reg.find_server("n1", "s1").unwrap();

        assert!(properties_reported(&mut reg, s1, Ok([("Ice.Trace".to_string(), "1".to_string())].into())));
        assert!(reg.server("n1", "s1").unwrap().runtime_properties.is_some());

        application_removed(&mut reg, "demo");
        assert!(!properties_reported(&mut reg, s1, Ok(BTreeMap::new())));

        let n1 = reg.find_node("n1").unwrap();
        node_down(&mut reg, "n1");
        assert!(!load_reported(&mut reg, n1, Ok(LoadInfo::default())));
    }
}
