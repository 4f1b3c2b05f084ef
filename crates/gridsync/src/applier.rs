//! Differential update applier.
//!
//! Folds application added / removed / updated notifications into the
//! registry while touching as little of the tree as possible: servers are
//! matched by resolved id and rebuilt in place, so their handles and live
//! state survive descriptor changes.
//!
//! Nothing here fails outward. Build errors and consistency violations are
//! logged and the rest of the batch goes on.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info, warn};

use gridsync_core::{
    ApplicationDescriptor, ApplicationInfo, ApplicationUpdateInfo, NodeDescriptor, NodeInfo,
    NodeUpdateDescriptor, Resolver, UpdateDelta,
};
use gridsync_registry::{EntityId, NodeApplication, Registry, ServerBuild};

use crate::builder::{node_resolver, BuildContext};
use crate::error::{SyncError, SyncResult};

/// Replace every known application with `applications`.
pub fn application_init(registry: &mut Registry, applications: Vec<ApplicationInfo>) {
    let known: Vec<String> = registry
        .applications()
        .map(|a| a.descriptor.name.clone())
        .collect();
    for name in known {
        application_removed(registry, &name);
    }
    let count = applications.len();
    for info in applications {
        application_added(registry, info);
    }
    info!(applications = count, "applications initialized");
}

pub fn application_added(registry: &mut Registry, info: ApplicationInfo) {
    let name = info.descriptor.name.clone();
    if registry.application(&name).is_some() {
        warn!(application = %name, "application added twice, replacing it");
        application_removed(registry, &name);
    }

    let descriptor = info.descriptor.clone();
    registry.insert_application(info);
    for (node_name, node) in &descriptor.nodes {
        deploy(registry, &descriptor, node_name, node);
    }
    info!(application = %name, nodes = descriptor.nodes.len(), "application added");
}

pub fn application_removed(registry: &mut Registry, name: &str) {
    let Some(info) = registry.remove_application(name) else {
        debug!(application = %name, "removal of unknown application ignored");
        return;
    };
    for node_name in info.descriptor.nodes.keys() {
        undeploy(registry, node_name, name);
    }
    info!(application = %name, "application removed");
}

pub fn application_updated(registry: &mut Registry, update: ApplicationUpdateInfo) {
    let name = update.descriptor.name.clone();
    let node_infos: BTreeMap<String, NodeInfo> = update
        .descriptor
        .nodes
        .iter()
        .filter_map(|n| {
            let info = registry.node(&n.name)?.info.clone()?;
            Some((n.name.clone(), info))
        })
        .collect();
    let Some(app) = registry.application_mut(&name) else {
        warn!(application = %name, "update for unknown application ignored");
        return;
    };
    if update.revision != 0 && update.revision <= app.revision {
        debug!(
            application = %name,
            revision = update.revision,
            current = app.revision,
            "stale application update ignored"
        );
        return;
    }

    let delta = match app.descriptor.apply_update_with(&update.descriptor, &node_infos) {
        Ok(delta) => delta,
        Err(e) => {
            error!(application = %name, error = %e, "cannot apply application update");
            return;
        }
    };
    if update.revision != 0 {
        app.revision = update.revision;
    }
    app.update_time = update.update_time;
    app.update_user = update.update_user.clone();
    let descriptor = app.descriptor.clone();
    registry.mark_application_changed(&name);

    for node_name in &delta.removed_nodes {
        undeploy(registry, node_name, &name);
    }

    let mut updated = BTreeSet::new();
    for node_update in &update.descriptor.nodes {
        update_node(registry, &descriptor, &node_update.name, Some(node_update), &delta);
        updated.insert(node_update.name.as_str());
    }

    if delta.affects_dependents() {
        for node_name in descriptor.nodes.keys() {
            if !updated.contains(node_name.as_str()) {
                update_node(registry, &descriptor, node_name, None, &delta);
            }
        }
    }

    info!(
        application = %name,
        revision = update.revision,
        removed_nodes = delta.removed_nodes.len(),
        updated_nodes = delta.updated_nodes.len(),
        "application updated"
    );
}

/// Rebuild the servers of a node whose static info changed, so `${node.*}`
/// variables pick up the new values.
pub fn rebind_node_info(registry: &mut Registry, node: EntityId) {
    let Some(entity) = registry.get_node(node) else {
        return;
    };
    let node_name = entity.name().to_string();
    let info = entity.info.clone();
    let applications: Vec<String> = entity.application_names().map(str::to_string).collect();

    for application in applications {
        let Some(app) = registry.application(&application).map(|a| a.descriptor.clone()) else {
            error!(node = %node_name, %application, "node hosts an unknown application");
            continue;
        };
        let Some(node_descriptor) = app.nodes.get(&node_name) else {
            continue;
        };
        let resolver = node_resolver(&app, &node_name, node_descriptor, info.as_ref());
        bind(registry, node, &app.name, node_descriptor, &resolver);

        let ctx = BuildContext::new(&app, node_descriptor, &resolver);
        let servers = registry.application_servers(node, &app.name);
        rebuild_servers(registry, &ctx, servers);
    }
    debug!(node = %node_name, "node servers rebound to new node info");
}

// ── Per node ───────────────────────────────────────────────────────

/// Create the node if needed and build every server `app` puts on it.
fn deploy(
    registry: &mut Registry,
    app: &ApplicationDescriptor,
    node_name: &str,
    node_descriptor: &NodeDescriptor,
) {
    let node = registry.insert_node(node_name);
    let info = registry.get_node(node).and_then(|n| n.info.clone());
    let resolver = node_resolver(app, node_name, node_descriptor, info.as_ref());
    bind(registry, node, &app.name, node_descriptor, &resolver);

    let ctx = BuildContext::new(app, node_descriptor, &resolver);
    for build in ctx.all_servers() {
        let result = build
            .map_err(SyncError::from)
            .and_then(|b| upsert_server(registry, node, node_name, b));
        if let Err(e) = result {
            error!(node = %node_name, application = %app.name, error = %e, "cannot deploy server");
        }
    }
    registry.mark_changed(node);
}

/// Remove everything `application` put on `node_name`.
fn undeploy(registry: &mut Registry, node_name: &str, application: &str) {
    let Some(node) = registry.find_node(node_name) else {
        error!(node = %node_name, %application, "node of application not found");
        return;
    };
    for server in registry.application_servers(node, application) {
        registry.remove_server(server);
    }
    registry.remove_node_application(node, application);
    if !registry.prune_node(node) {
        registry.mark_changed(node);
    }
}

fn update_node(
    registry: &mut Registry,
    app: &ApplicationDescriptor,
    node_name: &str,
    update: Option<&NodeUpdateDescriptor>,
    delta: &UpdateDelta,
) {
    let Some(node_descriptor) = app.nodes.get(node_name) else {
        return;
    };
    let deployed = registry
        .node(node_name)
        .is_some_and(|n| n.application(&app.name).is_some());
    if !deployed {
        deploy(registry, app, node_name, node_descriptor);
        return;
    }
    let Some(node) = registry.find_node(node_name) else {
        return;
    };

    let info = registry.get_node(node).and_then(|n| n.info.clone());
    let resolver = node_resolver(app, node_name, node_descriptor, info.as_ref());
    bind(registry, node, &app.name, node_descriptor, &resolver);
    let ctx = BuildContext::new(app, node_descriptor, &resolver);

    let node_scope_changed =
        update.is_some_and(|u| u.changes_variables() || u.changes_property_sets());
    let mut fresh = BTreeSet::new();

    if let Some(update) = update {
        for server_id in &update.remove_servers {
            let Some(server) = registry.find_server(node_name, server_id) else {
                error!(node = %node_name, server = %server_id, "server to remove not found");
                continue;
            };
            match registry.get_server(server).map(|s| s.application().to_string()) {
                Some(owner) if owner == app.name => {
                    registry.remove_server(server);
                }
                Some(owner) => error!(
                    node = %node_name,
                    server = %server_id,
                    owner = %owner,
                    application = %app.name,
                    "server to remove belongs to another application"
                ),
                None => {}
            }
        }

        let builds = update
            .servers
            .iter()
            .map(|s| ctx.plain_server(s))
            .chain(update.server_instances.iter().map(|i| ctx.server_instance(i)));
        for build in builds {
            let result = build.map_err(SyncError::from).and_then(|b| {
                fresh.insert(b.spec.id.clone());
                upsert_server(registry, node, node_name, b)
            });
            if let Err(e) = result {
                error!(node = %node_name, application = %app.name, error = %e, "cannot update server");
            }
        }
    }

    let stale: Vec<EntityId> = registry
        .application_servers(node, &app.name)
        .into_iter()
        .filter(|id| {
            registry.get_server(*id).is_some_and(|s| {
                !fresh.contains(s.id())
                    && (node_scope_changed
                        || delta.affects_server(s.spec().origin.template(), &s.spec().descriptor))
            })
        })
        .collect();
    rebuild_servers(registry, &ctx, stale);
    registry.mark_changed(node);
}

fn bind(
    registry: &mut Registry,
    node: EntityId,
    application: &str,
    descriptor: &NodeDescriptor,
    resolver: &Resolver,
) {
    let value = NodeApplication {
        descriptor: descriptor.clone(),
        resolver: resolver.clone(),
    };
    if let Err(e) = registry.set_node_application(node, application, value) {
        error!(%node, %application, error = %e, "cannot record node application");
    }
}

// ── Per server ─────────────────────────────────────────────────────

fn upsert_server(
    registry: &mut Registry,
    node: EntityId,
    node_name: &str,
    build: ServerBuild,
) -> SyncResult<EntityId> {
    let Some(existing) = registry.find_server(node_name, &build.spec.id) else {
        return Ok(registry.insert_server(node, build)?);
    };
    if let Some(owner) = registry
        .get_server(existing)
        .map(|s| s.application())
        .filter(|owner| *owner != build.spec.application)
    {
        return Err(SyncError::ServerConflict {
            node: node_name.to_string(),
            server: build.spec.id,
            owner: owner.to_string(),
        });
    }
    Ok(registry.rebuild_server(existing, build)?)
}

/// Rebuild `servers` from their origin. A server that can no longer be
/// built is removed.
fn rebuild_servers(registry: &mut Registry, ctx: &BuildContext<'_>, servers: Vec<EntityId>) {
    for id in servers {
        let Some(server) = registry.get_server(id) else {
            continue;
        };
        let server_id = server.id().to_string();
        let build = ctx.rebuild(&server.spec().origin, &server.spec().descriptor);
        let result = build
            .map_err(SyncError::from)
            .and_then(|b| Ok(registry.rebuild_server(id, b)?));
        if let Err(e) = result {
            error!(server = %server_id, error = %e, "cannot rebuild server, removing it");
            registry.remove_server(id);
        }
    }
}
