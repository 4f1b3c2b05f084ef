//! Incremental application updates.
//!
//! An [`ApplicationUpdateDescriptor`] lists what changed in an application:
//! removals by name, replacements and additions. [`ApplicationDescriptor::apply_update`]
//! folds it into a descriptor and reports an [`UpdateDelta`] telling the
//! synchronizer which dependents must be rebuilt.
//!
//! Servers are matched by their resolved id, never by descriptor equality.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::descriptor::*;
use crate::dynamic::NodeInfo;
use crate::error::{DescriptorError, DescriptorResult};
use crate::resolver::Resolver;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeUpdateDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub variables: VariableMap,
    pub remove_variables: Vec<String>,
    pub property_sets: BTreeMap<String, PropertySetDescriptor>,
    pub remove_property_sets: Vec<String>,
    pub server_instances: Vec<ServerInstanceDescriptor>,
    pub servers: Vec<ServerDescriptor>,
    pub remove_servers: Vec<String>,
    pub load_factor: Option<String>,
}

impl NodeUpdateDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn changes_variables(&self) -> bool {
        !self.variables.is_empty() || !self.remove_variables.is_empty()
    }

    pub fn changes_property_sets(&self) -> bool {
        !self.property_sets.is_empty() || !self.remove_property_sets.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationUpdateDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub variables: VariableMap,
    pub remove_variables: Vec<String>,
    pub property_sets: BTreeMap<String, PropertySetDescriptor>,
    pub remove_property_sets: Vec<String>,
    pub replica_groups: Vec<ReplicaGroupDescriptor>,
    pub remove_replica_groups: Vec<String>,
    pub server_templates: BTreeMap<String, ServerTemplate>,
    pub remove_server_templates: Vec<String>,
    pub service_templates: BTreeMap<String, ServiceTemplate>,
    pub remove_service_templates: Vec<String>,
    pub nodes: Vec<NodeUpdateDescriptor>,
    pub remove_nodes: Vec<String>,
}

impl ApplicationUpdateDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationUpdateInfo {
    pub update_time: u64,
    pub update_user: String,
    pub revision: u64,
    pub descriptor: ApplicationUpdateDescriptor,
}

/// What an update changed, as far as dependents are concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateDelta {
    pub variables_changed: bool,
    pub property_sets_changed: bool,
    /// Server templates added, replaced or removed.
    pub server_templates: BTreeSet<String>,
    /// Service templates added, replaced or removed.
    pub service_templates: BTreeSet<String>,
    pub removed_nodes: Vec<String>,
    pub updated_nodes: Vec<String>,
}

impl UpdateDelta {
    /// Whether servers untouched by their node update may still need a
    /// rebuild.
    pub fn affects_dependents(&self) -> bool {
        self.variables_changed
            || self.property_sets_changed
            || !self.server_templates.is_empty()
            || !self.service_templates.is_empty()
    }

    /// Whether a server built from `server` (through `template`, when it is
    /// a template instance) depends on something this update changed.
    pub fn affects_server(&self, template: Option<&str>, server: &ServerDescriptor) -> bool {
        if self.variables_changed || self.property_sets_changed {
            return true;
        }
        if template.is_some_and(|t| self.server_templates.contains(t)) {
            return true;
        }
        server
            .service_templates()
            .any(|t| self.service_templates.contains(t))
    }
}

impl ApplicationDescriptor {
    /// Resolved id of a server deployed from a template, or `None` if the
    /// template is unknown.
    pub fn instance_server_id(
        &self,
        node_resolver: &Resolver,
        instance: &ServerInstanceDescriptor,
    ) -> Option<String> {
        let template = self.server_templates.get(&instance.template)?;
        let resolver = node_resolver.child(&instance.parameter_values, &template.parameter_defaults);
        Some(resolver.substitute(&template.descriptor.id))
    }

    /// Fold `update` into this descriptor.
    pub fn apply_update(&mut self, update: &ApplicationUpdateDescriptor) -> DescriptorResult<UpdateDelta> {
        self.apply_update_with(update, &BTreeMap::new())
    }

    /// Like [`apply_update`](Self::apply_update), resolving server ids with
    /// the static info of the nodes that are up, so ids built from
    /// `${node.*}` match the deployed servers.
    pub fn apply_update_with(
        &mut self,
        update: &ApplicationUpdateDescriptor,
        node_infos: &BTreeMap<String, NodeInfo>,
    ) -> DescriptorResult<UpdateDelta> {
        if update.name != self.name {
            return Err(DescriptorError::NameMismatch {
                application: self.name.clone(),
                update: update.name.clone(),
            });
        }

        let mut delta = UpdateDelta::default();

        if let Some(description) = &update.description {
            self.description = description.clone();
        }

        let before = self.variables.clone();
        for name in &update.remove_variables {
            self.variables.remove(name);
        }
        self.variables
            .extend(update.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        delta.variables_changed = before != self.variables;

        let before = self.property_sets.clone();
        for name in &update.remove_property_sets {
            self.property_sets.remove(name);
        }
        self.property_sets
            .extend(update.property_sets.iter().map(|(k, v)| (k.clone(), v.clone())));
        delta.property_sets_changed = before != self.property_sets;

        self.replica_groups
            .retain(|g| !update.remove_replica_groups.contains(&g.id));
        for group in &update.replica_groups {
            match self.replica_groups.iter_mut().find(|g| g.id == group.id) {
                Some(existing) => *existing = group.clone(),
                None => self.replica_groups.push(group.clone()),
            }
        }

        for name in &update.remove_server_templates {
            if self.server_templates.remove(name).is_some() {
                delta.server_templates.insert(name.clone());
            }
        }
        for (name, template) in &update.server_templates {
            self.server_templates.insert(name.clone(), template.clone());
            delta.server_templates.insert(name.clone());
        }

        for name in &update.remove_service_templates {
            if self.service_templates.remove(name).is_some() {
                delta.service_templates.insert(name.clone());
            }
        }
        for (name, template) in &update.service_templates {
            self.service_templates.insert(name.clone(), template.clone());
            delta.service_templates.insert(name.clone());
        }

        for name in &update.remove_nodes {
            if self.nodes.remove(name).is_some() {
                delta.removed_nodes.push(name.clone());
            }
        }

        for node_update in &update.nodes {
            let mut node = self.nodes.remove(&node_update.name).unwrap_or_default();
            self.apply_node_update(&mut node, node_update, node_infos.get(&node_update.name));
            self.nodes.insert(node_update.name.clone(), node);
            delta.updated_nodes.push(node_update.name.clone());
        }

        Ok(delta)
    }

    fn apply_node_update(
        &self,
        node: &mut NodeDescriptor,
        update: &NodeUpdateDescriptor,
        info: Option<&NodeInfo>,
    ) {
        if let Some(description) = &update.description {
            node.description = description.clone();
        }
        if let Some(load_factor) = &update.load_factor {
            node.load_factor = load_factor.clone();
        }

        for name in &update.remove_variables {
            node.variables.remove(name);
        }
        node.variables
            .extend(update.variables.iter().map(|(k, v)| (k.clone(), v.clone())));

        for name in &update.remove_property_sets {
            node.property_sets.remove(name);
        }
        node.property_sets
            .extend(update.property_sets.iter().map(|(k, v)| (k.clone(), v.clone())));

        let resolver = Resolver::for_node(self, &update.name, node, info);
        let plain_id = |s: &ServerDescriptor| resolver.substitute(&s.id);
        let instance_id = |i: &ServerInstanceDescriptor| self.instance_server_id(&resolver, i);

        // Removals and replacements both drop the current entry with that id.
        let mut dropped: BTreeSet<String> = update.remove_servers.iter().cloned().collect();
        dropped.extend(update.servers.iter().map(plain_id));
        dropped.extend(update.server_instances.iter().filter_map(instance_id));

        node.servers.retain(|s| !dropped.contains(&plain_id(s)));
        node.server_instances
            .retain(|i| instance_id(i).is_none_or(|id| !dropped.contains(&id)));

        node.servers.extend(update.servers.iter().cloned());
        node.server_instances
            .extend(update.server_instances.iter().cloned());
    }
}
