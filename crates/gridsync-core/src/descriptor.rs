//! Deployment descriptors.
//!
//! Descriptors are the static, declarative side of a deployment: what an
//! application deploys on which node, and how each server, service and
//! adapter is configured. String fields may contain `${variable}` tokens
//! that are expanded by a [`Resolver`](crate::resolver::Resolver) when the
//! live tree is built.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Variable bindings keyed by variable name.
pub type VariableMap = BTreeMap<String, String>;

/// Template parameter values (or defaults) keyed by parameter name.
pub type ParameterMap = BTreeMap<String, String>;

// ── Properties ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub value: String,
}

impl PropertyDescriptor {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// A set of properties, optionally pulling in named property sets.
///
/// References are looked up in the node's property sets first, then in the
/// application's. Referenced properties come before the set's own, so the
/// set's own properties win when names collide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertySetDescriptor {
    pub references: Vec<String>,
    pub properties: Vec<PropertyDescriptor>,
}

impl PropertySetDescriptor {
    pub fn is_empty(&self) -> bool {
        self.references.is_empty() && self.properties.is_empty()
    }
}

// ── Adapters ───────────────────────────────────────────────────────

/// An object adapter: a communication endpoint owned by a server or service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterDescriptor {
    pub name: String,
    pub description: String,
    /// Adapter id. Empty means the adapter is not published to the registry.
    pub id: String,
    pub replica_group_id: String,
    pub priority: String,
    pub server_lifetime: bool,
    pub register_process: bool,
}

// ── Services ───────────────────────────────────────────────────────

/// A service hosted inside a container server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Entry point loaded by the container.
    pub entry: String,
    pub adapters: Vec<AdapterDescriptor>,
    pub property_set: PropertySetDescriptor,
    pub description: String,
}

/// A service as deployed inside a container server: either an instance of a
/// service template or an inline descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInstanceDescriptor {
    /// Service template name. Empty when `descriptor` is set.
    pub template: String,
    pub parameter_values: ParameterMap,
    pub descriptor: Option<ServiceDescriptor>,
    pub property_set: PropertySetDescriptor,
}

impl ServiceInstanceDescriptor {
    pub fn uses_template(&self) -> bool {
        self.descriptor.is_none() && !self.template.is_empty()
    }
}

// ── Servers ────────────────────────────────────────────────────────

/// How a server process is started by its node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationMode {
    #[default]
    Manual,
    Always,
    OnDemand,
    Session,
}

/// A managed server process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerDescriptor {
    pub id: String,
    pub exe: String,
    pub pwd: String,
    pub options: Vec<String>,
    pub envs: Vec<String>,
    pub activation: ActivationMode,
    /// Seconds, after substitution. Kept as text so it can be parameterized.
    pub activation_timeout: String,
    pub deactivation_timeout: String,
    pub user: String,
    pub allocatable: bool,
    pub adapters: Vec<AdapterDescriptor>,
    pub property_set: PropertySetDescriptor,
    pub description: String,
    /// `Some` for container servers hosting services.
    pub services: Option<Vec<ServiceInstanceDescriptor>>,
}

impl ServerDescriptor {
    pub fn is_container(&self) -> bool {
        self.services.is_some()
    }

    /// Service template names referenced by this server's services.
    pub fn service_templates(&self) -> impl Iterator<Item = &str> {
        self.services
            .iter()
            .flatten()
            .filter(|s| s.uses_template())
            .map(|s| s.template.as_str())
    }
}

/// A parameterized descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateDescriptor<T> {
    pub descriptor: T,
    /// Declared parameter names. Each must get a value from the instance or
    /// from `parameter_defaults`.
    pub parameters: Vec<String>,
    pub parameter_defaults: ParameterMap,
}

pub type ServerTemplate = TemplateDescriptor<ServerDescriptor>;
pub type ServiceTemplate = TemplateDescriptor<ServiceDescriptor>;

/// A server deployed from a server template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInstanceDescriptor {
    pub template: String,
    pub parameter_values: ParameterMap,
    pub property_set: PropertySetDescriptor,
    /// Extra properties for services of a container template, by service name.
    pub service_property_sets: BTreeMap<String, PropertySetDescriptor>,
}

// ── Nodes & applications ───────────────────────────────────────────

/// What one application deploys on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDescriptor {
    pub variables: VariableMap,
    pub server_instances: Vec<ServerInstanceDescriptor>,
    pub servers: Vec<ServerDescriptor>,
    pub load_factor: String,
    pub description: String,
    pub property_sets: BTreeMap<String, PropertySetDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaGroupDescriptor {
    pub id: String,
    pub load_balancing: String,
    pub proxy_options: String,
    pub description: String,
    pub filter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationDescriptor {
    pub name: String,
    pub variables: VariableMap,
    pub replica_groups: Vec<ReplicaGroupDescriptor>,
    pub description: String,
    pub server_templates: BTreeMap<String, ServerTemplate>,
    pub service_templates: BTreeMap<String, ServiceTemplate>,
    pub nodes: BTreeMap<String, NodeDescriptor>,
    pub property_sets: BTreeMap<String, PropertySetDescriptor>,
}

/// An application as known by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationInfo {
    pub uuid: String,
    pub create_time: u64,
    pub create_user: String,
    pub update_time: u64,
    pub update_user: String,
    pub revision: u64,
    pub descriptor: ApplicationDescriptor,
}

impl ApplicationDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Look up a property set visible from `node`: node sets shadow
    /// application sets.
    pub fn property_set<'a>(
        &'a self,
        node: Option<&'a NodeDescriptor>,
        name: &str,
    ) -> Option<&'a PropertySetDescriptor> {
        node.and_then(|n| n.property_sets.get(name))
            .or_else(|| self.property_sets.get(name))
    }
}
