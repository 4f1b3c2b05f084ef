//! Turns descriptors into registry builds.
//!
//! A [`BuildContext`] ties an application to one of its nodes and the
//! resolver for that node. Servers are built from plain descriptors or from
//! template instances; each build carries the resolver it was substituted
//! with, so it can be rebuilt later without going back to the parent scopes.

use std::collections::BTreeMap;

use tracing::trace;

use gridsync_core::{
    AdapterDescriptor, ApplicationDescriptor, DescriptorError, DescriptorResult, NodeDescriptor,
    NodeInfo, ParameterMap, PropertyDescriptor, PropertySetDescriptor, Resolver,
    ServerDescriptor, ServerInstanceDescriptor, ServiceInstanceDescriptor,
};
use gridsync_registry::{
    AdapterSpec, ResolvedServer, ServerBuild, ServerOrigin, ServerSpec, ServiceBuild, ServiceSpec,
};

/// Resolver for the servers `app` deploys on `node_name`.
pub fn node_resolver(
    app: &ApplicationDescriptor,
    node_name: &str,
    node: &NodeDescriptor,
    info: Option<&NodeInfo>,
) -> Resolver {
    Resolver::for_node(app, node_name, node, info)
}

pub struct BuildContext<'a> {
    app: &'a ApplicationDescriptor,
    node: &'a NodeDescriptor,
    resolver: &'a Resolver,
}

impl<'a> BuildContext<'a> {
    pub fn new(app: &'a ApplicationDescriptor, node: &'a NodeDescriptor, resolver: &'a Resolver) -> Self {
        Self {
            app,
            node,
            resolver,
        }
    }

    /// Every server the node descriptor declares, plain servers first.
    pub fn all_servers(&self) -> Vec<DescriptorResult<ServerBuild>> {
        self.node
            .servers
            .iter()
            .map(|s| self.plain_server(s))
            .chain(self.node.server_instances.iter().map(|i| self.server_instance(i)))
            .collect()
    }

    /// Rebuild a server from where it originally came from.
    pub fn rebuild(&self, origin: &ServerOrigin, descriptor: &ServerDescriptor) -> DescriptorResult<ServerBuild> {
        match origin {
            ServerOrigin::Plain => self.plain_server(descriptor),
            ServerOrigin::Instance(instance) => self.server_instance(instance),
        }
    }

    pub fn plain_server(&self, descriptor: &ServerDescriptor) -> DescriptorResult<ServerBuild> {
        self.build_server(
            ServerOrigin::Plain,
            descriptor.clone(),
            self.resolver.clone(),
            None,
            &BTreeMap::new(),
        )
    }

    pub fn server_instance(&self, instance: &ServerInstanceDescriptor) -> DescriptorResult<ServerBuild> {
        let template = self
            .app
            .server_templates
            .get(&instance.template)
            .ok_or_else(|| DescriptorError::UnknownServerTemplate(instance.template.clone()))?;
        check_parameters(
            &instance.template,
            &template.parameters,
            &instance.parameter_values,
            &template.parameter_defaults,
        )?;

        let resolver = self
            .resolver
            .child(&instance.parameter_values, &template.parameter_defaults);
        self.build_server(
            ServerOrigin::Instance(instance.clone()),
            template.descriptor.clone(),
            resolver,
            Some(&instance.property_set),
            &instance.service_property_sets,
        )
    }

    fn build_server(
        &self,
        origin: ServerOrigin,
        descriptor: ServerDescriptor,
        mut resolver: Resolver,
        instance_properties: Option<&PropertySetDescriptor>,
        service_properties: &BTreeMap<String, PropertySetDescriptor>,
    ) -> DescriptorResult<ServerBuild> {
        let id = resolver.substitute(&descriptor.id);
        resolver.put("server", &id);

        let mut properties = self.properties(&descriptor.property_set, &resolver)?;
        if let Some(set) = instance_properties {
            properties.extend(self.properties(set, &resolver)?);
        }

        let adapters = descriptor
            .adapters
            .iter()
            .map(|a| adapter(a, &resolver))
            .collect();

        let services = match &descriptor.services {
            Some(instances) => Some(
                instances
                    .iter()
                    .map(|s| self.service(s, &resolver, service_properties))
                    .collect::<DescriptorResult<Vec<_>>>()?,
            ),
            None => None,
        };

        let resolved = ResolvedServer {
            exe: resolver.substitute(&descriptor.exe),
            pwd: resolver.substitute(&descriptor.pwd),
            options: resolver.substitute_all(&descriptor.options),
            envs: resolver.substitute_all(&descriptor.envs),
            user: resolver.substitute(&descriptor.user),
            activation: descriptor.activation,
            activation_timeout: resolver.substitute_number(&descriptor.activation_timeout),
            deactivation_timeout: resolver.substitute_number(&descriptor.deactivation_timeout),
            properties,
        };
        trace!(server = %id, application = %self.app.name, "server built");

        Ok(ServerBuild {
            spec: ServerSpec {
                id,
                application: self.app.name.clone(),
                origin,
                descriptor,
                resolver,
                resolved,
            },
            adapters,
            services,
        })
    }

    fn service(
        &self,
        instance: &ServiceInstanceDescriptor,
        server_resolver: &Resolver,
        service_properties: &BTreeMap<String, PropertySetDescriptor>,
    ) -> DescriptorResult<ServiceBuild> {
        let (descriptor, mut resolver) = match &instance.descriptor {
            Some(descriptor) => (descriptor.clone(), server_resolver.clone()),
            None if instance.template.is_empty() => {
                return Err(DescriptorError::EmptyServiceInstance);
            }
            None => {
                let template = self
                    .app
                    .service_templates
                    .get(&instance.template)
                    .ok_or_else(|| DescriptorError::UnknownServiceTemplate(instance.template.clone()))?;
                check_parameters(
                    &instance.template,
                    &template.parameters,
                    &instance.parameter_values,
                    &template.parameter_defaults,
                )?;
                (
                    template.descriptor.clone(),
                    server_resolver.child(&instance.parameter_values, &template.parameter_defaults),
                )
            }
        };

        let name = resolver.substitute(&descriptor.name);
        resolver.put("service", &name);

        let mut properties = self.properties(&descriptor.property_set, &resolver)?;
        properties.extend(self.properties(&instance.property_set, &resolver)?);
        if let Some(set) = service_properties.get(&name) {
            properties.extend(self.properties(set, &resolver)?);
        }

        let adapters = descriptor
            .adapters
            .iter()
            .map(|a| adapter(a, &resolver))
            .collect();
        let entry = resolver.substitute(&descriptor.entry);

        Ok(ServiceBuild {
            spec: ServiceSpec {
                name,
                instance: instance.clone(),
                descriptor,
                resolver,
                entry,
                properties,
            },
            adapters,
        })
    }

    /// Flatten a property set: referenced sets first, in order, then the
    /// set's own properties.
    fn properties(&self, set: &PropertySetDescriptor, resolver: &Resolver) -> DescriptorResult<Vec<PropertyDescriptor>> {
        let mut out = Vec::new();
        let mut visiting = Vec::new();
        self.collect_properties(set, resolver, &mut visiting, &mut out)?;
        Ok(out)
    }

    fn collect_properties(
        &self,
        set: &PropertySetDescriptor,
        resolver: &Resolver,
        visiting: &mut Vec<String>,
        out: &mut Vec<PropertyDescriptor>,
    ) -> DescriptorResult<()> {
        for reference in &set.references {
            let name = resolver.substitute(reference);
            if visiting.contains(&name) {
                return Err(DescriptorError::PropertySetCycle(name));
            }
            let referenced = self
                .app
                .property_set(Some(self.node), &name)
                .ok_or_else(|| DescriptorError::UnknownPropertySet(name.clone()))?;
            visiting.push(name);
            self.collect_properties(referenced, resolver, visiting, out)?;
            visiting.pop();
        }
        out.extend(
            set.properties
                .iter()
                .map(|p| PropertyDescriptor::new(&resolver.substitute(&p.name), &resolver.substitute(&p.value))),
        );
        Ok(())
    }
}

fn adapter(descriptor: &AdapterDescriptor, resolver: &Resolver) -> AdapterSpec {
    AdapterSpec {
        name: resolver.substitute(&descriptor.name),
        id: resolver.substitute(&descriptor.id),
        replica_group_id: resolver.substitute(&descriptor.replica_group_id),
        descriptor: descriptor.clone(),
    }
}

/// Every declared parameter needs a value or a default.
fn check_parameters(
    template: &str,
    declared: &[String],
    values: &ParameterMap,
    defaults: &ParameterMap,
) -> DescriptorResult<()> {
    match declared
        .iter()
        .find(|p| !values.contains_key(*p) && !defaults.contains_key(*p))
    {
        Some(parameter) => Err(DescriptorError::MissingParameter {
            template: template.to_string(),
            parameter: parameter.clone(),
        }),
        None => Ok(()),
    }
}
