//! Variable resolver — `${name}` substitution over layered scopes.
//!
//! A [`Resolver`] is a value: an own writable scope followed by a chain of
//! shared read-only scopes. Lookups walk the chain in order and return the
//! first binding found:
//!
//! ```text
//! own > instance parameters > template defaults > node > application > built-in
//! ```
//!
//! Building a child resolver for a template instance or rebuilding an entity
//! produces a new value; scopes already shared with other resolvers are never
//! mutated.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::descriptor::{ApplicationDescriptor, NodeDescriptor, ParameterMap, VariableMap};
use crate::dynamic::NodeInfo;

/// Where a scope's bindings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeKind {
    Parameters,
    TemplateDefaults,
    Node,
    Application,
    BuiltIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Scope {
    kind: ScopeKind,
    vars: VariableMap,
}

/// What to do with a `${name}` token that has no binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnresolvedPolicy {
    /// Leave the token in the output as written.
    #[default]
    Keep,
    /// Replace the token with the empty string.
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolver {
    own: VariableMap,
    scopes: Vec<Arc<Scope>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scope with lower precedence than every existing one.
    pub fn with_scope(mut self, kind: ScopeKind, vars: VariableMap) -> Self {
        if !vars.is_empty() {
            self.scopes.push(Arc::new(Scope { kind, vars }));
        }
        self
    }

    /// Resolver for the servers one application deploys on one node.
    pub fn for_node(
        app: &ApplicationDescriptor,
        node_name: &str,
        node: &NodeDescriptor,
        info: Option<&NodeInfo>,
    ) -> Self {
        Self::new()
            .with_scope(ScopeKind::Node, node.variables.clone())
            .with_scope(ScopeKind::Application, app.variables.clone())
            .with_scope(ScopeKind::BuiltIn, built_ins(&app.name, node_name, info))
    }

    /// Child resolver for a template instance.
    ///
    /// Parameter values and defaults are substituted with `self` before
    /// being bound, so they may refer to node or application variables.
    pub fn child(&self, parameters: &ParameterMap, defaults: &ParameterMap) -> Self {
        let bind = |map: &ParameterMap| -> VariableMap {
            map.iter()
                .map(|(k, v)| (k.clone(), self.substitute(v)))
                .collect()
        };

        let mut scopes = Vec::with_capacity(self.scopes.len() + 2);
        if !parameters.is_empty() {
            scopes.push(Arc::new(Scope {
                kind: ScopeKind::Parameters,
                vars: bind(parameters),
            }));
        }
        if !defaults.is_empty() {
            scopes.push(Arc::new(Scope {
                kind: ScopeKind::TemplateDefaults,
                vars: bind(defaults),
            }));
        }
        scopes.extend(self.scopes.iter().cloned());

        Self {
            own: self.own.clone(),
            scopes,
        }
    }

    /// Raw binding for `name`, without substitution.
    pub fn find(&self, name: &str) -> Option<&str> {
        if let Some(v) = self.own.get(name) {
            return Some(v.as_str());
        }
        self.scopes
            .iter()
            .find_map(|scope| scope.vars.get(name))
            .map(String::as_str)
    }

    /// The kind of scope that currently binds `name`. `None` for the own
    /// scope or no binding at all.
    pub fn binding_scope(&self, name: &str) -> Option<ScopeKind> {
        if self.own.contains_key(name) {
            return None;
        }
        self.scopes
            .iter()
            .find(|scope| scope.vars.contains_key(name))
            .map(|scope| scope.kind)
    }

    /// Bind `name` in the own scope. Returns whether the effective value
    /// changed.
    pub fn put(&mut self, name: &str, value: &str) -> bool {
        let changed = self.find(name) != Some(value);
        self.own.insert(name.to_string(), value.to_string());
        changed
    }

    pub fn substitute(&self, text: &str) -> String {
        self.substitute_with(text, UnresolvedPolicy::Keep)
    }

    pub fn substitute_with(&self, text: &str, policy: UnresolvedPolicy) -> String {
        let mut stack = Vec::new();
        self.expand(text, policy, &mut stack)
    }

    /// Resolve a list-valued field element by element.
    pub fn substitute_all(&self, values: &[String]) -> Vec<String> {
        values.iter().map(|v| self.substitute(v)).collect()
    }

    /// Resolve a numeric field. Empty or unparsable results give `None`.
    pub fn substitute_number<T: FromStr>(&self, text: &str) -> Option<T> {
        let value = self.substitute_with(text, UnresolvedPolicy::Empty);
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        value.parse().ok()
    }

    /// All effective bindings, raw, with precedence applied.
    pub fn effective_variables(&self) -> VariableMap {
        let mut out = VariableMap::new();
        for scope in self.scopes.iter().rev() {
            for (k, v) in &scope.vars {
                out.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &self.own {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    fn expand(&self, text: &str, policy: UnresolvedPolicy, stack: &mut Vec<String>) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(pos) = rest.find("${") {
            let (before, token) = rest.split_at(pos);
            let Some(end) = token.find('}') else {
                break;
            };

            if let Some(literal) = before.strip_suffix('$') {
                // `$${name}` is an escaped token.
                out.push_str(literal);
                out.push_str(&token[..=end]);
            } else {
                out.push_str(before);
                let name = &token[2..end];
                match self.lookup(name, policy, stack) {
                    Some(value) => out.push_str(&value),
                    None if policy == UnresolvedPolicy::Keep => out.push_str(&token[..=end]),
                    None => {}
                }
            }
            rest = &token[end + 1..];
        }

        out.push_str(rest);
        out
    }

    fn lookup(&self, name: &str, policy: UnresolvedPolicy, stack: &mut Vec<String>) -> Option<String> {
        if stack.iter().any(|n| n == name) {
            debug!(variable = %name, "recursive variable definition left unexpanded");
            return None;
        }
        let raw = self.find(name)?;
        stack.push(name.to_string());
        let value = self.expand(raw, policy, stack);
        stack.pop();
        Some(value)
    }
}

/// Synthetic variables describing the application and node.
pub fn built_ins(application: &str, node: &str, info: Option<&NodeInfo>) -> VariableMap {
    let mut vars = VariableMap::new();
    vars.insert("application".to_string(), application.to_string());
    vars.insert("node".to_string(), node.to_string());
    if let Some(info) = info {
        vars.insert("node.os".to_string(), info.os.clone());
        vars.insert("node.hostname".to_string(), info.hostname.clone());
        vars.insert("node.release".to_string(), info.release.clone());
        vars.insert("node.version".to_string(), info.version.clone());
        vars.insert("node.machine".to_string(), info.machine.clone());
        vars.insert("node.datadir".to_string(), info.data_dir.clone());
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> VariableMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn layered() -> Resolver {
        let mut app = ApplicationDescriptor::new("demo");
        app.variables = vars(&[("key", "X"), ("app-only", "A")]);
        let node = NodeDescriptor {
            variables: vars(&[("key", "N"), ("node-only", "${app-only}-n")]),
            ..Default::default()
        };
        Resolver::for_node(&app, "n1", &node, None)
    }

    #[test]
    fn instance_beats_node_beats_application() {
        let node_level = layered();
        assert_eq!(node_level.substitute("${key}"), "N");

        let instance = node_level.child(&vars(&[("key", "I")]), &ParameterMap::new());
        assert_eq!(instance.substitute("${key}"), "I");
        assert_eq!(instance.binding_scope("key"), Some(ScopeKind::Parameters));
    }

    #[test]
    fn parameter_beats_template_default() {
        let r = layered().child(&vars(&[("port", "10000")]), &vars(&[("port", "0"), ("host", "localhost")]));
        assert_eq!(r.substitute("${host}:${port}"), "localhost:10000");
        assert_eq!(r.binding_scope("host"), Some(ScopeKind::TemplateDefaults));
    }

    #[test]
    fn built_ins_have_lowest_precedence() {
        let mut app = ApplicationDescriptor::new("demo");
        app.variables = vars(&[("node", "shadowed")]);
        let r = Resolver::for_node(&app, "n1", &NodeDescriptor::default(), None);
        assert_eq!(r.substitute("${node}/${application}"), "shadowed/demo");
    }

    #[test]
    fn node_info_built_ins() {
        let info = NodeInfo {
            name: "n1".to_string(),
            hostname: "host-a".to_string(),
            os: "Linux".to_string(),
            ..Default::default()
        };
        let app = ApplicationDescriptor::new("demo");
        let r = Resolver::for_node(&app, "n1", &NodeDescriptor::default(), Some(&info));
        assert_eq!(r.substitute("${node.hostname} (${node.os})"), "host-a (Linux)");
    }

    #[test]
    fn unresolved_tokens_pass_through() {
        let r = layered();
        assert_eq!(r.substitute("a-${missing}-b"), "a-${missing}-b");
        assert_eq!(r.substitute_with("a-${missing}-b", UnresolvedPolicy::Empty), "a--b");
        assert_eq!(r.substitute("open ${key"), "open ${key");
    }

    #[test]
    fn escaped_token_is_literal() {
        let r = layered();
        assert_eq!(r.substitute("$${key} is ${key}"), "${key} is N");
    }

    #[test]
    fn values_are_expanded_recursively() {
        let r = layered();
        assert_eq!(r.substitute("${node-only}"), "A-n");
    }

    #[test]
    fn recursive_definition_stops() {
        let r = Resolver::new().with_scope(ScopeKind::Application, vars(&[("a", "${b}"), ("b", "x${a}")]));
        assert_eq!(r.substitute("${a}"), "x${a}");
    }

    #[test]
    fn put_reports_effective_change() {
        let mut r = layered();
        assert!(!r.put("key", "N"));
        assert!(r.put("key", "own"));
        assert_eq!(r.find("key"), Some("own"));
        assert!(r.put("fresh", "1"));
        assert!(!r.put("fresh", "1"));
    }

    #[test]
    fn child_parameters_see_parent() {
        let mut parent = layered();
        parent.put("server", "s1");
        let child = parent.child(&vars(&[("endpoint", "${server}-${key}")]), &ParameterMap::new());
        assert_eq!(child.substitute("${endpoint}"), "s1-N");
        // The own scope is inherited.
        assert_eq!(child.find("server"), Some("s1"));
    }

    #[test]
    fn put_does_not_leak_into_clones() {
        let base = layered();
        let mut copy = base.clone();
        copy.put("key", "changed");
        assert_eq!(base.substitute("${key}"), "N");
    }

    #[test]
    fn list_and_numeric_fields() {
        let r = Resolver::new().with_scope(ScopeKind::Node, vars(&[("t", "30"), ("flag", "--verbose")]));
        assert_eq!(
            r.substitute_all(&["${flag}".to_string(), "-x".to_string()]),
            vec!["--verbose", "-x"]
        );
        assert_eq!(r.substitute_number::<u32>("${t}"), Some(30));
        assert_eq!(r.substitute_number::<u32>("${unset}"), None);
        assert_eq!(r.substitute_number::<u32>("abc"), None);
    }

    #[test]
    fn effective_variables_apply_precedence() {
        let r = layered().child(&vars(&[("key", "I")]), &ParameterMap::new());
        let all = r.effective_variables();
        assert_eq!(all["key"], "I");
        assert_eq!(all["app-only"], "A");
        assert_eq!(all["application"], "demo");
    }
}
