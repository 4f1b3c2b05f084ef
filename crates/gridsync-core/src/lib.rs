//! gridsync-core — shared types for the deployment state synchronizer.
//!
//! - [`descriptor`]: static deployment descriptors (applications, nodes,
//!   servers, services, adapters, templates, property sets)
//! - [`update`]: incremental application updates and their net effect
//! - [`dynamic`]: live information pushed by observers
//! - [`resolver`]: `${variable}` substitution over layered scopes
//! - [`config`]: synchronizer configuration file

pub mod config;
pub mod descriptor;
pub mod dynamic;
pub mod error;
pub mod resolver;
pub mod update;

pub use config::{LogFormat, SyncConfig};
pub use descriptor::*;
pub use dynamic::*;
pub use error::{DescriptorError, DescriptorResult};
pub use resolver::{Resolver, ScopeKind, UnresolvedPolicy};
pub use update::*;
