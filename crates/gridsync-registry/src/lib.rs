//! gridsync-registry — the entity registry of the deployment synchronizer.
//!
//! Holds the live tree of registries, applications, nodes, servers,
//! services and adapters.
//!
//! # Architecture
//!
//! ```text
//! Registry
//!   ├── registries      name → RegistryInfo
//!   ├── applications    name → ApplicationInfo
//!   ├── arena           EntityId → Node | Server | Service | Adapter
//!   │   └── Node ── servers (BTreeMap by id)
//!   │        └── Server ── adapters, services (BTreeMap by name)
//!   │             └── Service ── adapters
//!   ├── adapter index   adapter id → EntityId
//!   └── event log       TreeEvent (added / removed / changed)
//! ```
//!
//! Handles are generational: a handle captured before an entity was removed
//! never resolves to whatever reuses its slot, which makes
//! [`Registry::is_live`] the single staleness check for deferred work.

pub mod error;
pub mod events;
pub mod registry;
pub mod snapshot;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use events::{Change, TreeEvent};
pub use registry::Registry;
pub use snapshot::*;
pub use types::*;
