//! gridsync — keeps a live deployment tree in sync with a grid registry.
//!
//! Observers report application changes (as differential updates) and
//! node / server / adapter state. Both streams are funneled through one
//! worker task that owns the [`Registry`](gridsync_registry::Registry), so
//! the tree is only ever touched from one place.
//!
//! # Architecture
//!
//! ```text
//! application observer ─┐                          ┌─ applier (descriptors)
//! node observer ────────┼─▶ SyncHandle ─▶ worker ──┤
//! registry observer ────┤   (mpsc FIFO)            └─ merger (dynamic state)
//! Poller ───────────────┘                                 │
//!   ▲  AdminSession::{node_load, server_properties}        ▼
//!   └──────────── poll_tickets(registry) ◀──────── Registry ──▶ TreeEvents
//! ```
//!
//! # Staleness
//!
//! Entities are addressed by generational [`EntityId`](gridsync_registry::EntityId)s.
//! A poll response or any other deferred work checks its handle with
//! `Registry::is_live` (implicitly, through the typed accessors) before it
//! touches anything. Application observer events carry serials checked by a
//! [`SerialGate`], and updates carry revisions checked by the applier.

pub mod applier;
pub mod builder;
pub mod error;
pub mod event;
pub mod merger;
pub mod poller;
pub mod remote;
pub mod worker;

pub use builder::BuildContext;
pub use error::{SyncError, SyncResult};
pub use event::ObservationEvent;
pub use poller::{AdminSession, PollRequest, PollTicket, Poller, PollerHandle};
pub use remote::{FailureClass, RemoteError};
pub use worker::{spawn, spawn_with, SerialGate, SyncHandle, SyncStats, Synchronizer};
