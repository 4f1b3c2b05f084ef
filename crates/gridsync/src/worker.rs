//! Synchronizer worker.
//!
//! One task owns the [`Registry`] and applies [`ObservationEvent`]s in the
//! order they were queued. Everything else talks to it through a
//! [`SyncHandle`]: observer callbacks push events, readers run closures on
//! the owner task, and listeners subscribe to the resulting tree events.
//!
//! ```text
//!   observers ──observe()──┐
//!   pollers ───observe()───┤ mpsc (unbounded, FIFO)
//!   readers ───inspect()───┘
//!                          ▼
//!                    run_worker ── Synchronizer::apply ──▶ Registry
//!                          │
//!                          └── broadcast<TreeEvent> ──▶ subscribe()
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use gridsync_core::{NodeDynamicInfo, SyncConfig};
use gridsync_registry::{Registry, Snapshot, TreeEvent};

use crate::applier;
use crate::error::{SyncError, SyncResult};
use crate::event::ObservationEvent;
use crate::merger;

/// Drops registry observer events that arrive out of sequence.
///
/// Serial 0 means "unsequenced" and is always accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialGate {
    last: u64,
}

impl SerialGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `serial` if it is newer than the last accepted one.
    pub fn accept(&mut self, serial: u64) -> bool {
        if serial == 0 {
            return true;
        }
        if serial <= self.last {
            return false;
        }
        self.last = serial;
        true
    }

    /// Start a new sequence (the observer re-initialized).
    pub fn reset(&mut self, serial: u64) {
        self.last = serial;
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Events applied.
    pub applied: u64,
    /// Events or poll results dropped as stale.
    pub stale: u64,
}

/// The registry together with the bookkeeping needed to apply events.
#[derive(Debug, Default)]
pub struct Synchronizer {
    registry: Registry,
    gate: SerialGate,
    stats: SyncStats,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn into_registry(self) -> Registry {
        self.registry
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Apply one event and return the tree events it produced.
    ///
    /// Never fails: stale events are dropped and inconsistencies are logged
    /// by the applier and merger.
    pub fn apply(&mut self, event: ObservationEvent) -> Vec<TreeEvent> {
        debug!(event = event.name(), "applying observation");
        let applied = self.dispatch(event);
        if applied {
            self.stats.applied += 1;
        } else {
            self.stats.stale += 1;
        }
        self.registry.drain_events()
    }

    fn dispatch(&mut self, event: ObservationEvent) -> bool {
        let registry = &mut self.registry;
        match event {
            ObservationEvent::RegistryInit { registries } => {
                let known: Vec<String> = registry.registries().map(|r| r.name.clone()).collect();
                for name in known {
                    if !registries.iter().any(|r| r.name == name) {
                        merger::registry_down(registry, &name);
                    }
                }
                for info in registries {
                    merger::registry_up(registry, info);
                }
            }
            ObservationEvent::RegistryUp { info } => merger::registry_up(registry, info),
            ObservationEvent::RegistryDown { name } => merger::registry_down(registry, &name),

            ObservationEvent::ApplicationInit { serial, applications } => {
                self.gate.reset(serial);
                applier::application_init(registry, applications);
            }
            ObservationEvent::ApplicationAdded { serial, info } => {
                if !self.gate.accept(serial) {
                    debug!(serial, last = self.gate.last(), "out of sequence application event dropped");
                    return false;
                }
                applier::application_added(registry, info);
            }
            ObservationEvent::ApplicationRemoved { serial, name } => {
                if !self.gate.accept(serial) {
                    debug!(serial, last = self.gate.last(), "out of sequence application event dropped");
                    return false;
                }
                applier::application_removed(registry, &name);
            }
            ObservationEvent::ApplicationUpdated { serial, info } => {
                if !self.gate.accept(serial) {
                    debug!(serial, last = self.gate.last(), "out of sequence application event dropped");
                    return false;
                }
                applier::application_updated(registry, info);
            }

            ObservationEvent::NodeInit { nodes } => {
                let known: Vec<String> = registry
                    .nodes()
                    .filter(|(_, n)| n.up)
                    .map(|(_, n)| n.name().to_string())
                    .collect();
                for name in known {
                    if !nodes.iter().any(|n| n.info.name == name) {
                        merger::node_down(registry, &name);
                    }
                }
                for info in nodes {
                    node_up(registry, info);
                }
            }
            ObservationEvent::NodeUp { info } => node_up(registry, info),
            ObservationEvent::NodeDown { name } => merger::node_down(registry, &name),
            ObservationEvent::ServerUpdated { node, info } => {
                merger::server_updated(registry, &node, &info)
            }
            ObservationEvent::AdapterUpdated { node, info } => {
                merger::adapter_updated(registry, &node, &info)
            }
            ObservationEvent::ServicesStarted {
                node,
                server,
                services,
            } => merger::services_changed(registry, &node, &server, &services, true),
            ObservationEvent::ServicesStopped {
                node,
                server,
                services,
            } => merger::services_changed(registry, &node, &server, &services, false),

            ObservationEvent::NodeLoadReported { target, result } => {
                return merger::load_reported(registry, target, result);
            }
            ObservationEvent::ServerPropertiesReported { target, result } => {
                return merger::properties_reported(registry, target, result);
            }
        }
        true
    }
}

/// Mark a node up, rebinding its servers when its static info changed.
fn node_up(registry: &mut Registry, info: NodeDynamicInfo) {
    let name = info.info.name.clone();
    if merger::node_up(registry, info) {
        if let Some(node) = registry.find_node(&name) {
            applier::rebind_node_info(registry, node);
        }
    }
}

// ── Owner task ─────────────────────────────────────────────────────

type InspectFn = Box<dyn FnOnce(&Synchronizer) + Send>;

enum Message {
    Observe(ObservationEvent),
    Inspect(InspectFn),
}

/// Cloneable handle to a running synchronizer.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<TreeEvent>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SyncHandle {
    /// Queue an event. Does not wait; usable from any thread.
    pub fn observe(&self, event: ObservationEvent) -> SyncResult<()> {
        self.tx
            .send(Message::Observe(event))
            .map_err(|_| SyncError::Closed)
    }

    /// Run `f` on the owner task, after every event queued before it.
    pub async fn inspect<R, F>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce(&Synchronizer) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: InspectFn = Box::new(move |sync| {
            let _ = reply_tx.send(f(sync));
        });
        self.tx
            .send(Message::Inspect(job))
            .map_err(|_| SyncError::Closed)?;
        reply_rx.await.map_err(|_| SyncError::Closed)
    }

    pub async fn snapshot(&self) -> SyncResult<Snapshot> {
        self.inspect(|sync| sync.registry().snapshot()).await
    }

    /// Tree events produced from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    /// Ask the worker to stop once the events already queued are applied.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Start a worker with an empty registry.
pub fn spawn(config: &SyncConfig) -> (SyncHandle, JoinHandle<Registry>) {
    spawn_with(Synchronizer::new(), config)
}

pub fn spawn_with(sync: Synchronizer, config: &SyncConfig) -> (SyncHandle, JoinHandle<Registry>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(config.event_buffer());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task_events = events.clone();
    let handle = tokio::spawn(async move {
        let sync = run_worker(sync, rx, task_events, shutdown_rx).await;
        sync.into_registry()
    });

    info!(event_buffer = config.event_buffer(), "synchronizer started");
    (
        SyncHandle {
            tx,
            events,
            shutdown_tx: Arc::new(shutdown_tx),
        },
        handle,
    )
}

async fn run_worker(
    mut sync: Synchronizer,
    mut rx: mpsc::UnboundedReceiver<Message>,
    events: broadcast::Sender<TreeEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Synchronizer {
    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => handle_message(&mut sync, message, &events),
                None => break,
            },
            _ = shutdown.changed() => {
                debug!("synchronizer draining queue");
                rx.close();
                while let Some(message) = rx.recv().await {
                    handle_message(&mut sync, message, &events);
                }
                break;
            }
        }
    }

    let stats = sync.stats();
    info!(applied = stats.applied, stale = stats.stale, "synchronizer stopped");
    sync
}

fn handle_message(
    sync: &mut Synchronizer,
    message: Message,
    events: &broadcast::Sender<TreeEvent>,
) {
    match message {
        Message::Observe(event) => {
            for tree_event in sync.apply(event) {
                // No subscriber is fine.
                let _ = events.send(tree_event);
            }
        }
        Message::Inspect(job) => job(sync),
    }
}
