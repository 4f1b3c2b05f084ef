//! Periodic polling of node load and server runtime properties.
//!
//! Each tick the poller asks the worker which entities are worth polling,
//! fires one request per target concurrently and posts each response back
//! as an [`ObservationEvent`]. Responses carry the handle they were issued
//! for; the worker drops those whose target went away in the meantime.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gridsync_core::LoadInfo;
use gridsync_registry::{EntityId, Registry};

use crate::error::SyncResult;
use crate::event::ObservationEvent;
use crate::remote::RemoteError;
use crate::worker::SyncHandle;

/// Remote administrative requests the poller needs.
pub trait AdminSession: Send + Sync + 'static {
    fn node_load(&self, node: &str) -> impl Future<Output = Result<LoadInfo, RemoteError>> + Send;

    fn server_properties(
        &self,
        node: &str,
        server: &str,
    ) -> impl Future<Output = Result<BTreeMap<String, String>, RemoteError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollRequest {
    NodeLoad { node: String },
    ServerProperties { node: String, server: String },
}

/// One outstanding request and the entity it is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTicket {
    pub target: EntityId,
    pub request: PollRequest,
}

/// Up nodes and active servers on up nodes.
pub fn poll_tickets(registry: &Registry) -> Vec<PollTicket> {
    let mut tickets = Vec::new();
    for (node_id, node) in registry.nodes().filter(|(_, n)| n.up) {
        tickets.push(PollTicket {
            target: node_id,
            request: PollRequest::NodeLoad {
                node: node.name().to_string(),
            },
        });
        for (server_id, server) in node
            .servers()
            .filter_map(|(_, id)| registry.get_server(id).map(|s| (id, s)))
            .filter(|(_, s)| s.state.is_active())
        {
            tickets.push(PollTicket {
                target: server_id,
                request: PollRequest::ServerProperties {
                    node: node.name().to_string(),
                    server: server.id().to_string(),
                },
            });
        }
    }
    tickets
}

/// Run the request of `ticket` and wrap the response.
pub async fn execute<S: AdminSession>(session: &S, ticket: PollTicket) -> ObservationEvent {
    let PollTicket { target, request } = ticket;
    match request {
        PollRequest::NodeLoad { node } => ObservationEvent::NodeLoadReported {
            target,
            result: session.node_load(&node).await,
        },
        PollRequest::ServerProperties { node, server } => ObservationEvent::ServerPropertiesReported {
            target,
            result: session.server_properties(&node, &server).await,
        },
    }
}

pub struct Poller<S> {
    sync: SyncHandle,
    session: Arc<S>,
    interval: Duration,
}

/// A running poller.
pub struct PollerHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl PollerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "poller task failed");
        }
    }
}

/// Lower bound on the poll period; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

impl<S: AdminSession> Poller<S> {
    pub fn new(sync: SyncHandle, session: Arc<S>, interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            warn!(
                interval_ms = interval.as_millis() as u64,
                min_ms = MIN_INTERVAL.as_millis() as u64,
                "poll interval too small, clamped"
            );
        }
        Self {
            sync,
            session,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Issue one round of requests. Returns how many were issued.
    pub async fn poll_once(&self) -> SyncResult<usize> {
        let tickets = self
            .sync
            .inspect(|sync| poll_tickets(sync.registry()))
            .await?;
        let count = tickets.len();
        for ticket in tickets {
            let session = Arc::clone(&self.session);
            let sync = self.sync.clone();
            tokio::spawn(async move {
                let event = execute(session.as_ref(), ticket).await;
                if sync.observe(event).is_err() {
                    debug!("synchronizer gone, poll response dropped");
                }
            });
        }
        Ok(count)
    }

    pub fn spawn(self) -> PollerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });
        info!(interval_ms = interval.as_millis() as u64, "poller started");
        PollerHandle {
            handle,
            shutdown_tx,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(count) => debug!(requests = count, "poll round issued"),
                        Err(e) => {
                            debug!(error = %e, "synchronizer gone, poller stopping");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("poller shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use gridsync_core::{
        ApplicationDescriptor, ApplicationInfo, NodeDescriptor, NodeDynamicInfo, NodeInfo,
        ServerDescriptor, ServerDynamicInfo, ServerState, SyncConfig,
    };

    use crate::worker::spawn;

    #[derive(Default)]
    struct FakeSession {
        calls: Mutex<Vec<String>>,
    }

    impl AdminSession for FakeSession {
        async fn node_load(&self, node: &str) -> Result<LoadInfo, RemoteError> {
            self.calls.lock().unwrap().push(format!("load {node}"));
            if node == "n2" {
                return Err(RemoteError::ConnectionRefused(node.to_string()));
            }
            Ok(LoadInfo {
                avg1: 1.0,
                avg5: 0.5,
                avg15: 0.25,
            })
        }

        async fn server_properties(
            &self,
            node: &str,
            server: &str,
        ) -> Result<BTreeMap<String, String>, RemoteError> {
            self.calls.lock().unwrap().push(format!("props {node}/{server}"));
            Ok([("Ice.ProgramName".to_string(), server.to_string())].into())
        }
    }

    fn events() -> Vec<ObservationEvent> {
        let mut app = ApplicationDescriptor::new("demo");
        app.nodes.insert(
            "n1".into(),
            NodeDescriptor {
                servers: vec![
                    ServerDescriptor {
                        id: "s1".into(),
                        ..Default::default()
                    },
                    ServerDescriptor {
                        id: "s2".into(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
        );
        let node = |name: &str| NodeDynamicInfo {
            info: NodeInfo {
                name: name.into(),
                ..Default::default()
            },
            ..Default::default()
        };
        vec![
            ObservationEvent::ApplicationAdded {
                serial: 1,
                info: ApplicationInfo {
                    descriptor: app,
                    ..Default::default()
                },
            },
            ObservationEvent::NodeUp { info: node("n1") },
            ObservationEvent::NodeUp { info: node("n2") },
            ObservationEvent::ServerUpdated {
                node: "n1".into(),
                info: ServerDynamicInfo {
                    id: "s1".into(),
                    state: ServerState::Active,
                    pid: 10,
                    enabled: true,
                },
            },
        ]
    }

    #[tokio::test]
    async fn tickets_cover_up_nodes_and_active_servers() {
        let (handle, _join) = spawn(&SyncConfig::default());
        for event in events() {
            handle.observe(event).unwrap();
        }
        let tickets = handle
            .inspect(|sync| poll_tickets(sync.registry()))
            .await
            .unwrap();
        let requests: Vec<PollRequest> = tickets.into_iter().map(|t| t.request).collect();
        assert_eq!(
            requests,
            vec![
                PollRequest::NodeLoad { node: "n1".into() },
                PollRequest::ServerProperties {
                    node: "n1".into(),
                    server: "s1".into()
                },
                PollRequest::NodeLoad { node: "n2".into() },
            ]
        );
    }

    #[tokio::test]
    async fn poll_round_updates_the_tree() {
        let (handle, _join) = spawn(&SyncConfig::default());
        for event in events() {
            handle.observe(event).unwrap();
        }
        let session = Arc::new(FakeSession::default());
        let poller = Poller::new(handle.clone(), Arc::clone(&session), Duration::from_secs(60));
        assert_eq!(poller.poll_once().await.unwrap(), 3);

        // Responses come back through the queue; wait until all three landed.
        let mut snapshot = handle.snapshot().await.unwrap();
        for _ in 0..100 {
            let n1 = snapshot.node("n1").unwrap();
            if n1.load.is_some() && handle.inspect(|s| s.stats().applied).await.unwrap() >= 7 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            snapshot = handle.snapshot().await.unwrap();
        }

        assert_eq!(snapshot.node("n1").unwrap().load.map(|l| l.avg1), Some(1.0));
        let (status, props) = handle
            .inspect(|sync| {
                let reg = sync.registry();
                (
                    reg.node("n2").and_then(|n| n.status.clone()),
                    reg.server("n1", "s1").and_then(|s| s.runtime_properties.clone()),
                )
            })
            .await
            .unwrap();
        assert!(status.unwrap().contains("connection refused"));
        assert_eq!(props.unwrap()["Ice.ProgramName"], "s1");
        assert_eq!(session.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn zero_interval_is_clamped() {
        let (handle, _join) = spawn(&SyncConfig::default());
        let poller = Poller::new(handle, Arc::new(FakeSession::default()), Duration::ZERO);
        assert_eq!(poller.interval, MIN_INTERVAL);
        let running = poller.spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!running.handle.is_finished());
        running.stop().await;
    }

    #[tokio::test]
    async fn spawned_poller_stops_on_request() {
        let (handle, _join) = spawn(&SyncConfig::default());
        let poller = Poller::new(handle, Arc::new(FakeSession::default()), Duration::from_millis(5));
        let running = poller.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        running.stop().await;
    }
}
