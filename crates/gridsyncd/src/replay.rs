//! Replaying recorded observation streams.
//!
//! One JSON [`ObservationEvent`] per line. Blank lines and lines starting
//! with `#` are skipped. A line that does not parse is reported with its
//! 1-based line number and the rest of the stream still applies.

use std::io::BufRead;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use gridsync::{spawn, ObservationEvent, SyncStats};
use gridsync_core::SyncConfig;
use gridsync_registry::Snapshot;

/// A line that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Malformed {
    pub line: usize,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub snapshot: Snapshot,
    pub stats: SyncStats,
    /// Tree events observed while replaying.
    pub tree_events: u64,
    pub malformed: Vec<Malformed>,
}

/// Split a stream into events and malformed lines.
///
/// Only I/O failures are errors.
pub fn parse_events<R: BufRead>(
    reader: R,
) -> anyhow::Result<(Vec<ObservationEvent>, Vec<Malformed>)> {
    let mut events = Vec::new();
    let mut malformed = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match serde_json::from_str(trimmed) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(line = index + 1, error = %e, "malformed event skipped");
                malformed.push(Malformed {
                    line: index + 1,
                    error: e.to_string(),
                });
            }
        }
    }
    Ok((events, malformed))
}

/// Run every event of `reader` through a fresh synchronizer.
pub async fn replay<R: BufRead>(reader: R, config: &SyncConfig) -> anyhow::Result<ReplayReport> {
    let (events, malformed) = parse_events(reader)?;
    info!(events = events.len(), malformed = malformed.len(), "replaying");

    let (handle, join) = spawn(config);
    let mut tree = handle.subscribe();
    let logger = tokio::spawn(async move {
        let mut seen = 0u64;
        loop {
            match tree.recv().await {
                Ok(event) => {
                    seen += 1;
                    debug!(change = ?event.change, kind = ?event.kind, path = %event.path, "tree changed");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "tree event log lagging");
                    seen += skipped;
                }
                Err(RecvError::Closed) => break,
            }
        }
        seen
    });

    for event in events {
        handle.observe(event)?;
    }
    let stats = handle.inspect(|sync| sync.stats()).await?;
    handle.shutdown();
    drop(handle);

    let registry = join.await?;
    let tree_events = logger.await?;
    info!(
        applied = stats.applied,
        stale = stats.stale,
        tree_events,
        "replay finished"
    );

    Ok(ReplayReport {
        snapshot: registry.snapshot(),
        stats,
        tree_events,
        malformed,
    })
}
