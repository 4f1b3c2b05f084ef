//! gridsync.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_EVENT_BUFFER: usize = 1024;
const DEFAULT_LOG_FILTER: &str = "info,gridsync=debug,gridsyncd=debug";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    pub sync: Option<SyncSection>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSection {
    /// Interval between load / runtime-property polls (e.g. "5s", "500ms").
    pub poll_interval: Option<String>,
    /// Capacity of the tree event broadcast channel.
    pub event_buffer: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        if let Some(interval) = config.sync.as_ref().and_then(|s| s.poll_interval.as_deref()) {
            match parse_duration(interval) {
                None => anyhow::bail!("invalid poll_interval `{interval}`"),
                Some(d) if d.is_zero() => anyhow::bail!("poll_interval must be positive"),
                Some(_) => {}
            }
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn poll_interval(&self) -> Duration {
        self.sync
            .as_ref()
            .and_then(|s| s.poll_interval.as_deref())
            .and_then(parse_duration)
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    pub fn event_buffer(&self) -> usize {
        self.sync
            .as_ref()
            .and_then(|s| s.event_buffer)
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_EVENT_BUFFER)
    }

    pub fn log_filter(&self) -> &str {
        self.logging
            .as_ref()
            .and_then(|l| l.filter.as_deref())
            .unwrap_or(DEFAULT_LOG_FILTER)
    }

    pub fn log_format(&self) -> LogFormat {
        self.logging
            .as_ref()
            .and_then(|l| l.format)
            .unwrap_or_default()
    }
}

/// Parse "500ms", "5s" or "2m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        None
    }
}
