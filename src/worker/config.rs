// Worker configuration for the SFU
//
// This module holds the worker tunables and their environment overrides.

use std::time::Duration;

use crate::{forwarder::DEFAULT_QUEUE_CAPACITY, media::codec::MAX_MTU, session::SessionConfig};

/// Default period of the empty-session sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Default reconnect gap hint
pub const DEFAULT_RECONNECT_GAP: Duration = Duration::from_secs(5);

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Period of the empty-session sweep
    pub sweep_interval: Duration,
    /// How long signaling should wait before re-creating a dropped
    /// connection; carried for callers, the core does not wait on it
    pub reconnect_gap: Duration,
    /// Per-packet tracing on the read and write paths
    pub debug: bool,
    /// Longest wait for one inbound packet before the read loop gives up
    pub read_deadline: Option<Duration>,
    /// Depth of every forwarder queue
    pub queue_capacity: usize,
    /// Size of the read buffer of inbound tracks
    pub receive_mtu: usize,
    /// Configuration of every session
    pub session: SessionConfig,
}

impl WorkerConfig {
    /// Defaults overridden by `SYNC_INTERVAL`, `REPEER_GAP_TIME`,
    /// `READ_DEADLINE` (all in seconds) and `DEBUG`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let seconds = |key: &str| {
            let value = lookup(key)?;
            match value.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
                _ => {
                    tracing::warn!(key, value = %value, "Ignoring invalid duration");
                    None
                }
            }
        };

        let mut config = Self::default();
        if let Some(interval) = seconds("SYNC_INTERVAL") {
            config.sweep_interval = interval;
        }
        if let Some(gap) = seconds("REPEER_GAP_TIME") {
            config.reconnect_gap = gap;
        }
        config.read_deadline = seconds("READ_DEADLINE");
        if let Some(debug) = lookup("DEBUG") {
            config.debug = matches!(debug.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        config.session.trace_packets = config.debug;
        config
    }
}

// Default implementation
impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            reconnect_gap: DEFAULT_RECONNECT_GAP,
            debug: false,
            read_deadline: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            receive_mtu: MAX_MTU,
            session: SessionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("SYNC_INTERVAL", "30"),
            ("REPEER_GAP_TIME", "oops"),
            ("READ_DEADLINE", "16"),
            ("DEBUG", "true"),
        ]
        .into_iter()
        .collect();
        let config = WorkerConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_gap, DEFAULT_RECONNECT_GAP);
        assert_eq!(config.read_deadline, Some(Duration::from_secs(16)));
        assert!(config.debug);
        assert!(config.session.trace_packets);
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup(|_| None);
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.read_deadline, None);
        assert_eq!(config.queue_capacity, 2048);
        assert_eq!(config.receive_mtu, 1460);
        assert!(!config.debug);
    }
}
