// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Broker tunables.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration.
//!
//! ```
//! use camerabroker::config::BrokerConfig;
//!
//! let cfg = BrokerConfig::from_json_str(r#"{ "max_cost": 200 }"#)?;
//! assert_eq!(cfg.max_cost, 200);
//! assert_eq!(cfg.event_log_length, 100);
//! # Ok::<(), camerabroker::Error>(())
//! ```

use crate::activity::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TOTAL};
use crate::eventlog::DEFAULT_EVENT_LOG_LENGTH;
use crate::registry::DEFAULT_MAX_COST;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default bound on waiting for an evicted lease to be torn down.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default bound on waiting for another connect to finish.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default depth of each backend's event channel.
pub const DEFAULT_BACKEND_EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Resource-cost ceiling across all leases.
    pub max_cost: i32,
    /// Number of entries kept in the event log.
    pub event_log_length: usize,
    /// Bound on waiting for an evicted lease to go away.
    pub disconnect_timeout_ms: u64,
    /// Bound on waiting for a concurrent connect to finish.
    pub connect_timeout_ms: u64,
    /// Total bound on polling the activity oracle.
    pub activity_poll_total_ms: u64,
    /// Interval between activity oracle polls.
    pub activity_poll_interval_ms: u64,
    /// Depth of each backend instance's event channel.
    pub backend_event_queue: usize,
    /// Hold backend interfaces weakly and re-acquire them on demand.
    pub lazy_backends: bool,
    /// File rewritten with the dump on each privileged session open.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            max_cost: DEFAULT_MAX_COST,
            event_log_length: DEFAULT_EVENT_LOG_LENGTH,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            activity_poll_total_ms: DEFAULT_POLL_TOTAL.as_millis() as u64,
            activity_poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            backend_event_queue: DEFAULT_BACKEND_EVENT_QUEUE,
            lazy_backends: false,
            snapshot_path: None,
        }
    }
}

impl BrokerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let cfg: BrokerConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_cost <= 0 {
            return Err(Error::IllegalArgument(format!(
                "max_cost must be positive, got {}",
                self.max_cost
            )));
        }
        if self.backend_event_queue == 0 {
            return Err(Error::IllegalArgument(
                "backend_event_queue must be at least 1".to_string(),
            ));
        }
        if self.activity_poll_interval_ms == 0 && self.activity_poll_total_ms > 0 {
            return Err(Error::IllegalArgument(
                "activity_poll_interval_ms must be positive when polling is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn activity_poll_total(&self) -> Duration {
        Duration::from_millis(self.activity_poll_total_ms)
    }

    pub fn activity_poll_interval(&self) -> Duration {
        Duration::from_millis(self.activity_poll_interval_ms)
    }
}
