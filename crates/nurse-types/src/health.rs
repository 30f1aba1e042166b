//! Heartbeat contract types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall governance state reported by the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GovernanceStatus {
    GovernanceActive,
    Degraded,
}

/// Connectivity of one dependency as seen by the latest probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyStatus {
    Connected,
    Disconnected,
}

impl DependencyStatus {
    pub fn from_ok(ok: bool) -> Self {
        if ok {
            DependencyStatus::Connected
        } else {
            DependencyStatus::Disconnected
        }
    }

    pub fn is_connected(self) -> bool {
        self == DependencyStatus::Connected
    }
}

/// Reply to a heartbeat query. Recomputed on every query, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    /// Always `"OK"`: the responder itself is alive.
    pub status: String,
    pub status_code: GovernanceStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub dependencies: BTreeMap<String, DependencyStatus>,
    pub response_time_ms: f64,
    pub under_budget: bool,
}
