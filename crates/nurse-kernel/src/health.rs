//! Governance health tracking.
//!
//! - [`GovernanceHealth`] holds the gate's current [`GovernanceStatus`] and
//!   logs every transition.
//! - [`HeartbeatWatcher`] notices when nobody has queried the heartbeat for
//!   too long and raises a critical alert, at most once per interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use nurse_types::GovernanceStatus;
use tracing::{error, info, warn};

// ────────────────────────────────────────────────────────────────────────────
// GovernanceHealth
// ────────────────────────────────────────────────────────────────────────────

/// Shared DEGRADED / GOVERNANCE_ACTIVE flag.
///
/// Hot-path failures push it to degraded; only a heartbeat whose probes all
/// succeed brings it back.
#[derive(Debug)]
pub struct GovernanceHealth {
    degraded: AtomicBool,
}

impl GovernanceHealth {
    /// Starts active.
    pub fn new() -> Self {
        Self {
            degraded: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> GovernanceStatus {
        if self.degraded.load(Ordering::Acquire) {
            GovernanceStatus::Degraded
        } else {
            GovernanceStatus::GovernanceActive
        }
    }

    /// Record a dependency failure observed outside the heartbeat path.
    pub fn mark_degraded(&self, cause: &str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(cause, "governance degraded");
        }
    }

    /// Fold the outcome of one round of dependency probes into the state.
    ///
    /// Returns the status to report. A failure recorded since the previous
    /// round is reported once even if every probe now succeeds.
    pub fn observe_probes(&self, all_connected: bool) -> GovernanceStatus {
        let was_degraded = self.degraded.swap(!all_connected, Ordering::AcqRel);
        match (was_degraded, all_connected) {
            (true, true) => info!("governance active again"),
            (false, false) => warn!(cause = "dependency probe failed", "governance degraded"),
            _ => {}
        }
        if was_degraded || !all_connected {
            GovernanceStatus::Degraded
        } else {
            GovernanceStatus::GovernanceActive
        }
    }
}

impl Default for GovernanceHealth {
    fn default() -> Self {
        Self::new()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// HeartbeatWatcher
// ────────────────────────────────────────────────────────────────────────────

struct WatchState {
    last_heartbeat: Instant,
    last_alert: Option<Instant>,
}

/// Detects a silent heartbeat channel.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use nurse_kernel::HeartbeatWatcher;
///
/// let watcher = HeartbeatWatcher::new(Duration::from_secs(30));
/// watcher.record_heartbeat();
/// assert!(!watcher.is_stale());
/// assert!(!watcher.check());
/// ```
pub struct HeartbeatWatcher {
    stale_after: Duration,
    state: Mutex<WatchState>,
}

impl HeartbeatWatcher {
    /// The clock starts now, so a fresh watcher is not stale.
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            state: Mutex::new(WatchState {
                last_heartbeat: Instant::now(),
                last_alert: None,
            }),
        }
    }

    pub fn record_heartbeat(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_heartbeat = Instant::now();
        state.last_alert = None;
    }

    pub fn is_stale(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_heartbeat.elapsed() > self.stale_after
    }

    /// Raise the alert if the heartbeat is stale and none fired this interval.
    ///
    /// Returns `true` when an alert was raised.
    pub fn check(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let silent_for = state.last_heartbeat.elapsed();
        if silent_for <= self.stale_after {
            return false;
        }
        if state
            .last_alert
            .is_some_and(|at| at.elapsed() < self.stale_after)
        {
            return false;
        }
        state.last_alert = Some(Instant::now());
        error!(
            silent_for_ms = silent_for.as_millis() as u64,
            stale_after_ms = self.stale_after.as_millis() as u64,
            "CRITICAL: governance heartbeat stale"
        );
        true
    }
}
