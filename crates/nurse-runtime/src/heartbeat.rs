//! [`HeartbeatResponder`] – liveness and governance-state reporting.
//!
//! Serves request/reply on its own subject, independent of intent traffic.
//! Every query probes the policy store and the audit sink concurrently, each
//! bounded by the probe budget, and replies with a fresh [`HeartbeatReport`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, field, info_span, warn};

use nurse_kernel::{GovernanceHealth, HeartbeatWatcher};
use nurse_middleware::{BusError, Headers, Message, SubjectBus};
use nurse_store::{AuditEmitter, PolicyStoreClient};
use nurse_types::{DependencyStatus, HeartbeatReport};

pub const POLICY_STORE: &str = "policy_store";
pub const AUDIT_STORE: &str = "audit_store";

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub subject: String,
    /// Target reply time; overruns are flagged in the report.
    pub reply_budget: Duration,
    /// Upper bound on each dependency probe.
    pub probe_budget: Duration,
    pub version: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            subject: "cio.heartbeat".to_string(),
            reply_budget: Duration::from_millis(20),
            probe_budget: Duration::from_millis(10),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Clone)]
pub struct HeartbeatResponder {
    config: HeartbeatConfig,
    bus: SubjectBus,
    policies: Arc<PolicyStoreClient>,
    audit: AuditEmitter,
    health: Arc<GovernanceHealth>,
    watcher: Option<Arc<HeartbeatWatcher>>,
}

impl HeartbeatResponder {
    pub fn new(
        config: HeartbeatConfig,
        bus: SubjectBus,
        policies: Arc<PolicyStoreClient>,
        audit: AuditEmitter,
        health: Arc<GovernanceHealth>,
    ) -> Self {
        Self {
            config,
            bus,
            policies,
            audit,
            health,
            watcher: None,
        }
    }

    /// Feed every served query into `watcher`.
    pub fn with_watcher(mut self, watcher: Arc<HeartbeatWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Build a fresh report.
    pub async fn report(&self) -> HeartbeatReport {
        let started = Instant::now();
        let span = info_span!(
            "nurse.heartbeat",
            status_code = field::Empty,
            policy_store = field::Empty,
            audit_store = field::Empty,
            response_time_ms = field::Empty,
            under_budget = field::Empty,
        );
        async {
            let budget = self.config.probe_budget;
            let (policy_ok, audit_ok) = tokio::join!(
                self.policies.ping(budget),
                async {
                    tokio::time::timeout(budget, self.audit.ping())
                        .await
                        .is_ok_and(|r| r.is_ok())
                }
            );
            let policy_store = DependencyStatus::from_ok(policy_ok.is_ok());
            let audit_store = DependencyStatus::from_ok(audit_ok);
            let status_code = self
                .health
                .observe_probes(policy_store.is_connected() && audit_store.is_connected());

            let elapsed = started.elapsed();
            let response_time_ms = elapsed.as_secs_f64() * 1_000.0;
            let under_budget = elapsed <= self.config.reply_budget;

            let span = tracing::Span::current();
            span.record("status_code", field::debug(status_code));
            span.record("policy_store", field::debug(policy_store));
            span.record("audit_store", field::debug(audit_store));
            span.record("response_time_ms", response_time_ms);
            span.record("under_budget", under_budget);
            if !under_budget {
                warn!(response_time_ms, "heartbeat reply over budget");
            }

            HeartbeatReport {
                status: "OK".to_string(),
                status_code,
                timestamp: Utc::now(),
                version: self.config.version.clone(),
                dependencies: BTreeMap::from([
                    (POLICY_STORE.to_string(), policy_store),
                    (AUDIT_STORE.to_string(), audit_store),
                ]),
                response_time_ms,
                under_budget,
            }
        }
        .instrument(span)
        .await
    }

    /// Answer one request on its reply subject.
    pub async fn respond(&self, request: &Message) -> Result<HeartbeatReport, BusError> {
        if let Some(watcher) = &self.watcher {
            watcher.record_heartbeat();
        }
        let report = self.report().await;
        let body = serde_json::to_vec(&report).map_err(|e| BusError::Transport(e.to_string()))?;
        self.bus.respond(request, Headers::new(), body)?;
        Ok(report)
    }

    /// Subscribe and answer every query in its own task.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidSubject`] for a malformed subject.
    pub fn start(&self) -> Result<JoinHandle<()>, BusError> {
        let mut subscription = self.bus.subscribe(&self.config.subject)?;
        let responder = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(request) = subscription.recv().await {
                let responder = responder.clone();
                tokio::spawn(async move {
                    if let Err(e) = responder.respond(&request).await {
                        debug!(error = %e, "heartbeat reply dropped");
                    }
                });
            }
        }))
    }
}
