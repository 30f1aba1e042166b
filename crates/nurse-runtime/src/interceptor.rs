//! [`Interceptor`] – the gate's message loop.
//!
//! For every message on the inbound intent subjects:
//!
//! 1. **Parse** – bytes to JSON object, then field conformance. Failures are
//!    rejected here and never reach a policy lookup.
//! 2. **Look up** – active policy for the symbol and the regime status,
//!    concurrently and each within the lookup budget. Any failure rejects
//!    with `DEPENDENCY_UNAVAILABLE` and marks governance degraded.
//! 3. **Judge** – [`GovernanceGate::judge`]: policy rules, then regime guard.
//! 4. **Promote** – on approval the original payload plus approval metadata is
//!    published on the outbound subject with the inbound headers unchanged.
//! 5. **Audit** – exactly one [`AuditRecord`] is queued, approved or not.
//!
//! # Scheduling
//!
//! Intents for the same symbol go through one *lane* (a task fed by a
//! channel) and are handled strictly in arrival order. Lanes for different
//! symbols run concurrently. Payloads without a usable symbol have no
//! ordering constraint and get a task each. A lane exits after sitting idle;
//! its replacement waits for it to drain before handling anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, field, info, info_span, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use nurse_kernel::{GovernanceGate, GovernanceHealth, RegimeGuard, parse_payload, validate_fields};
use nurse_middleware::{BusError, Message, SubjectBus, Subscription, extract_parent};
use nurse_store::{AuditEmitter, PolicyStoreClient};
use nurse_types::{
    Approval, AuditRecord, ReasonCode, RejectionCategory, Signal, TraceContext, Verdict,
};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`Interceptor`].
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// Wildcard pattern intents arrive on.
    pub inbound_pattern: String,
    /// Subject approved signals are published to.
    pub outbound_subject: String,
    /// End-to-end decision budget; overruns are logged and audited.
    pub enforcement_budget: Duration,
    /// How long a per-symbol lane may sit idle before it exits.
    pub lane_idle_timeout: Duration,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            inbound_pattern: "cio.intent.>".to_string(),
            outbound_subject: "signals.trading".to_string(),
            enforcement_budget: Duration::from_millis(50),
            lane_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of handling one inbound message.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    /// The record queued on the audit emitter.
    pub record: AuditRecord,
    /// The promoted signal, present only on approval.
    pub signal: Option<Signal>,
}

impl GateOutcome {
    pub fn verdict(&self) -> Verdict {
        self.record.verdict
    }

    pub fn reason(&self) -> Option<&ReasonCode> {
        self.record.reason.as_ref()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interceptor
// ─────────────────────────────────────────────────────────────────────────────

struct Inner {
    config: InterceptorConfig,
    bus: SubjectBus,
    gate: GovernanceGate,
    policies: Arc<PolicyStoreClient>,
    audit: AuditEmitter,
    health: Arc<GovernanceHealth>,
}

type Parsed = Result<Map<String, Value>, ReasonCode>;

/// Intercepts intents, judges them and promotes the approved ones.
#[derive(Clone)]
pub struct Interceptor {
    inner: Arc<Inner>,
}

impl Interceptor {
    pub fn new(
        config: InterceptorConfig,
        bus: SubjectBus,
        policies: Arc<PolicyStoreClient>,
        audit: AuditEmitter,
        health: Arc<GovernanceHealth>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                bus,
                gate: GovernanceGate::standard(),
                policies,
                audit,
                health,
            }),
        }
    }

    /// Subscribe to the inbound pattern and start dispatching.
    ///
    /// The subscription exists when this returns, so nothing published
    /// afterwards is missed.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidSubject`] for a malformed inbound pattern.
    pub fn start(&self) -> Result<JoinHandle<()>, BusError> {
        let subscription = self.inner.bus.subscribe(&self.inner.config.inbound_pattern)?;
        info!(
            inbound = %self.inner.config.inbound_pattern,
            outbound = %self.inner.config.outbound_subject,
            "interceptor started"
        );
        Ok(tokio::spawn(Arc::clone(&self.inner).dispatch(subscription)))
    }

    /// Handle one message end to end: judge, publish, audit.
    pub async fn handle(&self, message: Message) -> GateOutcome {
        let parsed = parse_payload(&message.payload);
        Arc::clone(&self.inner).process(message, parsed).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-symbol lanes
// ─────────────────────────────────────────────────────────────────────────────

struct Lane {
    tx: mpsc::UnboundedSender<(Message, Parsed)>,
    handle: JoinHandle<()>,
}

fn lane_key(parsed: &Parsed) -> Option<String> {
    parsed
        .as_ref()
        .ok()?
        .get("symbol")?
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

impl Inner {
    async fn dispatch(self: Arc<Self>, mut subscription: Subscription) {
        let mut lanes: HashMap<String, Lane> = HashMap::new();
        while let Some(message) = subscription.recv().await {
            let parsed = parse_payload(&message.payload);
            let Some(symbol) = lane_key(&parsed) else {
                let inner = Arc::clone(&self);
                tokio::spawn(async move {
                    inner.process(message, parsed).await;
                });
                continue;
            };

            let mut work = (message, parsed);
            if let Some(lane) = lanes.get(&symbol) {
                match lane.tx.send(work) {
                    Ok(()) => continue,
                    // Lane closed itself after idling; hand over below.
                    Err(mpsc::error::SendError(back)) => work = back,
                }
            }
            let previous = lanes.remove(&symbol).map(|lane| lane.handle);
            let lane = self.open_lane(symbol.clone(), previous);
            if lane.tx.send(work).is_err() {
                error!(%symbol, "fresh lane rejected work");
            }
            lanes.insert(symbol, lane);
            lanes.retain(|_, lane| !(lane.tx.is_closed() && lane.handle.is_finished()));
        }
        debug!("inbound subscription closed; dispatcher exiting");
    }

    fn open_lane(self: &Arc<Self>, symbol: String, previous: Option<JoinHandle<()>>) -> Lane {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Message, Parsed)>();
        let inner = Arc::clone(self);
        let idle = self.config.lane_idle_timeout;
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            loop {
                match tokio::time::timeout(idle, rx.recv()).await {
                    Ok(Some((message, parsed))) => {
                        Arc::clone(&inner).process(message, parsed).await;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        rx.close();
                        while let Some((message, parsed)) = rx.recv().await {
                            Arc::clone(&inner).process(message, parsed).await;
                        }
                        debug!(%symbol, "lane idle; closed");
                        break;
                    }
                }
            }
        });
        Lane { tx, handle }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Decision pipeline
    // ─────────────────────────────────────────────────────────────────────────

    async fn process(self: Arc<Self>, message: Message, parsed: Parsed) -> GateOutcome {
        let started = Instant::now();
        let trace_context = message.headers.trace_context();
        let span = info_span!(
            "nurse.intent",
            subject = %message.subject,
            correlation_id = field::Empty,
            symbol = field::Empty,
            verdict = field::Empty,
            reason = field::Empty,
        );
        let _ = span.set_parent(extract_parent(&message.headers));
        self.decide(message, parsed, trace_context, started)
            .instrument(span)
            .await
    }

    async fn decide(
        &self,
        message: Message,
        parsed: Parsed,
        trace_context: Option<TraceContext>,
        started: Instant,
    ) -> GateOutcome {
        let mut record = AuditRecord::new(Verdict::Rejected, None);
        record.subject_source = message.subject.clone();
        record.subject_target = self.config.outbound_subject.clone();
        record.trace_context = trace_context.as_ref().map(|t| t.traceparent.clone());

        let payload = match parsed {
            Ok(payload) => payload,
            Err(reason) => return self.finish(record, reason, started),
        };
        // Best-effort identification even if validation fails below.
        record.correlation_id = payload
            .get("correlation_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        record.symbol = payload.get("symbol").and_then(Value::as_str).map(str::to_string);

        let mut intent = match validate_fields(&payload) {
            Ok(intent) => intent,
            Err(reason) => return self.finish(record, reason, started),
        };
        intent.trace_context = trace_context.clone();
        record.strategy_id = Some(intent.strategy_id.clone());
        record.potential_pnl = intent.potential_pnl.unwrap_or(0.0);

        let span = tracing::Span::current();
        span.record("correlation_id", intent.correlation_id.as_str());
        span.record("symbol", intent.symbol.as_str());

        let (policy, regime) = tokio::join!(
            self.policies.active_policy(&intent.symbol),
            self.policies.regime_status()
        );
        let (policy, regime) = match (policy, regime) {
            (Ok(policy), Ok(regime)) => (policy, regime),
            (policy, regime) => {
                let cause = policy
                    .err()
                    .or(regime.err())
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                warn!(correlation_id = %intent.correlation_id, %cause, "dependency unavailable; failing closed");
                self.health.mark_degraded(&cause);
                return self.finish(record, ReasonCode::DependencyUnavailable, started);
            }
        };
        record.policy_version = Some(policy.version);
        record.policy_scope = Some(policy.scope.clone());
        record.regime_version = Some(regime.version);
        record.regime_phase = Some(regime.phase);

        let clearance = match self.gate.judge(&intent, &policy, &regime) {
            Ok(clearance) => clearance,
            Err(reason) => {
                if reason.category() == RejectionCategory::RegimeVeto {
                    record.saved_capital = RegimeGuard::saved_capital(&intent, &regime);
                }
                return self.finish(record, reason, started);
            }
        };

        let signal = Signal::promote(
            payload,
            Approval {
                approved_at: chrono::Utc::now(),
                policy_version: clearance.policy_version,
                policy_scope: clearance.policy_scope,
                regime_version: regime.version,
            },
            trace_context,
        );
        record.verdict = Verdict::Approved;
        record.signal_delivered = self.publish(&signal, &message);
        let mut outcome = self.finish_approved(record, started);
        outcome.signal = Some(signal);
        outcome
    }

    /// Hand the signal to the bus with the inbound headers untouched.
    fn publish(&self, signal: &Signal, inbound: &Message) -> bool {
        let bytes = match serde_json::to_vec(signal) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "signal serialisation failed");
                return false;
            }
        };
        let outbound = Message::new(self.config.outbound_subject.clone(), bytes)
            .with_headers(inbound.headers.clone());
        match self.bus.publish(outbound) {
            Ok(_) => true,
            Err(e) => {
                error!(
                    correlation_id = signal.correlation_id().unwrap_or("-"),
                    error = %e,
                    "approved signal not delivered"
                );
                false
            }
        }
    }

    fn finish(&self, mut record: AuditRecord, reason: ReasonCode, started: Instant) -> GateOutcome {
        tracing::Span::current().record("reason", field::display(&reason));
        info!(
            correlation_id = record.correlation_id.as_deref().unwrap_or("-"),
            symbol = record.symbol.as_deref().unwrap_or("-"),
            %reason,
            category = ?reason.category(),
            "intent rejected"
        );
        record.verdict = Verdict::Rejected;
        record.reason = Some(reason);
        self.close(record, started)
    }

    fn finish_approved(&self, record: AuditRecord, started: Instant) -> GateOutcome {
        info!(
            correlation_id = record.correlation_id.as_deref().unwrap_or("-"),
            symbol = record.symbol.as_deref().unwrap_or("-"),
            policy_version = record.policy_version,
            regime_version = record.regime_version,
            delivered = record.signal_delivered,
            "intent approved"
        );
        self.close(record, started)
    }

    /// Stamp latency, queue the audit record and build the outcome.
    fn close(&self, mut record: AuditRecord, started: Instant) -> GateOutcome {
        let elapsed = started.elapsed();
        let budget = self.config.enforcement_budget;
        record.processing_ms = elapsed.as_secs_f64() * 1_000.0;
        record.latency_budget_ms = budget.as_secs_f64() * 1_000.0;
        record.latency_budget_met = elapsed <= budget;
        tracing::Span::current().record(
            "verdict",
            if record.is_approved() { "approved" } else { "rejected" },
        );
        if !record.latency_budget_met {
            warn!(
                correlation_id = record.correlation_id.as_deref().unwrap_or("-"),
                elapsed_ms = record.processing_ms,
                budget_ms = record.latency_budget_ms,
                "enforcement budget exceeded"
            );
        }
        if let Err(e) = self.audit.emit(record.clone()) {
            error!(audit_id = %record.id, error = %e, "audit record could not be queued");
        }
        GateOutcome {
            record,
            signal: None,
        }
    }
}
