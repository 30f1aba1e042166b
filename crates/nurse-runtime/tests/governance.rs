//! End-to-end behaviour of the gate over the in-process bus.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nurse_kernel::GovernanceHealth;
use nurse_middleware::{BusError, Headers, SubjectBus, Subscription};
use nurse_runtime::{HeartbeatConfig, HeartbeatResponder, Interceptor, InterceptorConfig};
use nurse_store::{
    AuditEmitter, AuditEmitterConfig, AuditSink, InMemoryPolicyCache, MemoryAuditSink,
    PolicyBackend, PolicyStoreClient, SqliteAuditSink, StoreError,
};
use nurse_types::{
    AuditRecord, GovernanceStatus, HeartbeatReport, PolicyDocument, PolicyScope, PolicySection,
    ReasonCode, RegimePhase, RegimeStatus, RegimeThresholds, RiskLimits, Verdict, VetoKind,
};
use serde_json::{Value, json};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

const LOOKUP_BUDGET: Duration = Duration::from_millis(15);

struct Gate {
    bus: SubjectBus,
    cache: Arc<InMemoryPolicyCache>,
    sink: Arc<MemoryAuditSink>,
}

impl Gate {
    fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let sink = Arc::new(MemoryAuditSink::new());
        let (bus, cache) = Self::start_with(sink.clone())?;
        Ok(Self { bus, cache, sink })
    }

    fn start_with(
        sink: Arc<dyn AuditSink>,
    ) -> Result<(SubjectBus, Arc<InMemoryPolicyCache>), Box<dyn std::error::Error>> {
        let cache = seeded_cache()?;
        let bus = SubjectBus::default();
        launch(
            bus.clone(),
            Arc::clone(&cache) as Arc<dyn PolicyBackend>,
            LOOKUP_BUDGET,
            sink,
        )?;
        Ok((bus, cache))
    }

    fn send(&self, body: Value, headers: Headers) -> TestResult {
        self.bus
            .publish_to("cio.intent.momentum", headers, body.to_string().into_bytes())?;
        Ok(())
    }

    async fn records(&self, count: usize) -> Result<Vec<AuditRecord>, Box<dyn std::error::Error>> {
        wait_for(|| self.sink.records().len() >= count).await?;
        Ok(self.sink.records())
    }

    async fn record_for(&self, correlation_id: &str) -> Result<AuditRecord, Box<dyn std::error::Error>> {
        record_in(&self.sink, correlation_id).await
    }

    async fn heartbeat(&self) -> Result<HeartbeatReport, Box<dyn std::error::Error>> {
        let reply = self
            .bus
            .request("cio.heartbeat", Headers::new(), Vec::<u8>::new(), Duration::from_secs(1))
            .await?;
        Ok(serde_json::from_slice(&reply.payload)?)
    }
}

fn seeded_cache() -> Result<Arc<InMemoryPolicyCache>, Box<dyn std::error::Error>> {
    let cache = Arc::new(InMemoryPolicyCache::new());
    cache.put_policy(PolicyDocument::new(
        1,
        PolicyScope::Global,
        vec![PolicySection::RiskLimits(RiskLimits {
            max_position_size: 2.0,
            max_drawdown_pct: 0.2,
        })],
    ))?;
    cache.put_regime(RegimeStatus::observe(1, 0.0, 0.0, RegimeThresholds::default()))?;
    Ok(cache)
}

/// Start an interceptor and heartbeat responder on `bus`.
fn launch(
    bus: SubjectBus,
    backend: Arc<dyn PolicyBackend>,
    lookup_budget: Duration,
    sink: Arc<dyn AuditSink>,
) -> TestResult {
    let policies = Arc::new(PolicyStoreClient::new(backend, lookup_budget));
    let audit = AuditEmitter::spawn(
        sink,
        AuditEmitterConfig {
            initial_backoff: Duration::from_millis(5),
            ..Default::default()
        },
    );
    let health = Arc::new(GovernanceHealth::new());

    Interceptor::new(
        InterceptorConfig::default(),
        bus.clone(),
        Arc::clone(&policies),
        audit.clone(),
        Arc::clone(&health),
    )
    .start()?;
    HeartbeatResponder::new(HeartbeatConfig::default(), bus, policies, audit, health).start()?;
    Ok(())
}

/// Serves the cache, but reads of one scope take `stall` first.
struct StallingBackend {
    cache: Arc<InMemoryPolicyCache>,
    stalled: PolicyScope,
    stall: Duration,
}

#[async_trait]
impl PolicyBackend for StallingBackend {
    async fn fetch_policy(
        &self,
        scope: &PolicyScope,
    ) -> Result<Option<Arc<PolicyDocument>>, StoreError> {
        if *scope == self.stalled {
            tokio::time::sleep(self.stall).await;
        }
        self.cache.fetch_policy(scope).await
    }

    async fn fetch_regime(&self) -> Result<Option<Arc<RegimeStatus>>, StoreError> {
        self.cache.fetch_regime().await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.cache.ping().await
    }
}

async fn record_in(
    sink: &MemoryAuditSink,
    correlation_id: &str,
) -> Result<AuditRecord, Box<dyn std::error::Error>> {
    let find = || {
        sink.records()
            .into_iter()
            .find(|r| r.correlation_id.as_deref() == Some(correlation_id))
    };
    wait_for(|| find().is_some()).await?;
    find().ok_or_else(|| "record vanished".into())
}

async fn wait_for(mut done: impl FnMut() -> bool) -> TestResult {
    for _ in 0..400 {
        if done() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Err("timed out waiting for condition".into())
}

fn intent(correlation_id: &str, symbol: &str, size: f64) -> Value {
    json!({
        "correlation_id": correlation_id,
        "symbol": symbol,
        "side": "buy",
        "size": size,
        "order_type": "market",
        "strategy_id": "momentum",
    })
}

async fn no_message(subscription: &mut Subscription) -> bool {
    tokio::time::timeout(Duration::from_millis(50), subscription.recv())
        .await
        .is_err()
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_within_limit_is_approved() -> TestResult {
    let gate = Gate::start()?;
    let mut signals = gate.bus.subscribe("signals.trading")?;
    gate.send(intent("a-1", "BTCUSD", 1.0), Headers::new())?;

    let signal = signals.recv().await.ok_or("no signal")?;
    let wire: Value = serde_json::from_slice(&signal.payload)?;
    assert_eq!(wire["correlation_id"], "a-1");
    assert_eq!(wire["size"], 1.0);
    assert_eq!(wire["_governance"]["policy_version"], 1);
    assert_eq!(wire["_governance"]["regime_version"], 1);

    let record = gate.record_for("a-1").await?;
    assert_eq!(record.verdict, Verdict::Approved);
    assert!(record.reason.is_none());
    assert!(record.signal_delivered);
    assert_eq!(record.subject_source, "cio.intent.momentum");
    assert_eq!(record.subject_target, "signals.trading");
    Ok(())
}

#[tokio::test]
async fn scenario_b_over_limit_is_rejected() -> TestResult {
    let gate = Gate::start()?;
    let mut signals = gate.bus.subscribe("signals.trading")?;
    gate.send(intent("b-1", "BTCUSD", 3.0), Headers::new())?;

    let record = gate.record_for("b-1").await?;
    assert_eq!(record.verdict, Verdict::Rejected);
    assert_eq!(record.reason, Some(ReasonCode::SizeLimitExceeded));
    assert!(no_message(&mut signals).await);
    Ok(())
}

#[tokio::test]
async fn scenario_c_drawdown_protect_vetoes() -> TestResult {
    let gate = Gate::start()?;
    gate.cache
        .put_regime(RegimeStatus::observe(2, 0.0, 0.25, RegimeThresholds::default()))?;
    let mut signals = gate.bus.subscribe("signals.trading")?;
    let mut body = intent("c-1", "ETHUSD", 0.5);
    body["exposure_delta"] = json!(0.5);
    gate.send(body, Headers::new())?;

    let record = gate.record_for("c-1").await?;
    assert_eq!(record.reason, Some(ReasonCode::RegimeVeto(VetoKind::Drawdown)));
    assert_eq!(record.regime_phase, Some(RegimePhase::DrawdownProtect));
    assert_eq!(record.regime_version, Some(2));
    assert!((record.saved_capital - 0.125).abs() < 1e-9);
    assert!(no_message(&mut signals).await);
    Ok(())
}

#[tokio::test]
async fn scenario_d_unavailable_store_fails_closed_and_degrades() -> TestResult {
    let gate = Gate::start()?;
    gate.cache.set_available(false);
    let mut signals = gate.bus.subscribe("signals.trading")?;

    for (i, symbol) in ["BTCUSD", "ETHUSD", "SOLUSD", "BTCUSD"].iter().enumerate() {
        gate.send(intent(&format!("d-{i}"), symbol, 0.1), Headers::new())?;
    }
    let records = gate.records(4).await?;
    assert!(
        records
            .iter()
            .all(|r| r.reason == Some(ReasonCode::DependencyUnavailable))
    );
    assert!(no_message(&mut signals).await);

    let report = gate.heartbeat().await?;
    assert_eq!(report.status, "OK");
    assert_eq!(report.status_code, GovernanceStatus::Degraded);
    Ok(())
}

#[tokio::test]
async fn scenario_e_missing_size_never_reaches_regime() -> TestResult {
    let gate = Gate::start()?;
    let mut body = intent("e-1", "BTCUSD", 1.0);
    body.as_object_mut().ok_or("object")?.remove("size");
    gate.send(body, Headers::new())?;

    let record = gate.record_for("e-1").await?;
    assert_eq!(record.reason, Some(ReasonCode::FieldMissing("size".into())));
    assert!(record.regime_version.is_none());
    assert!(record.policy_version.is_none());
    Ok(())
}

#[tokio::test]
async fn malformed_bytes_are_audited() -> TestResult {
    let gate = Gate::start()?;
    gate.bus
        .publish_to("cio.intent.momentum", Headers::new(), b"\xff\xfe".to_vec())?;
    let records = gate.records(1).await?;
    assert_eq!(records[0].reason, Some(ReasonCode::MalformedPayload));
    assert!(records[0].correlation_id.is_none());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn hot_path_failure_shows_on_next_heartbeat_even_after_recovery() -> TestResult {
    let gate = Gate::start()?;
    gate.cache.set_available(false);
    gate.send(intent("f-1", "BTCUSD", 0.1), Headers::new())?;
    gate.record_for("f-1").await?;
    gate.cache.set_available(true);

    assert_eq!(gate.heartbeat().await?.status_code, GovernanceStatus::Degraded);
    assert_eq!(
        gate.heartbeat().await?.status_code,
        GovernanceStatus::GovernanceActive
    );
    Ok(())
}

#[tokio::test]
async fn trace_context_is_bit_identical_downstream() -> TestResult {
    let gate = Gate::start()?;
    let mut signals = gate.bus.subscribe("signals.trading")?;
    let headers = Headers::new()
        .with("traceparent", TRACEPARENT)
        .with("tracestate", "congo=t61rcWkgMzE,rojo=00f067aa0ba902b7");
    gate.send(intent("t-1", "BTCUSD", 1.0), headers)?;

    let signal = signals.recv().await.ok_or("no signal")?;
    assert_eq!(signal.headers.get("traceparent"), Some(TRACEPARENT));
    assert_eq!(
        signal.headers.get("tracestate"),
        Some("congo=t61rcWkgMzE,rojo=00f067aa0ba902b7")
    );
    let wire: Value = serde_json::from_slice(&signal.payload)?;
    assert_eq!(wire["_otel_trace_context"]["traceparent"], TRACEPARENT);

    let record = gate.record_for("t-1").await?;
    assert_eq!(record.trace_context.as_deref(), Some(TRACEPARENT));
    Ok(())
}

#[tokio::test]
async fn unknown_fields_survive_promotion() -> TestResult {
    let gate = Gate::start()?;
    let mut signals = gate.bus.subscribe("signals.trading")?;
    let mut body = intent("u-1", "BTCUSD", 1.0);
    body["venue_hint"] = json!({"prefer": "maker", "max_slippage_bps": 3});
    body["side"] = json!("Buy");
    gate.send(body.clone(), Headers::new())?;

    let signal = signals.recv().await.ok_or("no signal")?;
    let wire: Value = serde_json::from_slice(&signal.payload)?;
    for (key, value) in body.as_object().ok_or("object")? {
        assert_eq!(&wire[key], value, "field {key} changed");
    }
    Ok(())
}

#[tokio::test]
async fn same_symbol_signals_keep_arrival_order() -> TestResult {
    let gate = Gate::start()?;
    gate.cache.set_latency(Duration::from_millis(1));
    let mut signals = gate.bus.subscribe("signals.trading")?;

    const PER_SYMBOL: usize = 40;
    for i in 0..PER_SYMBOL {
        gate.send(intent(&format!("BTCUSD-{i:03}"), "BTCUSD", 0.1), Headers::new())?;
        gate.send(intent(&format!("ETHUSD-{i:03}"), "ETHUSD", 0.1), Headers::new())?;
    }

    let mut btc = Vec::new();
    let mut eth = Vec::new();
    while btc.len() + eth.len() < 2 * PER_SYMBOL {
        let message = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await?
            .ok_or("bus closed")?;
        let wire: Value = serde_json::from_slice(&message.payload)?;
        let id = wire["correlation_id"].as_str().ok_or("id")?.to_string();
        if id.starts_with("BTCUSD") {
            btc.push(id);
        } else {
            eth.push(id);
        }
    }
    let mut sorted = btc.clone();
    sorted.sort();
    assert_eq!(btc, sorted);
    let mut sorted = eth.clone();
    sorted.sort();
    assert_eq!(eth, sorted);
    Ok(())
}

#[tokio::test]
async fn same_inputs_same_verdict() -> TestResult {
    let gate = Gate::start()?;
    for _ in 0..3 {
        gate.send(intent("i-1", "BTCUSD", 2.5), Headers::new())?;
    }
    let records = gate.records(3).await?;
    assert_eq!(records.len(), 3);
    assert!(
        records
            .iter()
            .all(|r| r.reason == Some(ReasonCode::SizeLimitExceeded) && r.policy_version == Some(1))
    );
    // Each decision is its own record.
    assert_ne!(records[0].id, records[1].id);
    Ok(())
}

#[tokio::test]
async fn audit_outage_never_changes_the_verdict() -> TestResult {
    let gate = Gate::start()?;
    gate.sink.set_failing(true);
    let mut signals = gate.bus.subscribe("signals.trading")?;
    gate.send(intent("o-1", "BTCUSD", 1.0), Headers::new())?;

    // The signal goes out while the audit write is still failing.
    signals.recv().await.ok_or("no signal")?;
    assert!(gate.sink.records().is_empty());

    gate.sink.set_failing(false);
    let record = gate.record_for("o-1").await?;
    assert_eq!(record.verdict, Verdict::Approved);
    Ok(())
}

#[tokio::test]
async fn sqlite_audit_trail_end_to_end() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("audit.db");
    let sink = SqliteAuditSink::open(path.to_str().ok_or("utf-8 path")?)?;
    let (bus, _cache) = Gate::start_with(Arc::new(sink.clone()))?;

    let id = uuid::Uuid::new_v4().to_string();
    bus.publish_to(
        "cio.intent.momentum",
        Headers::new().with("traceparent", TRACEPARENT),
        intent(&id, "BTCUSD", 3.0).to_string().into_bytes(),
    )?;
    wait_for(|| sink.records_for(&id).map(|r| r.len() == 1).unwrap_or(false)).await?;

    let stored = sink.records_for(&id)?;
    assert_eq!(stored[0].reason, Some(ReasonCode::SizeLimitExceeded));
    assert_eq!(stored[0].trace_context.as_deref(), Some(TRACEPARENT));
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Back-pressure, isolation and cancellation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn burst_beyond_queue_capacity_is_refused_never_lost() -> TestResult {
    const CAPACITY: usize = 32;
    const BURST: usize = 500;
    let sink = Arc::new(MemoryAuditSink::new());
    let bus = SubjectBus::new(CAPACITY);
    launch(
        bus.clone(),
        seeded_cache()? as Arc<dyn PolicyBackend>,
        LOOKUP_BUDGET,
        sink.clone(),
    )?;

    let mut refused = 0;
    let mut heartbeat_checked = false;
    for i in 0..BURST {
        let body = intent(&format!("burst-{i:03}"), "BTCUSD", 3.0).to_string();
        loop {
            match bus.publish_to("cio.intent.momentum", Headers::new(), body.clone()) {
                Ok(_) => break,
                Err(BusError::SlowConsumer(_)) => {
                    refused += 1;
                    if !heartbeat_checked {
                        // The intent queue is full; heartbeats have their own.
                        let reply = bus
                            .request("cio.heartbeat", Headers::new(), Vec::<u8>::new(), Duration::from_secs(1))
                            .await?;
                        let report: HeartbeatReport = serde_json::from_slice(&reply.payload)?;
                        assert_eq!(report.status, "OK");
                        heartbeat_checked = true;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    assert!(refused > 0);
    assert!(heartbeat_checked);

    wait_for(|| sink.records().len() >= BURST).await?;
    let records = sink.records();
    assert_eq!(records.len(), BURST);
    let ids: HashSet<_> = records.iter().filter_map(|r| r.correlation_id.clone()).collect();
    assert_eq!(ids.len(), BURST);
    assert!(
        records
            .iter()
            .all(|r| r.reason == Some(ReasonCode::SizeLimitExceeded))
    );
    Ok(())
}

#[tokio::test]
async fn slow_lookup_for_one_symbol_does_not_delay_others() -> TestResult {
    const STALL: Duration = Duration::from_millis(300);
    let sink = Arc::new(MemoryAuditSink::new());
    let bus = SubjectBus::default();
    let backend = StallingBackend {
        cache: seeded_cache()?,
        stalled: PolicyScope::Symbol("SOLUSD".into()),
        stall: STALL,
    };
    // Budget wide enough that the stalled lookup completes.
    launch(bus.clone(), Arc::new(backend), Duration::from_secs(1), sink.clone())?;
    let mut signals = bus.subscribe("signals.trading")?;

    let sent = Instant::now();
    for (id, symbol) in [("slow-1", "SOLUSD"), ("fast-1", "BTCUSD"), ("fast-2", "ETHUSD")] {
        bus.publish_to(
            "cio.intent.momentum",
            Headers::new(),
            intent(id, symbol, 1.0).to_string(),
        )?;
    }

    for _ in 0..2 {
        let signal = tokio::time::timeout(STALL / 2, signals.recv())
            .await?
            .ok_or("bus closed")?;
        let wire: Value = serde_json::from_slice(&signal.payload)?;
        assert_ne!(wire["symbol"], "SOLUSD");
    }
    assert!(sent.elapsed() < STALL);
    for id in ["fast-1", "fast-2"] {
        let record = record_in(&sink, id).await?;
        assert_eq!(record.verdict, Verdict::Approved);
        assert!(record.latency_budget_met);
    }
    assert!(
        sink.records()
            .iter()
            .all(|r| r.correlation_id.as_deref() != Some("slow-1"))
    );

    let signal = tokio::time::timeout(Duration::from_secs(2), signals.recv())
        .await?
        .ok_or("bus closed")?;
    let wire: Value = serde_json::from_slice(&signal.payload)?;
    assert_eq!(wire["correlation_id"], "slow-1");
    let slow = record_in(&sink, "slow-1").await?;
    assert_eq!(slow.verdict, Verdict::Approved);
    assert!(slow.processing_ms >= STALL.as_secs_f64() * 1_000.0);
    Ok(())
}

#[tokio::test]
async fn lookup_past_budget_is_cancelled_and_fails_closed() -> TestResult {
    let gate = Gate::start()?;
    gate.cache.set_latency(Duration::from_millis(200));
    let mut signals = gate.bus.subscribe("signals.trading")?;
    gate.send(intent("x-1", "BTCUSD", 1.0), Headers::new())?;

    let record = gate.record_for("x-1").await?;
    assert_eq!(record.reason, Some(ReasonCode::DependencyUnavailable));
    assert!(record.policy_version.is_none());
    // The wait was abandoned at the lookup budget, not the backend's pace.
    assert!(record.processing_ms < 150.0);
    assert!(no_message(&mut signals).await);

    // Backend healthy again; the latched failure still shows once.
    gate.cache.set_latency(Duration::ZERO);
    assert_eq!(gate.heartbeat().await?.status_code, GovernanceStatus::Degraded);
    assert_eq!(
        gate.heartbeat().await?.status_code,
        GovernanceStatus::GovernanceActive
    );
    Ok(())
}
