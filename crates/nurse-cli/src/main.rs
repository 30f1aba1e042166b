//! `nurse` – entry point for the signal governance gate.
//!
//! 1. Loads `~/.nurse/config.toml` (or `NURSE_CONFIG`) plus `NURSE_*`
//!    overrides; a missing file means defaults.
//! 2. Seeds the policy cache from the optional seed file.
//! 3. Starts the interceptor, heartbeat responder and policy-update listener
//!    on an in-process bus, exposed to other processes through the WebSocket
//!    gateway.
//! 4. On Ctrl-C stops accepting work and flushes the audit trail.
//!
//! `nurse --print-policy-schema` prints the JSON Schema of the policy-update
//! message and exits. `nurse --init-config` writes a default config file.
//! `nurse --earnings-summary [--window-hours N] [--actual-pnl X]` prints the
//! shadow ROI of the audit trail (default: the last week) with the strategy
//! fatigue check against realised PnL `X`.

mod config;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use colored::Colorize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use nurse_kernel::{GovernanceHealth, HeartbeatWatcher};
use nurse_middleware::{BusGateway, SubjectBus};
use nurse_runtime::{HeartbeatResponder, Interceptor, PolicySync, seed_from_json};
use nurse_store::{
    AuditEmitter, AuditEmitterConfig, InMemoryPolicyCache, PolicyBackend, PolicyStoreClient,
    DEFAULT_FATIGUE_RATIO, SqliteAuditSink,
};
use nurse_types::{NurseError, PolicyUpdate};

/// Upper bound on the audit flush at shutdown.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(5);

const DEFAULT_SUMMARY_HOURS: i64 = 24 * 7;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--print-policy-schema") {
        return print_policy_schema();
    }
    if args.iter().any(|a| a == "--init-config") {
        return init_config();
    }
    if args.iter().any(|a| a == "--earnings-summary") {
        return print_earnings_summary(&args);
    }

    let _telemetry = nurse_runtime::telemetry::init_tracing("nurse");
    print_banner();

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    println!(
        "  Config: {}",
        config::config_path().display().to_string().bold()
    );

    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gate stopped");
            println!("{}: {}", "Fatal".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: config::Config) -> Result<(), NurseError> {
    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let handler_tx = Arc::clone(&shutdown_tx);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting the gate down …".yellow().bold());
        let _ = handler_tx.send(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop the process with SIGKILL");
    }

    // ── Policy cache ──────────────────────────────────────────────────────
    let bus = SubjectBus::default();
    let cache = Arc::new(InMemoryPolicyCache::new());
    let policies = Arc::new(PolicyStoreClient::new(
        Arc::clone(&cache) as Arc<dyn PolicyBackend>,
        cfg.lookup_budget(),
    ));
    let sync = PolicySync::new(
        cfg.subjects.policy_updates.clone(),
        bus.clone(),
        cache,
        Arc::clone(&policies),
    );
    match &cfg.policy_seed {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| NurseError::Config(format!("failed to read seed {path}: {e}")))?;
            let applied = seed_from_json(&sync, &raw)?;
            info!(seed = %path, applied, "policy seed loaded");
        }
        None => warn!("no policy seed configured; intents are rejected until policy arrives"),
    }

    // ── Audit trail ───────────────────────────────────────────────────────
    let sink = SqliteAuditSink::open(&cfg.audit_db)?;
    let audit = AuditEmitter::spawn(Arc::new(sink), AuditEmitterConfig::default());
    info!(path = %cfg.audit_db, "audit trail open");

    // ── Gate components ───────────────────────────────────────────────────
    let health = Arc::new(GovernanceHealth::new());
    let watcher = Arc::new(HeartbeatWatcher::new(cfg.heartbeat_stale_after()));

    let interceptor = Interceptor::new(
        cfg.interceptor(),
        bus.clone(),
        Arc::clone(&policies),
        audit.clone(),
        Arc::clone(&health),
    );
    let heartbeat = HeartbeatResponder::new(
        cfg.heartbeat(),
        bus.clone(),
        policies,
        audit.clone(),
        health,
    )
    .with_watcher(Arc::clone(&watcher));

    let tasks = [
        interceptor.start()?,
        heartbeat.start()?,
        sync.start()?,
        tokio::spawn(supervise_heartbeats(watcher)),
    ];

    let addr: SocketAddr = cfg
        .bind_addr
        .parse()
        .map_err(|e| NurseError::Config(format!("invalid bind_addr {}: {e}", cfg.bind_addr)))?;
    println!(
        "  {} gate listening on {} (intents: {}, signals: {})\n",
        "✓".green().bold(),
        format!("ws://{addr}").bold(),
        cfg.subjects.intents.cyan(),
        cfg.subjects.signals.cyan(),
    );

    let outcome = tokio::select! {
        result = BusGateway::new(bus).run(addr) => result.map_err(NurseError::from),
        _ = shutdown_rx.changed() => {
            info!("shutdown requested");
            Ok(())
        }
    };

    for task in &tasks {
        task.abort();
    }
    if tokio::time::timeout(SHUTDOWN_FLUSH, audit.flush()).await.is_err() {
        let stats = audit.stats();
        error!(pending = stats.pending, "audit records not persisted at shutdown");
    }
    let stats = audit.stats();
    info!(
        written = stats.written,
        failed_attempts = stats.failed_attempts,
        "audit trail closed"
    );
    println!("{}", "  ✓ Exiting nurse.".green());
    outcome
}

/// Periodically raise the stale-heartbeat alert.
async fn supervise_heartbeats(watcher: Arc<HeartbeatWatcher>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        watcher.check();
    }
}

fn init_config() -> ExitCode {
    let path = config::config_path();
    if path.exists() {
        println!("  Config already exists at {}", path.display().to_string().bold());
        return ExitCode::SUCCESS;
    }
    match config::save_to(&config::Config::default(), &path) {
        Ok(()) => {
            println!(
                "  {} Config written to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}: {}", "Error saving config".red(), e);
            ExitCode::FAILURE
        }
    }
}

/// Value following `flag`, if any.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn earnings_report(
    sink: &SqliteAuditSink,
    window_hours: i64,
    actual_pnl: f64,
) -> Result<serde_json::Value, NurseError> {
    let summary = sink.earnings_summary(TimeDelta::hours(window_hours))?;
    let fatigue = summary.fatigue(actual_pnl, DEFAULT_FATIGUE_RATIO);
    Ok(serde_json::json!({
        "summary": summary,
        "actual_pnl": actual_pnl,
        "fatigue": {
            "flagged": fatigue.flagged,
            "shadow_to_actual_ratio": fatigue.shadow_to_actual_ratio,
            "reason": fatigue.reason(),
        },
    }))
}

fn print_earnings_summary(args: &[String]) -> ExitCode {
    let window_hours = flag_value(args, "--window-hours")
        .and_then(|v| v.parse().ok())
        .filter(|h| *h > 0)
        .unwrap_or(DEFAULT_SUMMARY_HOURS);
    let actual_pnl = flag_value(args, "--actual-pnl")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let report = config::load().and_then(|cfg| {
        let sink = SqliteAuditSink::open(&cfg.audit_db)?;
        earnings_report(&sink, window_hours, actual_pnl)
    });
    match report.and_then(|r| serde_json::to_string_pretty(&r).map_err(NurseError::from)) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to build earnings summary: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_policy_schema() -> ExitCode {
    let schema = schemars::schema_for!(PolicyUpdate);
    match serde_json::to_string_pretty(&schema) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to render schema: {e}");
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   _  __                "#.bold().cyan());
    println!("{}", r#"  / |/ /_ _________ ___ "#.bold().cyan());
    println!("{}", r#" /    / // / __(_-</ -_)"#.bold().cyan());
    println!("{}", r#"/_/|_/\_,_/_/ /___/\__/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Nurse".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Trading signal governance gate");
    println!();
}
