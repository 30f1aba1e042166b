//! Audit trail: sinks and the non-blocking [`AuditEmitter`].
//!
//! # Storage layout
//!
//! [`SqliteAuditSink`] keeps one table `audit_records`:
//!
//! | column         | type | description                          |
//! |----------------|------|--------------------------------------|
//! | id             | TEXT | UUID v4 primary key                  |
//! | correlation_id | TEXT | intent correlation id, may be NULL   |
//! | symbol         | TEXT | may be NULL                          |
//! | verdict        | TEXT | `approved` / `rejected`              |
//! | reason         | TEXT | reason code, NULL on approval        |
//! | decided_at     | TEXT | RFC-3339 UTC, microseconds, `Z`      |
//! | record         | TEXT | full JSON-encoded [`AuditRecord`]    |
//!
//! Inserts are `INSERT OR IGNORE` on the id, so a retried write that already
//! landed is harmless. `decided_at` is fixed-width, so text order is time
//! order and window queries can compare strings.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rusqlite::{Connection, params};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error};

use nurse_types::{AuditRecord, NurseError};

use crate::roi::RoiSummary;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
    #[error("audit emitter closed")]
    Closed,
}

impl From<AuditError> for NurseError {
    fn from(e: AuditError) -> Self {
        NurseError::Audit(e.to_string())
    }
}

/// Durable destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;

    async fn ping(&self) -> Result<(), AuditError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteAuditSink
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed audit sink. Blocking calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteAuditSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditSink {
    /// Open (or create) a database at `path`.
    pub fn open(path: &str) -> Result<Self, AuditError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, AuditError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AuditError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_records (
                id             TEXT NOT NULL PRIMARY KEY,
                correlation_id TEXT,
                symbol         TEXT,
                verdict        TEXT NOT NULL,
                reason         TEXT,
                decided_at     TEXT NOT NULL,
                record         TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS audit_records_correlation
                ON audit_records (correlation_id);
            CREATE INDEX IF NOT EXISTS audit_records_decided
                ON audit_records (decided_at);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn insert(conn: &Connection, record: &AuditRecord) -> Result<(), AuditError> {
        let json = serde_json::to_string(record)?;
        let verdict = if record.is_approved() { "approved" } else { "rejected" };
        conn.execute(
            "INSERT OR IGNORE INTO audit_records
                 (id, correlation_id, symbol, verdict, reason, decided_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                record.correlation_id,
                record.symbol,
                verdict,
                record.reason.as_ref().map(ToString::to_string),
                timestamp(record.decided_at),
                json,
            ],
        )?;
        Ok(())
    }

    /// All records, oldest decision first.
    pub fn records(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt =
            conn.prepare("SELECT record FROM audit_records ORDER BY decided_at ASC, rowid ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    /// Records for one correlation id.
    pub fn records_for(&self, correlation_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT record FROM audit_records WHERE correlation_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![correlation_id], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    /// Shadow ROI over the records decided in `[start, end)`.
    pub fn summary(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RoiSummary, AuditError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT record FROM audit_records WHERE decided_at >= ?1 AND decided_at < ?2",
        )?;
        let rows = stmt.query_map(params![timestamp(start), timestamp(end)], |row| {
            row.get::<_, String>(0)
        })?;
        let mut records: Vec<AuditRecord> = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(RoiSummary::from_records(start, end, &records))
    }

    /// Shadow ROI over the trailing `window`, ending now.
    pub fn earnings_summary(&self, window: TimeDelta) -> Result<RoiSummary, AuditError> {
        let end = Utc::now();
        self.summary(end - window, end)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let conn = Arc::clone(&self.conn);
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            Self::insert(&conn, &record)
        })
        .await
        .map_err(|e| AuditError::Unavailable(e.to_string()))?
    }

    async fn ping(&self) -> Result<(), AuditError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok::<_, AuditError>(())
        })
        .await
        .map_err(|e| AuditError::Unavailable(e.to_string()))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryAuditSink
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory sink with a switchable failure mode.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While `true`, every append and ping fails.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Total append calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::Acquire) {
            return Err(AuditError::Unavailable("memory sink failing".into()));
        }
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if !records.iter().any(|r| r.id == record.id) {
            records.push(record.clone());
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), AuditError> {
        if self.failing.load(Ordering::Acquire) {
            Err(AuditError::Unavailable("memory sink failing".into()))
        } else {
            Ok(())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AuditEmitter
// ─────────────────────────────────────────────────────────────────────────────

/// Retry and alerting knobs for [`AuditEmitter`].
#[derive(Debug, Clone)]
pub struct AuditEmitterConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Failure alerts allowed per minute; the rest are counted, not logged.
    pub alerts_per_minute: NonZeroU32,
}

impl Default for AuditEmitterConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            alerts_per_minute: NonZeroU32::MIN.saturating_add(5),
        }
    }
}

/// Snapshot of emitter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuditStats {
    pub written: u64,
    pub failed_attempts: u64,
    pub suppressed_alerts: u64,
    pub pending: usize,
}

struct Shared {
    sink: Arc<dyn AuditSink>,
    config: AuditEmitterConfig,
    alerts: DefaultDirectRateLimiter,
    pending: AtomicUsize,
    written: AtomicU64,
    failed_attempts: AtomicU64,
    suppressed_alerts: AtomicU64,
    idle: Notify,
}

impl Shared {
    fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn record_failure(&self, record: &AuditRecord, err: &AuditError, attempt: u32) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        if self.alerts.check().is_ok() {
            error!(
                audit_id = %record.id,
                correlation_id = record.correlation_id.as_deref().unwrap_or("-"),
                attempt,
                error = %err,
                "audit write failed; retrying in background"
            );
        } else {
            self.suppressed_alerts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Write queued records; during an outage, retry from one backlog.
    ///
    /// While the backlog is non-empty the sink sees one attempt per backoff
    /// interval however many records are waiting. New records queue behind
    /// the backlog, and a record that fails again goes to its back so a
    /// single bad record cannot starve the rest.
    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<AuditRecord>) {
        let mut backlog: VecDeque<(AuditRecord, u32)> = VecDeque::new();
        let mut backoff = Duration::ZERO;
        let mut open = true;
        loop {
            if backlog.is_empty() {
                let Some(record) = rx.recv().await else { break };
                if let Err(e) = self.sink.append(&record).await {
                    self.record_failure(&record, &e, 1);
                    backlog.push_back((record, 1));
                    backoff = self.config.initial_backoff;
                    continue;
                }
                self.record_written();
                continue;
            }

            let retry_at = tokio::time::sleep(backoff);
            tokio::pin!(retry_at);
            loop {
                tokio::select! {
                    _ = &mut retry_at => break,
                    incoming = rx.recv(), if open => match incoming {
                        Some(record) => backlog.push_back((record, 0)),
                        None => open = false,
                    },
                }
            }

            let Some((record, attempts)) = backlog.pop_front() else { continue };
            let attempt = attempts + 1;
            match self.sink.append(&record).await {
                Ok(()) => {
                    if attempts > 0 {
                        debug!(audit_id = %record.id, attempt, "audit write recovered");
                    }
                    self.record_written();
                    // Sink is back: drain the rest without waiting.
                    backoff = Duration::ZERO;
                }
                Err(e) => {
                    self.record_failure(&record, &e, attempt);
                    backlog.push_back((record, attempt));
                    backoff = if backoff.is_zero() {
                        self.config.initial_backoff
                    } else {
                        (backoff * 2).min(self.config.max_backoff)
                    };
                }
            }
        }
    }
}

/// Queues audit records without blocking the caller.
///
/// A background worker writes records in arrival order. When the sink fails
/// the worker switches to a single backlog retried with exponential backoff
/// until every record has landed. Delivery is at-least-once.
#[derive(Clone)]
pub struct AuditEmitter {
    tx: mpsc::UnboundedSender<AuditRecord>,
    shared: Arc<Shared>,
}

impl AuditEmitter {
    /// Start the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, config: AuditEmitterConfig) -> Self {
        let alerts = RateLimiter::direct(Quota::per_minute(config.alerts_per_minute));
        let shared = Arc::new(Shared {
            sink,
            config,
            alerts,
            pending: AtomicUsize::new(0),
            written: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            suppressed_alerts: AtomicU64::new(0),
            idle: Notify::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel::<AuditRecord>();
        tokio::spawn(Arc::clone(&shared).run(rx));

        Self { tx, shared }
    }

    /// Queue `record` for writing. Never waits on the sink.
    ///
    /// # Errors
    ///
    /// [`AuditError::Closed`] if the writer task is gone.
    pub fn emit(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(record).map_err(|_| {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            AuditError::Closed
        })
    }

    /// Wait until every queued record has been written.
    pub async fn flush(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            written: self.shared.written.load(Ordering::Relaxed),
            failed_attempts: self.shared.failed_attempts.load(Ordering::Relaxed),
            suppressed_alerts: self.shared.suppressed_alerts.load(Ordering::Relaxed),
            pending: self.shared.pending.load(Ordering::Acquire),
        }
    }

    /// Liveness probe on the underlying sink.
    pub async fn ping(&self) -> Result<(), AuditError> {
        self.shared.sink.ping().await
    }
}
