//! `nurse-store` – the gate's external state.
//!
//! - [`policy_store`] – policy/regime lookups under a hard time budget, with
//!   an in-process monotonic cache as the default backend.
//! - [`audit`] – write-once audit records: SQLite and in-memory sinks, and
//!   the non-blocking [`AuditEmitter`] with background retry.
//! - [`roi`] – shadow ROI and strategy fatigue over a window of audit records.

pub mod audit;
pub mod policy_store;
pub mod roi;

pub use audit::{
    AuditEmitter, AuditEmitterConfig, AuditError, AuditSink, AuditStats, MemoryAuditSink,
    SqliteAuditSink,
};
pub use policy_store::{
    InMemoryPolicyCache, PolicyBackend, PolicyStoreClient, StoreError, VersionKey,
};
pub use roi::{DEFAULT_FATIGUE_RATIO, FatigueCheck, GovernanceMode, RoiSummary};
