//! `nurse-types` – shared data model for the signal governance gate.
//!
//! - [`intent`] – [`Intent`] as proposed by strategies and the promoted
//!   [`Signal`] handed to the execution engine.
//! - [`policy`] – versioned [`PolicyDocument`]s made of tagged
//!   [`PolicySection`]s, plus the market [`RegimeStatus`].
//! - [`verdict`] – [`ReasonCode`]s, [`Verdict`] and the write-once
//!   [`AuditRecord`].
//! - [`health`] – the [`HeartbeatReport`] contract.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod health;
pub mod intent;
pub mod policy;
pub mod verdict;

pub use health::{DependencyStatus, GovernanceStatus, HeartbeatReport};
pub use intent::{Approval, Intent, OrderType, Side, Signal, TraceContext};
pub use policy::{
    ExecutionPolicy, PolicyDocument, PolicyScope, PolicySection, PolicyUpdate, RegimePhase,
    RegimeStatus, RegimeThresholds, RiskLimits,
};
pub use verdict::{AuditRecord, ReasonCode, RejectionCategory, Verdict, VetoKind};

/// Global error type for infrastructure failures.
///
/// Rejections are not errors; they are [`ReasonCode`]s.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum NurseError {
    #[error("Bus Error: {0}")]
    Bus(String),

    #[error("Policy Store Error: {0}")]
    Store(String),

    #[error("Audit Sink Error: {0}")]
    Audit(String),

    #[error("Invalid Policy: {0}")]
    InvalidPolicy(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Config Error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for NurseError {
    fn from(e: serde_json::Error) -> Self {
        NurseError::Serialization(e.to_string())
    }
}
