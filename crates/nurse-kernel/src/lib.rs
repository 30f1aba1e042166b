//! `nurse-kernel` – the gate's decision logic.
//!
//! Synchronous and CPU-only: nothing here performs I/O or suspends.
//!
//! # Modules
//!
//! - [`policy_evaluator`] – [`PolicyEvaluator`]: field conformance plus an
//!   ordered [`Rule`] engine over the active policy document.
//! - [`regime_guard`] – [`RegimeGuard`]: vetoes exposure growth in
//!   drawdown-protect and high-volatility regimes.
//! - [`gate`] – [`GovernanceGate`]: policy first, then regime.
//! - [`health`] – [`GovernanceHealth`] state and the [`HeartbeatWatcher`].

pub mod gate;
pub mod health;
pub mod policy_evaluator;
pub mod regime_guard;

pub use gate::GovernanceGate;
pub use health::{GovernanceHealth, HeartbeatWatcher};
pub use policy_evaluator::{
    AllowedOrderTypeRule, AllowedSideRule, PolicyClearance, PolicyEvaluator, Rule, SizeLimitRule,
    TradableSymbolRule, parse_payload, validate_fields,
};
pub use regime_guard::RegimeGuard;
