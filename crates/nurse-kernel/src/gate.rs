//! [`GovernanceGate`] – the single decision point for an intent.
//!
//! Runs the two verdict layers in order, first failure wins:
//!
//! 1. **Policy** ([`PolicyEvaluator`]): fields, symbol coverage, size limit
//!    and allowed enumerations against the active [`PolicyDocument`].
//! 2. **Regime** ([`RegimeGuard`]): vetoes exposure growth the current
//!    [`RegimeStatus`] does not tolerate.
//!
//! # Example
//!
//! ```
//! use nurse_kernel::GovernanceGate;
//! use nurse_types::{
//!     PolicyDocument, PolicyScope, PolicySection, ReasonCode, RegimeStatus,
//!     RegimeThresholds, RiskLimits, VetoKind,
//! };
//! use serde_json::json;
//!
//! let gate = GovernanceGate::standard();
//! let policy = PolicyDocument::new(1, PolicyScope::Global, vec![PolicySection::RiskLimits(
//!     RiskLimits { max_position_size: 2.0, max_drawdown_pct: 0.2 },
//! )]);
//! let payload = json!({
//!     "correlation_id": "c-3", "symbol": "ETHUSD", "side": "buy", "size": 0.5,
//!     "order_type": "market", "strategy_id": "s", "exposure_delta": 0.5,
//! });
//! let intent = nurse_kernel::validate_fields(payload.as_object().unwrap()).unwrap();
//!
//! let calm = RegimeStatus::observe(1, 0.0, 0.0, RegimeThresholds::default());
//! assert!(gate.judge(&intent, &policy, &calm).is_ok());
//!
//! let drawdown = RegimeStatus::observe(2, 0.0, 0.3, RegimeThresholds::default());
//! assert_eq!(
//!     gate.judge(&intent, &policy, &drawdown),
//!     Err(ReasonCode::RegimeVeto(VetoKind::Drawdown)),
//! );
//! ```

use nurse_types::{Intent, PolicyDocument, ReasonCode, RegimeStatus};

use crate::policy_evaluator::{PolicyClearance, PolicyEvaluator};
use crate::regime_guard::RegimeGuard;

pub struct GovernanceGate {
    evaluator: PolicyEvaluator,
    guard: RegimeGuard,
}

impl GovernanceGate {
    pub fn new(evaluator: PolicyEvaluator, guard: RegimeGuard) -> Self {
        Self { evaluator, guard }
    }

    /// Gate with the standard rule set.
    pub fn standard() -> Self {
        Self::new(PolicyEvaluator::standard(), RegimeGuard::new())
    }

    /// Judge `intent` against the active policy and regime.
    ///
    /// # Errors
    ///
    /// The [`ReasonCode`] of the first failed check. Policy violations are
    /// reported before regime vetoes.
    pub fn judge(
        &self,
        intent: &Intent,
        policy: &PolicyDocument,
        regime: &RegimeStatus,
    ) -> Result<PolicyClearance, ReasonCode> {
        let clearance = self.evaluator.evaluate(intent, policy)?;
        self.guard.check(intent, &clearance, regime)?;
        Ok(clearance)
    }
}

impl Default for GovernanceGate {
    fn default() -> Self {
        Self::standard()
    }
}
