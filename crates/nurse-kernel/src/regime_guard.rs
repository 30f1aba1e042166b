//! [`RegimeGuard`] – market-regime veto layer.
//!
//! Applied only to intents the [`PolicyEvaluator`][crate::PolicyEvaluator]
//! already cleared. Works on synthetic fixtures; no I/O.

use nurse_types::{Intent, ReasonCode, RegimePhase, RegimeStatus, VetoKind};

use crate::policy_evaluator::PolicyClearance;

/// Vetoes exposure growth that the current regime does not tolerate.
///
/// | Phase | Vetoed when | Reason |
/// |---|---|---|
/// | `Normal` | never | |
/// | `HighVolatility` | delta > 0 and `size > limit × multiplier` | `REGIME_VETO:VOLATILITY_SCALE` |
/// | `DrawdownProtect` | delta > 0 | `REGIME_VETO:DRAWDOWN` |
#[derive(Debug, Default, Clone, Copy)]
pub struct RegimeGuard;

impl RegimeGuard {
    pub fn new() -> Self {
        Self
    }

    /// # Errors
    ///
    /// [`ReasonCode::RegimeVeto`] naming the rule that fired.
    pub fn check(
        &self,
        intent: &Intent,
        clearance: &PolicyClearance,
        regime: &RegimeStatus,
    ) -> Result<(), ReasonCode> {
        let delta = intent.exposure_delta();
        match regime.phase {
            RegimePhase::Normal => Ok(()),
            RegimePhase::DrawdownProtect if delta > 0.0 => {
                Err(ReasonCode::RegimeVeto(VetoKind::Drawdown))
            }
            RegimePhase::HighVolatility if delta > 0.0 => {
                let multiplier = clearance
                    .volatility_multiplier
                    .unwrap_or(regime.thresholds.high_volatility_multiplier);
                if intent.size > clearance.size_limit * multiplier {
                    Err(ReasonCode::RegimeVeto(VetoKind::VolatilityScale))
                } else {
                    Ok(())
                }
            }
            RegimePhase::DrawdownProtect | RegimePhase::HighVolatility => Ok(()),
        }
    }

    /// Capital a regime veto keeps off the table: `size × current_drawdown`.
    pub fn saved_capital(intent: &Intent, regime: &RegimeStatus) -> f64 {
        intent.size * regime.current_drawdown
    }
}
