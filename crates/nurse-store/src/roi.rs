//! Shadow ROI: what the gate's rejections were worth over a time window.
//!
//! Every blocked intent contributes the larger of its `potential_pnl` and its
//! `saved_capital` to `shadow_roi`. Realised PnL never passes through the
//! gate, so the fatigue check takes it from the caller.

use chrono::{DateTime, Utc};
use serde::Serialize;

use nurse_types::AuditRecord;

/// Ratio of shadow ROI to realised PnL above which a strategy is flagged.
pub const DEFAULT_FATIGUE_RATIO: f64 = 1.0;

/// Whether the gate actually blocked anything in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GovernanceMode {
    /// At least one intent was blocked.
    Active,
    /// Everything passed; the gate only observed.
    Observe,
}

/// Aggregate of the audit records decided in `[window_start, window_end)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoiSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub approved_signals: u64,
    pub blocked_intents: u64,
    pub total_events: u64,
    pub saved_capital: f64,
    pub shadow_roi: f64,
    pub governance_status: GovernanceMode,
}

impl RoiSummary {
    /// Fold the records decided inside the window; others are skipped.
    pub fn from_records<'a>(
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        records: impl IntoIterator<Item = &'a AuditRecord>,
    ) -> Self {
        let mut summary = Self {
            window_start,
            window_end,
            approved_signals: 0,
            blocked_intents: 0,
            total_events: 0,
            saved_capital: 0.0,
            shadow_roi: 0.0,
            governance_status: GovernanceMode::Observe,
        };
        let in_window = |r: &&AuditRecord| r.decided_at >= window_start && r.decided_at < window_end;
        for record in records.into_iter().filter(in_window) {
            summary.total_events += 1;
            if record.is_approved() {
                summary.approved_signals += 1;
                continue;
            }
            summary.blocked_intents += 1;
            summary.saved_capital += record.saved_capital;
            summary.shadow_roi += record.potential_pnl.max(record.saved_capital);
        }
        if summary.blocked_intents > 0 {
            summary.governance_status = GovernanceMode::Active;
        }
        summary
    }

    /// Compare this window's shadow ROI against realised PnL.
    pub fn fatigue(&self, actual_pnl: f64, threshold_ratio: f64) -> FatigueCheck {
        FatigueCheck::evaluate(actual_pnl, self.shadow_roi, threshold_ratio)
    }
}

/// Strategy fatigue: the gate keeps saving more than the strategy earns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FatigueCheck {
    pub flagged: bool,
    pub shadow_to_actual_ratio: f64,
}

impl FatigueCheck {
    pub fn evaluate(actual_pnl: f64, shadow_roi: f64, threshold_ratio: f64) -> Self {
        let baseline = if actual_pnl == 0.0 { 1.0 } else { actual_pnl.abs() };
        let ratio = shadow_roi / baseline;
        Self {
            flagged: shadow_roi > actual_pnl.max(0.0) && ratio > threshold_ratio,
            shadow_to_actual_ratio: ratio,
        }
    }

    pub fn reason(&self) -> &'static str {
        if self.flagged {
            "saved capital is consistently above realised PnL"
        } else {
            "safety profile is within expected bounds"
        }
    }
}
