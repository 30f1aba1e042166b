//! Versioned risk policy and market-regime state.
//!
//! Policy documents are produced by the external reasoning layer and are
//! read-only from the gate's point of view. A document is a closed set of
//! tagged [`PolicySection`]s; consumers dispatch on the section kind instead of
//! probing for ad hoc fields.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::NurseError;
use crate::intent::{OrderType, Side};

/// Where a policy document applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    /// Applies to every symbol without its own override.
    Global,
    /// Overrides the global document for one symbol.
    Symbol(String),
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyScope::Global => write!(f, "global"),
            PolicyScope::Symbol(symbol) => write!(f, "symbol:{symbol}"),
        }
    }
}

/// Numeric exposure limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RiskLimits {
    /// Largest size a single intent may request (inclusive).
    pub max_position_size: f64,
    /// Maximum tolerated portfolio drawdown, as a fraction.
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
}

fn default_max_drawdown_pct() -> f64 {
    0.2
}

/// Parameters that move the market regime between phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RegimeThresholds {
    /// Observed volatility at or above which the regime is high-volatility.
    #[serde(default = "default_volatility_threshold")]
    pub volatility_threshold: f64,
    /// Drawdown at or above which the regime is drawdown-protect.
    #[serde(default = "default_drawdown_threshold")]
    pub drawdown_threshold: f64,
    /// Fraction of the normal size limit still allowed in high volatility.
    #[serde(default = "default_high_volatility_multiplier")]
    pub high_volatility_multiplier: f64,
}

fn default_volatility_threshold() -> f64 {
    0.03
}
fn default_drawdown_threshold() -> f64 {
    0.2
}
fn default_high_volatility_multiplier() -> f64 {
    0.5
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            volatility_threshold: default_volatility_threshold(),
            drawdown_threshold: default_drawdown_threshold(),
            high_volatility_multiplier: default_high_volatility_multiplier(),
        }
    }
}

/// Which enumerated values and symbols a strategy may use.
///
/// Empty lists mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionPolicy {
    #[serde(default)]
    pub allowed_sides: Vec<Side>,
    #[serde(default)]
    pub allowed_order_types: Vec<OrderType>,
    /// When set on the global document, symbols outside the list are unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tradable_symbols: Option<Vec<String>>,
}

impl ExecutionPolicy {
    pub fn allows_side(&self, side: Side) -> bool {
        self.allowed_sides.is_empty() || self.allowed_sides.contains(&side)
    }

    pub fn allows_order_type(&self, order_type: OrderType) -> bool {
        self.allowed_order_types.is_empty() || self.allowed_order_types.contains(&order_type)
    }

    pub fn is_tradable(&self, symbol: &str) -> bool {
        self.tradable_symbols
            .as_ref()
            .is_none_or(|symbols| symbols.iter().any(|s| s == symbol))
    }
}

/// One tagged section of a [`PolicyDocument`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicySection {
    RiskLimits(RiskLimits),
    RegimeThresholds(RegimeThresholds),
    ExecutionPolicy(ExecutionPolicy),
}

/// A versioned, immutable set of risk limits for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyDocument {
    /// Monotonically increasing per scope; the visible commit marker.
    pub version: u64,
    pub scope: PolicyScope,
    pub issued_at: DateTime<Utc>,
    pub sections: Vec<PolicySection>,
}

impl PolicyDocument {
    pub fn new(version: u64, scope: PolicyScope, sections: Vec<PolicySection>) -> Self {
        Self {
            version,
            scope,
            issued_at: Utc::now(),
            sections,
        }
    }

    pub fn risk_limits(&self) -> Option<&RiskLimits> {
        self.sections.iter().find_map(|s| match s {
            PolicySection::RiskLimits(limits) => Some(limits),
            _ => None,
        })
    }

    pub fn regime_thresholds(&self) -> Option<&RegimeThresholds> {
        self.sections.iter().find_map(|s| match s {
            PolicySection::RegimeThresholds(thresholds) => Some(thresholds),
            _ => None,
        })
    }

    pub fn execution_policy(&self) -> Option<&ExecutionPolicy> {
        self.sections.iter().find_map(|s| match s {
            PolicySection::ExecutionPolicy(execution) => Some(execution),
            _ => None,
        })
    }

    /// Reject documents the gate could never enforce consistently.
    ///
    /// # Errors
    ///
    /// [`NurseError::InvalidPolicy`] describing the first problem found.
    pub fn validate(&self) -> Result<(), NurseError> {
        if self.version == 0 {
            return Err(NurseError::InvalidPolicy("version must be >= 1".into()));
        }
        if let PolicyScope::Symbol(symbol) = &self.scope
            && symbol.trim().is_empty()
        {
            return Err(NurseError::InvalidPolicy("symbol scope must name a symbol".into()));
        }
        for section in &self.sections {
            match section {
                PolicySection::RiskLimits(limits) => {
                    if !limits.max_position_size.is_finite() || limits.max_position_size < 0.0 {
                        return Err(NurseError::InvalidPolicy(format!(
                            "max_position_size {} must be a finite non-negative number",
                            limits.max_position_size
                        )));
                    }
                    if !(0.0..=1.0).contains(&limits.max_drawdown_pct) {
                        return Err(NurseError::InvalidPolicy(format!(
                            "max_drawdown_pct {} out of [0, 1]",
                            limits.max_drawdown_pct
                        )));
                    }
                }
                PolicySection::RegimeThresholds(thresholds) => thresholds.validate()?,
                PolicySection::ExecutionPolicy(_) => {}
            }
        }
        Ok(())
    }
}

impl RegimeThresholds {
    fn validate(&self) -> Result<(), NurseError> {
        if !(0.0..=1.0).contains(&self.high_volatility_multiplier) {
            return Err(NurseError::InvalidPolicy(format!(
                "high_volatility_multiplier {} out of [0, 1]",
                self.high_volatility_multiplier
            )));
        }
        if self.volatility_threshold < 0.0 || self.drawdown_threshold < 0.0 {
            return Err(NurseError::InvalidPolicy(
                "regime thresholds must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Market phase used by the regime guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RegimePhase {
    Normal,
    HighVolatility,
    DrawdownProtect,
}

impl fmt::Display for RegimePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegimePhase::Normal => write!(f, "normal"),
            RegimePhase::HighVolatility => write!(f, "high_volatility"),
            RegimePhase::DrawdownProtect => write!(f, "drawdown_protect"),
        }
    }
}

/// Current market-phase classification for the trading universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RegimeStatus {
    pub version: u64,
    pub phase: RegimePhase,
    #[serde(default)]
    pub current_drawdown: f64,
    #[serde(default)]
    pub observed_volatility: f64,
    #[serde(default)]
    pub thresholds: RegimeThresholds,
    pub updated_at: DateTime<Utc>,
}

impl RegimeStatus {
    /// Build a status whose phase is derived from the observations.
    pub fn observe(
        version: u64,
        observed_volatility: f64,
        current_drawdown: f64,
        thresholds: RegimeThresholds,
    ) -> Self {
        Self {
            version,
            phase: Self::classify(observed_volatility, current_drawdown, &thresholds),
            current_drawdown,
            observed_volatility,
            thresholds,
            updated_at: Utc::now(),
        }
    }

    /// Drawdown protection takes precedence over volatility scaling.
    pub fn classify(
        observed_volatility: f64,
        current_drawdown: f64,
        thresholds: &RegimeThresholds,
    ) -> RegimePhase {
        if current_drawdown >= thresholds.drawdown_threshold {
            RegimePhase::DrawdownProtect
        } else if observed_volatility >= thresholds.volatility_threshold {
            RegimePhase::HighVolatility
        } else {
            RegimePhase::Normal
        }
    }

    /// # Errors
    ///
    /// [`NurseError::InvalidPolicy`] for a zero version or bad thresholds.
    pub fn validate(&self) -> Result<(), NurseError> {
        if self.version == 0 {
            return Err(NurseError::InvalidPolicy("regime version must be >= 1".into()));
        }
        self.thresholds.validate()
    }
}

/// Notification pushed by the reasoning layer when it commits new state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum PolicyUpdate {
    Policy(PolicyDocument),
    Regime(RegimeStatus),
}
