//! Gate verdicts, machine-readable reason codes and the audit trail.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::policy::{PolicyScope, RegimePhase};

/// Which regime rule vetoed an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VetoKind {
    Drawdown,
    VolatilityScale,
}

/// Why an intent was rejected.
///
/// The `Display` form is the wire code, e.g. `FIELD_MISSING:size`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    /// Payload is not a JSON object.
    MalformedPayload,
    FieldMissing(String),
    FieldInvalid(String),
    UnknownSymbol,
    SizeLimitExceeded,
    SideNotAllowed,
    OrderTypeNotAllowed,
    RegimeVeto(VetoKind),
    /// Policy store or regime status could not be read within budget.
    DependencyUnavailable,
}

impl ReasonCode {
    /// Error-taxonomy category this code belongs to.
    pub fn category(&self) -> RejectionCategory {
        match self {
            ReasonCode::MalformedPayload => RejectionCategory::MalformedInput,
            ReasonCode::FieldMissing(_)
            | ReasonCode::FieldInvalid(_)
            | ReasonCode::UnknownSymbol
            | ReasonCode::SizeLimitExceeded
            | ReasonCode::SideNotAllowed
            | ReasonCode::OrderTypeNotAllowed => RejectionCategory::PolicyViolation,
            ReasonCode::RegimeVeto(_) => RejectionCategory::RegimeVeto,
            ReasonCode::DependencyUnavailable => RejectionCategory::DependencyUnavailable,
        }
    }
}

/// Coarse grouping used for logging and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    MalformedInput,
    PolicyViolation,
    RegimeVeto,
    DependencyUnavailable,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonCode::MalformedPayload => write!(f, "MALFORMED_PAYLOAD"),
            ReasonCode::FieldMissing(field) => write!(f, "FIELD_MISSING:{field}"),
            ReasonCode::FieldInvalid(field) => write!(f, "FIELD_INVALID:{field}"),
            ReasonCode::UnknownSymbol => write!(f, "UNKNOWN_SYMBOL"),
            ReasonCode::SizeLimitExceeded => write!(f, "SIZE_LIMIT_EXCEEDED"),
            ReasonCode::SideNotAllowed => write!(f, "SIDE_NOT_ALLOWED"),
            ReasonCode::OrderTypeNotAllowed => write!(f, "ORDER_TYPE_NOT_ALLOWED"),
            ReasonCode::RegimeVeto(VetoKind::Drawdown) => write!(f, "REGIME_VETO:DRAWDOWN"),
            ReasonCode::RegimeVeto(VetoKind::VolatilityScale) => {
                write!(f, "REGIME_VETO:VOLATILITY_SCALE")
            }
            ReasonCode::DependencyUnavailable => write!(f, "DEPENDENCY_UNAVAILABLE"),
        }
    }
}

/// Returned when a string is not a known reason code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown reason code: {0}")]
pub struct UnknownReasonCode(pub String);

impl FromStr for ReasonCode {
    type Err = UnknownReasonCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = match s {
            "MALFORMED_PAYLOAD" => ReasonCode::MalformedPayload,
            "UNKNOWN_SYMBOL" => ReasonCode::UnknownSymbol,
            "SIZE_LIMIT_EXCEEDED" => ReasonCode::SizeLimitExceeded,
            "SIDE_NOT_ALLOWED" => ReasonCode::SideNotAllowed,
            "ORDER_TYPE_NOT_ALLOWED" => ReasonCode::OrderTypeNotAllowed,
            "REGIME_VETO:DRAWDOWN" => ReasonCode::RegimeVeto(VetoKind::Drawdown),
            "REGIME_VETO:VOLATILITY_SCALE" => ReasonCode::RegimeVeto(VetoKind::VolatilityScale),
            "DEPENDENCY_UNAVAILABLE" => ReasonCode::DependencyUnavailable,
            other => {
                if let Some(field) = other.strip_prefix("FIELD_MISSING:") {
                    ReasonCode::FieldMissing(field.to_string())
                } else if let Some(field) = other.strip_prefix("FIELD_INVALID:") {
                    ReasonCode::FieldInvalid(field.to_string())
                } else {
                    return Err(UnknownReasonCode(other.to_string()));
                }
            }
        };
        Ok(code)
    }
}

impl Serialize for ReasonCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReasonCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Final decision for one intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approved,
    Rejected,
}

/// Immutable record of one gate decision. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Absent only when the payload could not be read at all.
    pub correlation_id: Option<String>,
    pub symbol: Option<String>,
    pub strategy_id: Option<String>,
    pub verdict: Verdict,
    pub reason: Option<ReasonCode>,
    pub policy_version: Option<u64>,
    pub policy_scope: Option<PolicyScope>,
    pub regime_version: Option<u64>,
    pub regime_phase: Option<RegimePhase>,
    /// Trace-context token exactly as it arrived.
    pub trace_context: Option<String>,
    pub subject_source: String,
    pub subject_target: String,
    /// `false` when an approved signal could not be handed to the bus.
    pub signal_delivered: bool,
    pub potential_pnl: f64,
    pub saved_capital: f64,
    pub processing_ms: f64,
    pub latency_budget_ms: f64,
    pub latency_budget_met: bool,
    pub decided_at: DateTime<Utc>,
}

impl AuditRecord {
    /// A blank record for `verdict`; callers fill in what they know.
    pub fn new(verdict: Verdict, reason: Option<ReasonCode>) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: None,
            symbol: None,
            strategy_id: None,
            verdict,
            reason,
            policy_version: None,
            policy_scope: None,
            regime_version: None,
            regime_phase: None,
            trace_context: None,
            subject_source: String::new(),
            subject_target: String::new(),
            signal_delivered: false,
            potential_pnl: 0.0,
            saved_capital: 0.0,
            processing_ms: 0.0,
            latency_budget_ms: 0.0,
            latency_budget_met: true,
            decided_at: Utc::now(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_render_wire_form() {
        assert_eq!(ReasonCode::SizeLimitExceeded.to_string(), "SIZE_LIMIT_EXCEEDED");
        assert_eq!(
            ReasonCode::FieldMissing("size".into()).to_string(),
            "FIELD_MISSING:size"
        );
        assert_eq!(
            ReasonCode::RegimeVeto(VetoKind::Drawdown).to_string(),
            "REGIME_VETO:DRAWDOWN"
        );
        assert_eq!(
            ReasonCode::RegimeVeto(VetoKind::VolatilityScale).to_string(),
            "REGIME_VETO:VOLATILITY_SCALE"
        );
    }

    #[test]
    fn reason_codes_parse_back() {
        for code in [
            ReasonCode::MalformedPayload,
            ReasonCode::FieldMissing("side".into()),
            ReasonCode::FieldInvalid("confidence".into()),
            ReasonCode::UnknownSymbol,
            ReasonCode::OrderTypeNotAllowed,
            ReasonCode::RegimeVeto(VetoKind::VolatilityScale),
            ReasonCode::DependencyUnavailable,
        ] {
            assert_eq!(code.to_string().parse::<ReasonCode>(), Ok(code));
        }
        assert!("NOPE".parse::<ReasonCode>().is_err());
    }

    #[test]
    fn reason_code_serialises_as_plain_string() -> Result<(), serde_json::Error> {
        let json = serde_json::to_string(&ReasonCode::FieldMissing("size".into()))?;
        assert_eq!(json, r#""FIELD_MISSING:size""#);
        let back: ReasonCode = serde_json::from_str(r#""REGIME_VETO:DRAWDOWN""#)?;
        assert_eq!(back, ReasonCode::RegimeVeto(VetoKind::Drawdown));
        Ok(())
    }

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            ReasonCode::MalformedPayload.category(),
            RejectionCategory::MalformedInput
        );
        assert_eq!(
            ReasonCode::SizeLimitExceeded.category(),
            RejectionCategory::PolicyViolation
        );
        assert_eq!(
            ReasonCode::RegimeVeto(VetoKind::Drawdown).category(),
            RejectionCategory::RegimeVeto
        );
        assert_eq!(
            ReasonCode::DependencyUnavailable.category(),
            RejectionCategory::DependencyUnavailable
        );
    }

    #[test]
    fn audit_record_json_uses_lowercase_verdict() -> Result<(), serde_json::Error> {
        let mut record = AuditRecord::new(Verdict::Rejected, Some(ReasonCode::UnknownSymbol));
        record.correlation_id = Some("c-1".into());
        let json = serde_json::to_value(&record)?;
        assert_eq!(json["verdict"], "rejected");
        assert_eq!(json["reason"], "UNKNOWN_SYMBOL");
        let back: AuditRecord = serde_json::from_value(json)?;
        assert_eq!(back, record);
        Ok(())
    }
}
