//! Trade intents as proposed by strategies, and the signals they become once
//! the gate approves them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::policy::PolicyScope;

/// Key under which approval metadata is attached to a promoted signal.
pub const GOVERNANCE_KEY: &str = "_governance";

/// Key under which the inbound trace context is echoed on a promoted signal.
pub const TRACE_CONTEXT_KEY: &str = "_otel_trace_context";

/// Payload keys checked, in order, for the producer's PnL estimate.
pub const PNL_KEYS: [&str; 3] = ["potential_pnl", "estimated_pnl", "expected_pnl"];

/// Trade direction requested by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Close,
    Hold,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::Buy, Side::Sell, Side::Close, Side::Hold];

    /// Case-insensitive parse of the wire spelling.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            "close" => Some(Side::Close),
            "hold" => Some(Side::Hold),
            _ => None,
        }
    }
}

/// Execution style requested by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl OrderType {
    pub const ALL: [OrderType; 3] = [OrderType::Market, OrderType::Limit, OrderType::Stop];

    /// Case-insensitive parse of the wire spelling.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            "stop" => Some(OrderType::Stop),
            _ => None,
        }
    }
}

/// W3C trace-context token carried in message headers.
///
/// Both values are kept byte-for-byte as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub traceparent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

/// A proposed trade action awaiting governance review.
///
/// `side` and `order_type` keep the producer's spelling; membership in the
/// allowed enumerations is a policy decision made by the evaluator, not a
/// parsing concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub correlation_id: String,
    pub symbol: String,
    pub side: String,
    pub size: f64,
    pub order_type: String,
    pub strategy_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub potential_pnl: Option<f64>,
    /// Filled from the inbound message headers, never from the body.
    #[serde(skip)]
    pub trace_context: Option<TraceContext>,
}

impl Intent {
    pub fn parsed_side(&self) -> Option<Side> {
        Side::parse(&self.side)
    }

    pub fn parsed_order_type(&self) -> Option<OrderType> {
        OrderType::parse(&self.order_type)
    }

    /// Change in net exposure this intent would cause.
    ///
    /// An explicit `exposure_delta` wins. Otherwise buys add `size`, sells
    /// remove it, and closes/holds are treated as neutral.
    pub fn exposure_delta(&self) -> f64 {
        if let Some(delta) = self.exposure_delta {
            return delta;
        }
        match self.parsed_side() {
            Some(Side::Buy) => self.size,
            Some(Side::Sell) => -self.size,
            Some(Side::Close) | Some(Side::Hold) | None => 0.0,
        }
    }

    /// `true` when the intent would grow net exposure.
    pub fn increases_exposure(&self) -> bool {
        self.exposure_delta() > 0.0
    }
}

/// Approval metadata attached to a promoted [`Signal`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub approved_at: DateTime<Utc>,
    pub policy_version: u64,
    pub policy_scope: PolicyScope,
    pub regime_version: u64,
}

/// An intent that passed governance and is authorised for execution.
///
/// The original intent object is carried verbatim (`payload`); approval data
/// lives under reserved keys so that no intent field is ever rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    #[serde(rename = "_governance")]
    pub approval: Approval,
    #[serde(
        rename = "_otel_trace_context",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub trace_context: Option<TraceContext>,
}

impl Signal {
    /// Promote an approved intent payload.
    pub fn promote(
        payload: Map<String, Value>,
        approval: Approval,
        trace_context: Option<TraceContext>,
    ) -> Self {
        Self {
            payload,
            approval,
            trace_context,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.payload.get("correlation_id").and_then(Value::as_str)
    }

    pub fn symbol(&self) -> Option<&str> {
        self.payload.get("symbol").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent(side: &str, size: f64, delta: Option<f64>) -> Intent {
        Intent {
            correlation_id: "c-1".into(),
            symbol: "BTCUSD".into(),
            side: side.into(),
            size,
            order_type: "market".into(),
            strategy_id: "momentum".into(),
            exposure_delta: delta,
            confidence: None,
            potential_pnl: None,
            trace_context: None,
        }
    }

    #[test]
    fn side_parse_is_case_insensitive() {
        assert_eq!(Side::parse("BUY"), Some(Side::Buy));
        assert_eq!(Side::parse("Close"), Some(Side::Close));
        assert_eq!(Side::parse("short"), None);
        assert_eq!(OrderType::parse("Limit"), Some(OrderType::Limit));
        assert_eq!(OrderType::parse("iceberg"), None);
    }

    #[test]
    fn exposure_delta_derived_from_side() {
        assert_eq!(intent("buy", 1.5, None).exposure_delta(), 1.5);
        assert_eq!(intent("sell", 1.5, None).exposure_delta(), -1.5);
        assert_eq!(intent("close", 1.5, None).exposure_delta(), 0.0);
        assert!(!intent("hold", 3.0, None).increases_exposure());
    }

    #[test]
    fn explicit_exposure_delta_wins() {
        // A sell that flips a short position can still grow exposure.
        assert!(intent("sell", 1.0, Some(0.5)).increases_exposure());
        assert!(!intent("buy", 1.0, Some(-1.0)).increases_exposure());
    }

    #[test]
    fn signal_keeps_payload_fields_verbatim() -> Result<(), Box<dyn std::error::Error>> {
        let payload = json!({
            "correlation_id": "c-9",
            "symbol": "ETHUSD",
            "side": "Buy",
            "size": 0.25,
            "order_type": "limit",
            "strategy_id": "mean-revert",
            "venue_hint": {"prefer": "maker"}
        });
        let Value::Object(map) = payload.clone() else {
            return Err("fixture must be an object".into());
        };
        let signal = Signal::promote(
            map,
            Approval {
                approved_at: Utc::now(),
                policy_version: 7,
                policy_scope: PolicyScope::Global,
                regime_version: 3,
            },
            Some(TraceContext {
                traceparent: "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".into(),
                tracestate: None,
            }),
        );

        let wire = serde_json::to_value(&signal)?;
        for (key, value) in payload.as_object().ok_or("object")? {
            assert_eq!(wire.get(key), Some(value), "field {key} altered");
        }
        assert_eq!(wire[GOVERNANCE_KEY]["policy_version"], 7);
        assert_eq!(
            wire[TRACE_CONTEXT_KEY]["traceparent"],
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );

        let back: Signal = serde_json::from_value(wire)?;
        assert_eq!(back.correlation_id(), Some("c-9"));
        assert_eq!(back.symbol(), Some("ETHUSD"));
        assert!(!back.payload.contains_key(GOVERNANCE_KEY));
        Ok(())
    }
}
