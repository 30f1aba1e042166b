//! [`PolicyEvaluator`] – deterministic risk-policy rule engine.
//!
//! Evaluation happens in three stages; the first failure short-circuits:
//!
//! 1. **Field conformance** ([`validate_fields`]): required fields present and
//!    well-typed. Runs before any policy lookup so a malformed intent never
//!    costs a store round-trip.
//! 2. **Exposure** ([`TradableSymbolRule`], [`SizeLimitRule`]): the symbol is
//!    covered by the resolved document and `size ≤ max_position_size`.
//! 3. **Enumerations** ([`AllowedSideRule`], [`AllowedOrderTypeRule`]).
//!
//! Every check is a pure function of its inputs.

use serde_json::{Map, Value};

use nurse_types::intent::{GOVERNANCE_KEY, PNL_KEYS, TRACE_CONTEXT_KEY};
use nurse_types::{Intent, PolicyDocument, PolicyScope, ReasonCode};

// ────────────────────────────────────────────────────────────────────────────
// Stage 1: field conformance
// ────────────────────────────────────────────────────────────────────────────

/// Parse raw bytes into the intent object.
///
/// # Errors
///
/// [`ReasonCode::MalformedPayload`] unless the bytes are a JSON object.
pub fn parse_payload(bytes: &[u8]) -> Result<Map<String, Value>, ReasonCode> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(ReasonCode::MalformedPayload),
    }
}

fn present<'a>(map: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    map.get(field).filter(|v| !v.is_null())
}

fn required_str(
    map: &Map<String, Value>,
    field: &str,
    allow_empty: bool,
) -> Result<String, ReasonCode> {
    match present(map, field) {
        None => Err(ReasonCode::FieldMissing(field.to_string())),
        Some(Value::String(s)) if allow_empty || !s.trim().is_empty() => Ok(s.clone()),
        Some(_) => Err(ReasonCode::FieldInvalid(field.to_string())),
    }
}

fn optional_f64(map: &Map<String, Value>, field: &str) -> Result<Option<f64>, ReasonCode> {
    match present(map, field) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| ReasonCode::FieldInvalid(field.to_string())),
    }
}

/// Check required-field presence and type conformance.
///
/// Fields are checked in a fixed order so the reported field is stable.
/// `null` counts as absent.
///
/// # Errors
///
/// `FIELD_MISSING:<field>` or `FIELD_INVALID:<field>` for the first offender.
pub fn validate_fields(map: &Map<String, Value>) -> Result<Intent, ReasonCode> {
    let correlation_id = required_str(map, "correlation_id", false)?;
    let symbol = required_str(map, "symbol", false)?;
    let side = required_str(map, "side", true)?;
    let size = match present(map, "size") {
        None => return Err(ReasonCode::FieldMissing("size".into())),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite() && *n >= 0.0)
            .ok_or_else(|| ReasonCode::FieldInvalid("size".into()))?,
    };
    let order_type = required_str(map, "order_type", true)?;
    let strategy_id = required_str(map, "strategy_id", false)?;

    let exposure_delta = optional_f64(map, "exposure_delta")?;
    let confidence = optional_f64(map, "confidence")?;
    if confidence.is_some_and(|c| !(0.0..=1.0).contains(&c)) {
        return Err(ReasonCode::FieldInvalid("confidence".into()));
    }

    // Reserved keys belong to the gate; a producer may not pre-fill them.
    for reserved in [GOVERNANCE_KEY, TRACE_CONTEXT_KEY] {
        if map.contains_key(reserved) {
            return Err(ReasonCode::FieldInvalid(reserved.to_string()));
        }
    }

    // Only the first key present counts, even when it is not a number.
    let potential_pnl = PNL_KEYS
        .iter()
        .find_map(|key| map.get(*key))
        .and_then(Value::as_f64);

    Ok(Intent {
        correlation_id,
        symbol,
        side,
        size,
        order_type,
        strategy_id,
        exposure_delta,
        confidence,
        potential_pnl,
        trace_context: None,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single policy invariant an intent must satisfy.
pub trait Rule: Send + Sync {
    /// Name used in debug logs.
    fn name(&self) -> &str;

    /// `Ok(())` when `intent` satisfies the invariant under `policy`.
    fn check(&self, intent: &Intent, policy: &PolicyDocument) -> Result<(), ReasonCode>;
}

/// What the evaluator hands to the regime guard on success.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyClearance {
    pub policy_version: u64,
    pub policy_scope: PolicyScope,
    /// The `max_position_size` the intent was checked against.
    pub size_limit: f64,
    /// Document-level high-volatility multiplier, if the document sets one.
    pub volatility_multiplier: Option<f64>,
}

// ────────────────────────────────────────────────────────────────────────────
// PolicyEvaluator
// ────────────────────────────────────────────────────────────────────────────

/// Ordered rule engine over a [`PolicyDocument`].
///
/// # Example
///
/// ```
/// use nurse_kernel::PolicyEvaluator;
/// use nurse_types::{PolicyDocument, PolicyScope, PolicySection, ReasonCode, RiskLimits};
/// use serde_json::json;
///
/// let doc = PolicyDocument::new(1, PolicyScope::Global, vec![PolicySection::RiskLimits(
///     RiskLimits { max_position_size: 2.0, max_drawdown_pct: 0.2 },
/// )]);
/// let payload = json!({
///     "correlation_id": "c-1", "symbol": "BTCUSD", "side": "buy",
///     "size": 3.0, "order_type": "market", "strategy_id": "s",
/// });
/// let intent = nurse_kernel::validate_fields(payload.as_object().unwrap()).unwrap();
///
/// let evaluator = PolicyEvaluator::standard();
/// assert_eq!(evaluator.evaluate(&intent, &doc), Err(ReasonCode::SizeLimitExceeded));
/// ```
#[derive(Default)]
pub struct PolicyEvaluator {
    rules: Vec<Box<dyn Rule>>,
}

impl PolicyEvaluator {
    /// An evaluator with no rules (everything covered by a document passes).
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard rule order: symbol, size, side, order type.
    pub fn standard() -> Self {
        let mut evaluator = Self::new();
        evaluator.add_rule(Box::new(TradableSymbolRule));
        evaluator.add_rule(Box::new(SizeLimitRule));
        evaluator.add_rule(Box::new(AllowedSideRule));
        evaluator.add_rule(Box::new(AllowedOrderTypeRule));
        evaluator
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    /// Run every rule against `intent`.
    ///
    /// # Errors
    ///
    /// The [`ReasonCode`] of the first violated rule. A document without a
    /// `RiskLimits` section yields [`ReasonCode::UnknownSymbol`].
    pub fn evaluate(
        &self,
        intent: &Intent,
        policy: &PolicyDocument,
    ) -> Result<PolicyClearance, ReasonCode> {
        for rule in &self.rules {
            if let Err(reason) = rule.check(intent, policy) {
                tracing::debug!(rule = rule.name(), %reason, "policy rule failed");
                return Err(reason);
            }
        }
        let limits = policy.risk_limits().ok_or(ReasonCode::UnknownSymbol)?;
        Ok(PolicyClearance {
            policy_version: policy.version,
            policy_scope: policy.scope.clone(),
            size_limit: limits.max_position_size,
            volatility_multiplier: policy
                .regime_thresholds()
                .map(|t| t.high_volatility_multiplier),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// The resolved document must carry limits for the symbol.
///
/// A global document with `tradable_symbols` set only covers those symbols.
pub struct TradableSymbolRule;

impl Rule for TradableSymbolRule {
    fn name(&self) -> &str {
        "tradable_symbol"
    }

    fn check(&self, intent: &Intent, policy: &PolicyDocument) -> Result<(), ReasonCode> {
        if policy.risk_limits().is_none() {
            return Err(ReasonCode::UnknownSymbol);
        }
        if policy.scope == PolicyScope::Global
            && let Some(execution) = policy.execution_policy()
            && !execution.is_tradable(&intent.symbol)
        {
            return Err(ReasonCode::UnknownSymbol);
        }
        Ok(())
    }
}

/// `size ≤ max_position_size` (inclusive bound).
pub struct SizeLimitRule;

impl Rule for SizeLimitRule {
    fn name(&self) -> &str {
        "size_limit"
    }

    fn check(&self, intent: &Intent, policy: &PolicyDocument) -> Result<(), ReasonCode> {
        match policy.risk_limits() {
            Some(limits) if intent.size <= limits.max_position_size => Ok(()),
            Some(_) => Err(ReasonCode::SizeLimitExceeded),
            None => Err(ReasonCode::UnknownSymbol),
        }
    }
}

/// Side must be a known value and allowed by the document.
pub struct AllowedSideRule;

impl Rule for AllowedSideRule {
    fn name(&self) -> &str {
        "allowed_side"
    }

    fn check(&self, intent: &Intent, policy: &PolicyDocument) -> Result<(), ReasonCode> {
        let side = intent.parsed_side().ok_or(ReasonCode::SideNotAllowed)?;
        match policy.execution_policy() {
            Some(execution) if !execution.allows_side(side) => Err(ReasonCode::SideNotAllowed),
            _ => Ok(()),
        }
    }
}

/// Order type must be a known value and allowed by the document.
pub struct AllowedOrderTypeRule;

impl Rule for AllowedOrderTypeRule {
    fn name(&self) -> &str {
        "allowed_order_type"
    }

    fn check(&self, intent: &Intent, policy: &PolicyDocument) -> Result<(), ReasonCode> {
        let order_type = intent
            .parsed_order_type()
            .ok_or(ReasonCode::OrderTypeNotAllowed)?;
        match policy.execution_policy() {
            Some(execution) if !execution.allows_order_type(order_type) => {
                Err(ReasonCode::OrderTypeNotAllowed)
            }
            _ => Ok(()),
        }
    }
}
