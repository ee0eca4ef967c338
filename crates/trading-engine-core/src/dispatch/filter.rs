//! Route filter rules and their evaluation against events.
//!
//! Filters address event fields by name: `type`, `provider`, `symbol` (alias
//! `instrument`), and payload fields via dotted paths (`payload.price`, or
//! bare `price` which falls through to the payload). Evaluation happens
//! against a JSON view of the event built once per match pass.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::event::Event;

/// Comparison operator of a filter rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Contains,
    In,
    Gt,
    Lt,
    Gte,
    Lte,
    Exists,
}

/// One declarative filter: `field op value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FilterRule {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Equality rule, the common case for symbol pinning.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Membership rule over a list of accepted values.
    pub fn one_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOp::In, Value::Array(values))
    }

    pub fn validate(&self) -> Result<()> {
        if self.field.trim().is_empty() {
            return Err(EngineError::InvalidRoute {
                message: "filter field must not be empty".to_string(),
            });
        }
        if self.op == FilterOp::In && !self.value.is_array() {
            return Err(EngineError::InvalidRoute {
                message: format!("filter {}: `in` requires an array value", self.field),
            });
        }
        Ok(())
    }

    /// Evaluate this rule against a prepared event view.
    pub fn matches(&self, view: &EventView) -> bool {
        let actual = view.lookup(&self.field);
        match self.op {
            FilterOp::Exists => actual.is_some(),
            FilterOp::Eq => actual.map(|a| loose_eq(a, &self.value)).unwrap_or(false),
            FilterOp::Ne => actual.map(|a| !loose_eq(a, &self.value)).unwrap_or(true),
            FilterOp::In => match (&self.value, actual) {
                (Value::Array(choices), Some(a)) => choices.iter().any(|c| loose_eq(a, c)),
                _ => false,
            },
            FilterOp::Contains => match actual {
                Some(Value::String(s)) => self
                    .value
                    .as_str()
                    .map(|needle| s.contains(needle))
                    .unwrap_or(false),
                Some(Value::Array(items)) => items.iter().any(|item| loose_eq(item, &self.value)),
                _ => false,
            },
            FilterOp::Gt | FilterOp::Lt | FilterOp::Gte | FilterOp::Lte => {
                let Some(actual) = actual else { return false };
                let Some(ordering) = loose_cmp(actual, &self.value) else {
                    return false;
                };
                match self.op {
                    FilterOp::Gt => ordering.is_gt(),
                    FilterOp::Lt => ordering.is_lt(),
                    FilterOp::Gte => ordering.is_ge(),
                    FilterOp::Lte => ordering.is_le(),
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// JSON view of an event, built once per match pass so every rule shares
/// the same serialization cost.
pub struct EventView {
    root: Value,
}

impl EventView {
    pub fn from_event(event: &Event) -> Self {
        let payload = serde_json::to_value(&event.payload).unwrap_or(Value::Null);
        let root = serde_json::json!({
            "type": event.event_type.as_str(),
            "provider": event.provider,
            "symbol": event.symbol,
            "payload": payload,
        });
        Self { root }
    }

    /// Resolve a dotted field path. Top-level names `type`, `provider`,
    /// `symbol` (alias `instrument`) address the envelope; anything else
    /// resolves inside the payload unless prefixed with `payload.`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let normalized = match path {
            "instrument" => "symbol",
            other => other,
        };
        let mut current = match normalized {
            "type" | "provider" | "symbol" => return self.root.get(normalized),
            _ if normalized.starts_with("payload.") || normalized == "payload" => &self.root,
            _ => self.root.get("payload")?,
        };
        for segment in normalized.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }
}

/// Equality that treats numbers and numeric strings uniformly.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn loose_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, EventType};
    use serde_json::json;

    fn trade_view() -> EventView {
        let event = Event {
            event_id: 1,
            provider: "okx-spot".to_string(),
            symbol: "BTC-USDT".to_string(),
            event_type: EventType::Trade,
            payload: EventPayload::Trade {
                trade_id: "t9".to_string(),
                price: "100.5".to_string(),
                quantity: "0.25".to_string(),
                side: None,
            },
            ..Event::default()
        };
        EventView::from_event(&event)
    }

    #[test]
    fn test_instrument_membership_filter() {
        let view = trade_view();
        let rule = FilterRule::one_of(
            "instrument",
            vec![json!("BTC-USDT"), json!("ETH-USDT")],
        );
        assert!(rule.matches(&view));

        let miss = FilterRule::one_of("instrument", vec![json!("SOL-USDT")]);
        assert!(!miss.matches(&view));
    }

    #[test]
    fn test_payload_dotted_path_comparison() {
        let view = trade_view();
        let rule = FilterRule::new("payload.price", FilterOp::Gt, json!(100));
        assert!(rule.matches(&view));
        let rule = FilterRule::new("price", FilterOp::Lte, json!("100.5"));
        assert!(rule.matches(&view));
        let rule = FilterRule::new("payload.price", FilterOp::Lt, json!(100));
        assert!(!rule.matches(&view));
    }

    #[test]
    fn test_contains_is_substring_on_strings() {
        let view = trade_view();
        let rule = FilterRule::new("symbol", FilterOp::Contains, json!("BTC"));
        assert!(rule.matches(&view));
        let rule = FilterRule::new("symbol", FilterOp::Contains, json!("XRP"));
        assert!(!rule.matches(&view));
    }

    #[test]
    fn test_exists_and_ne() {
        let view = trade_view();
        assert!(FilterRule::new("payload.trade_id", FilterOp::Exists, Value::Null).matches(&view));
        assert!(!FilterRule::new("payload.missing", FilterOp::Exists, Value::Null).matches(&view));
        assert!(FilterRule::new("provider", FilterOp::Ne, json!("binance-spot")).matches(&view));
    }

    #[test]
    fn test_in_requires_array_value() {
        let rule = FilterRule::new("symbol", FilterOp::In, json!("BTC-USDT"));
        assert!(rule.validate().is_err());
    }
}
