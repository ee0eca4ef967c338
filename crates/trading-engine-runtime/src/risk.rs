//! Risk manager seam on the order-submission path.
//!
//! The specific limit algorithms live outside this crate; the supervisor
//! only needs a pre-trade check and a price observation feed. A breach
//! carries its classification (including the kill-switch and
//! circuit-breaker flags) so the supervisor can broadcast a faithful
//! `risk-control` event without knowing the limit internals.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A rejected pre-trade check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskBreach {
    /// Limit family, e.g. `max-position`, `order-rate`
    pub breach_type: String,
    /// Human-readable rejection reason
    pub reason: String,
    /// Limit readings at rejection time
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    /// The breach tripped the account kill switch
    #[serde(default)]
    pub kill_switch: bool,
    /// The breach opened the instrument circuit breaker
    #[serde(default)]
    pub circuit_breaker: bool,
}

impl RiskBreach {
    pub fn new(breach_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            breach_type: breach_type.into(),
            reason: reason.into(),
            metrics: HashMap::new(),
            kill_switch: false,
            circuit_breaker: false,
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_kill_switch(mut self) -> Self {
        self.kill_switch = true;
        self
    }

    pub fn with_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = true;
        self
    }
}

impl std::fmt::Display for RiskBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.breach_type, self.reason)
    }
}

impl std::error::Error for RiskBreach {}

/// Pre-trade checks and market observation for one risk domain.
#[cfg_attr(test, mockall::automock)]
pub trait RiskManager: Send + Sync {
    /// Check an order before routing. `Err` rejects the order.
    fn check_order(
        &self,
        request: &trading_engine_core::event::OrderRequest,
    ) -> std::result::Result<(), RiskBreach>;

    /// Feed an observed market price into the limit models.
    fn observe_price(&self, provider: &str, symbol: &str, price: f64);
}

/// Risk manager that admits every order and ignores observations. The
/// default for dry-run embeddings and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenRiskManager;

impl RiskManager for OpenRiskManager {
    fn check_order(
        &self,
        _request: &trading_engine_core::event::OrderRequest,
    ) -> std::result::Result<(), RiskBreach> {
        Ok(())
    }

    fn observe_price(&self, _provider: &str, _symbol: &str, _price: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breach_builder_and_display() {
        let breach = RiskBreach::new("max-position", "position limit 5 exceeded")
            .with_metric("position", 6.0)
            .with_kill_switch();
        assert!(breach.kill_switch);
        assert!(!breach.circuit_breaker);
        assert_eq!(breach.metrics["position"], 6.0);
        assert_eq!(
            breach.to_string(),
            "max-position: position limit 5 exceeded"
        );
    }

    #[test]
    fn test_open_risk_manager_admits_everything() {
        let request = trading_engine_core::event::OrderRequest::default();
        assert!(OpenRiskManager.check_order(&request).is_ok());
    }
}
