//! Strategy instance specs: the control-plane intake shape, normalization,
//! and the immutability rules enforced on update.
//!
//! After first create, `providers`, `provider_symbols`, and the strategy
//! identifier are frozen for the instance's lifetime; only the config map
//! and the selector-derived tag/hash may change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use trading_engine_core::error::{EngineError, Result};

/// Strategy reference inside an instance spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    /// Strategy name (bare) the instance binds to
    pub identifier: String,
    /// Instance configuration handed to the handler
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    /// Full selector override, e.g. `delay:v1.0.0` or `delay@sha256:...`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Tag shorthand, equivalent to `identifier:tag`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Hash shorthand, equivalent to `identifier@hash`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl StrategySpec {
    /// The effective selector string for resolution.
    pub fn selector_string(&self) -> String {
        if let Some(selector) = &self.selector {
            return selector.clone();
        }
        if let Some(hash) = &self.hash {
            return format!("{}@{}", self.identifier, hash);
        }
        if let Some(tag) = &self.tag {
            return format!("{}:{}", self.identifier, tag);
        }
        self.identifier.clone()
    }

    /// Whether the reference is tag- or hash-qualified and must go through
    /// the dynamic resolver.
    pub fn is_qualified(&self) -> bool {
        self.tag.is_some()
            || self.hash.is_some()
            || self
                .selector
                .as_deref()
                .map(|s| s.contains(':') || s.contains('@'))
                .unwrap_or(false)
    }

    /// Dry-run setting from config; defaults to true.
    pub fn dry_run(&self) -> bool {
        self.config
            .get("dry_run")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}

/// Symbols an instance consumes from one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSymbols {
    pub symbols: Vec<String>,
}

/// Control-plane intake for one strategy instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub id: String,
    pub strategy: StrategySpec,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default, rename = "providerSymbols", alias = "provider_symbols")]
    pub provider_symbols: BTreeMap<String, ProviderSymbols>,
}

impl InstanceSpec {
    /// Normalize in place: trim whitespace, lowercase the strategy name,
    /// uppercase symbols, dedupe providers and symbols preserving input
    /// order, and rebuild `providers` from the symbol map when empty.
    pub fn normalize(&mut self) {
        self.id = self.id.trim().to_string();
        self.strategy.identifier = self.strategy.identifier.trim().to_lowercase();

        let mut providers = Vec::new();
        for provider in self.providers.drain(..) {
            let provider = provider.trim().to_string();
            if !provider.is_empty() && !providers.contains(&provider) {
                providers.push(provider);
            }
        }
        self.providers = providers;

        let mut normalized = BTreeMap::new();
        for (provider, symbols) in std::mem::take(&mut self.provider_symbols) {
            let provider = provider.trim().to_string();
            if provider.is_empty() {
                continue;
            }
            let mut deduped = Vec::new();
            for symbol in symbols.symbols {
                let symbol = symbol.trim().to_uppercase();
                if !symbol.is_empty() && !deduped.contains(&symbol) {
                    deduped.push(symbol);
                }
            }
            normalized.insert(provider, ProviderSymbols { symbols: deduped });
        }
        self.provider_symbols = normalized;

        if self.providers.is_empty() {
            self.providers = self.provider_symbols.keys().cloned().collect();
        }
    }

    /// Structural validation applied after normalization.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(EngineError::InvalidSpec {
                message: "instance id is required".to_string(),
            });
        }
        if self.strategy.identifier.is_empty() {
            return Err(EngineError::InvalidSpec {
                message: "strategy identifier is required".to_string(),
            });
        }
        if self.providers.is_empty() {
            return Err(EngineError::InvalidSpec {
                message: "at least one provider is required".to_string(),
            });
        }
        let symbol_count: usize = self
            .provider_symbols
            .values()
            .map(|symbols| symbols.symbols.len())
            .sum();
        if symbol_count == 0 {
            return Err(EngineError::InvalidSpec {
                message: "at least one symbol is required".to_string(),
            });
        }
        Ok(())
    }

    /// Enforce the update immutability rules against a proposed spec.
    pub fn ensure_update_compatible(&self, updated: &InstanceSpec) -> Result<()> {
        if self.providers != updated.providers {
            return Err(EngineError::SpecImmutable { field: "providers" });
        }
        if self.provider_symbols != updated.provider_symbols {
            return Err(EngineError::SpecImmutable {
                field: "provider symbols",
            });
        }
        if self.strategy.identifier != updated.strategy.identifier {
            return Err(EngineError::SpecImmutable {
                field: "strategy identifier",
            });
        }
        Ok(())
    }

    /// Symbols for one provider, normalized order preserved.
    pub fn symbols_for(&self, provider: &str) -> &[String] {
        self.provider_symbols
            .get(provider)
            .map(|symbols| symbols.symbols.as_slice())
            .unwrap_or(&[])
    }

    /// All symbols across providers, deduped in provider order.
    pub fn all_symbols(&self) -> Vec<String> {
        let mut all = Vec::new();
        for provider in &self.providers {
            for symbol in self.symbols_for(provider) {
                if !all.contains(symbol) {
                    all.push(symbol.clone());
                }
            }
        }
        all
    }
}
