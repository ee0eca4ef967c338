//! Strategy selector grammar.
//!
//! A selector names a strategy revision in one of four forms:
//!
//! - `name` — the name's `latest` tag
//! - `name:tag` — a specific tag alias
//! - `name@hash` — a specific revision, which must belong to the name
//! - `sha256:<64-hex>` or bare 64-hex — a revision by hash alone
//!
//! Hashes canonicalize to `sha256:<64 lowercase hex>`. Names lowercase on
//! parse so `Delay` and `delay` address the same strategy.

use serde::{Deserialize, Serialize};

use trading_engine_core::error::{EngineError, Result};

/// Parsed form of a strategy selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Bare name, resolving through the `latest` tag
    Name(String),
    /// Name-scoped tag alias
    NameTag { name: String, tag: String },
    /// Name-qualified revision hash
    NameHash { name: String, hash: String },
    /// Revision hash alone, any name
    Hash(String),
}

impl Selector {
    /// Parse and normalize a selector string.
    pub fn parse(input: &str) -> Result<Selector> {
        let input = input.trim();
        if input.is_empty() {
            return Err(EngineError::InvalidSpec {
                message: "selector must not be empty".to_string(),
            });
        }

        if let Some((name, hash)) = input.split_once('@') {
            let name = normalize_name(name)?;
            let hash = normalize_hash(hash).ok_or_else(|| EngineError::InvalidSpec {
                message: format!("selector {input:?}: malformed revision hash"),
            })?;
            return Ok(Selector::NameHash { name, hash });
        }

        if let Some(hash) = normalize_hash(input) {
            return Ok(Selector::Hash(hash));
        }

        if let Some((name, tag)) = input.split_once(':') {
            let name = normalize_name(name)?;
            if tag.trim().is_empty() {
                return Err(EngineError::InvalidSpec {
                    message: format!("selector {input:?}: empty tag"),
                });
            }
            return Ok(Selector::NameTag {
                name,
                tag: tag.trim().to_string(),
            });
        }

        Ok(Selector::Name(normalize_name(input)?))
    }

    /// Canonical string form of this selector.
    pub fn canonical(&self) -> String {
        match self {
            Selector::Name(name) => name.clone(),
            Selector::NameTag { name, tag } => format!("{name}:{tag}"),
            Selector::NameHash { name, hash } => format!("{name}@{hash}"),
            Selector::Hash(hash) => hash.clone(),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Outcome of resolving a selector against the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Strategy name the revision belongs to
    pub name: String,
    /// Canonical `sha256:<hex>` revision hash
    pub hash: String,
    /// Tag the selector went through; empty for hash-pinned selectors
    pub tag: String,
    /// Canonical selector string
    pub selector: String,
}

fn normalize_name(raw: &str) -> Result<String> {
    let name = raw.trim().to_lowercase();
    if name.is_empty() {
        return Err(EngineError::InvalidSpec {
            message: "strategy name must not be empty".to_string(),
        });
    }
    Ok(name)
}

/// Canonicalize `sha256:<hex>` or bare 64-hex; `None` when not a hash.
pub fn normalize_hash(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let digits = raw.strip_prefix("sha256:").unwrap_or(raw);
    if digits.len() == 64 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("sha256:{}", digits.to_lowercase()))
    } else {
        None
    }
}
