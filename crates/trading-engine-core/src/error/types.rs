//! Primary error type for all trading engine operations.
//!
//! All errors are variants of the main [`EngineError`] enum, which provides
//! detailed context for different failure modes.
//!
//! ## Error Groups
//!
//! ### Instance Lifecycle
//! - [`EngineError::InstanceExists`] - duplicate instance id on create
//! - [`EngineError::InstanceNotFound`] - unknown instance id
//! - [`EngineError::InstanceAlreadyRunning`] / [`EngineError::InstanceNotRunning`]
//!
//! ### Registry & Revisions
//! - [`EngineError::ModuleNotFound`] - selector resolves to nothing
//! - [`EngineError::UnknownTag`] - tag not present for the named strategy
//! - [`EngineError::RevisionInUse`] - removal blocked by a running instance
//! - [`EngineError::MetadataInvalid`] - staged module compilation diagnostics
//!
//! ### Distribution & Routing
//! - [`EngineError::BusClosed`] - publish after shutdown
//! - [`EngineError::PoolExhausted`] - bounded pool has no free objects
//! - [`EngineError::InvalidRoute`] - route validation failure
//! - [`EngineError::ProviderRegisterFailed`] - best-effort provider bridge failure

use serde::{Deserialize, Serialize};

/// Compilation stage a module diagnostic originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticStage {
    /// Source could not be parsed
    Compile,
    /// Source parsed but evaluation raised
    Execute,
    /// Module evaluated but its metadata is missing or invalid
    Validation,
}

/// Maximum length of a diagnostic message after stack-suffix pruning.
pub const DIAGNOSTIC_MESSAGE_LIMIT: usize = 256;

/// A single structured diagnostic from strategy module loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDiagnostic {
    /// Stage the failure was detected in
    pub stage: DiagnosticStage,
    /// Human-readable message, truncated to [`DIAGNOSTIC_MESSAGE_LIMIT`]
    pub message: String,
    /// 1-based source line, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// 1-based source column, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    /// Offending metadata field path, e.g. `metadata.events[0]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Suggested fix, when one is obvious
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ModuleDiagnostic {
    /// Build a diagnostic, pruning stack-trace suffixes and truncating the
    /// message to the documented limit.
    pub fn new(stage: DiagnosticStage, message: impl Into<String>) -> Self {
        let raw: String = message.into();
        let pruned = match raw.find("\n    at ") {
            Some(idx) => &raw[..idx],
            None => raw.as_str(),
        };
        let mut message: String = pruned.chars().take(DIAGNOSTIC_MESSAGE_LIMIT).collect();
        if pruned.chars().count() > DIAGNOSTIC_MESSAGE_LIMIT {
            message.push('…');
        }
        Self {
            stage,
            message,
            line: None,
            column: None,
            field: None,
            hint: None,
        }
    }

    pub fn with_position(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl std::fmt::Display for ModuleDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => {
                write!(f, "[{:?}] {}:{}: {}", self.stage, line, column, self.message)
            }
            _ => write!(f, "[{:?}] {}", self.stage, self.message),
        }
    }
}

/// Primary error type for all trading engine core operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// An instance with the given id is already registered.
    #[error("instance already exists: {id}")]
    InstanceExists {
        /// Duplicate instance id
        id: String,
    },

    /// No instance with the given id is registered.
    #[error("instance not found: {id}")]
    InstanceNotFound {
        /// Unknown instance id
        id: String,
    },

    /// Start was requested for an instance that is already running.
    #[error("instance already running: {id}")]
    InstanceAlreadyRunning { id: String },

    /// Stop was requested for an instance that is not running.
    #[error("instance not running: {id}")]
    InstanceNotRunning { id: String },

    /// The strategy selector did not resolve to a stored module.
    #[error("strategy module not found: {selector}")]
    ModuleNotFound {
        /// Canonical form of the selector that failed to resolve
        selector: String,
    },

    /// The named tag does not exist for the strategy.
    #[error("unknown tag {tag:?} for strategy {name:?}")]
    UnknownTag { name: String, tag: String },

    /// A `name@hash` selector referenced a hash stored under a different name.
    #[error("hash {hash} does not belong to strategy {name:?}")]
    HashBelongsToDifferentName { name: String, hash: String },

    /// Removal would cover a revision pinned by a running instance.
    #[error("revision in use: {selector} (pinned by {instances:?})")]
    RevisionInUse {
        /// Selector whose removal was rejected
        selector: String,
        /// Ids of the instances pinning the revision
        instances: Vec<String>,
    },

    /// The dynamic module registry is not configured or not reachable.
    #[error("strategy registry unavailable: {message}")]
    RegistryUnavailable { message: String },

    /// Route validation failure on upsert.
    #[error("invalid route: {message}")]
    InvalidRoute { message: String },

    /// A referenced provider is not present in the provider catalog.
    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    /// The provider bridge rejected a subscribe/unsubscribe; the dispatch
    /// table was left unchanged and the operation may be retried.
    #[error("provider register failed for {provider}: {message}")]
    ProviderRegisterFailed { provider: String, message: String },

    /// An order was rejected by the risk manager before routing.
    #[error("risk check failed: {reason}")]
    RiskCheckFailed { reason: String },

    /// Strategy module source failed compilation or metadata validation.
    #[error("module metadata invalid: {}", format_diagnostics(diagnostics))]
    MetadataInvalid {
        /// Staged diagnostics, first entry is the primary failure
        diagnostics: Vec<ModuleDiagnostic>,
    },

    /// Publish or subscribe after the bus was shut down.
    #[error("event bus is closed")]
    BusClosed,

    /// A bounded object pool has reached its live-object ceiling.
    #[error("object pool exhausted: {resource}")]
    PoolExhausted {
        /// Pooled resource name, e.g. `event`
        resource: &'static str,
    },

    /// Provider selection was attempted on an instance with no providers.
    #[error("no providers configured")]
    NoProvidersConfigured,

    /// Structural validation of an instance spec failed.
    #[error("invalid instance spec: {message}")]
    InvalidSpec { message: String },

    /// An update attempted to change an immutable spec field.
    #[error("{field} are immutable")]
    SpecImmutable {
        /// Offending field, e.g. `providers`
        field: &'static str,
    },

    /// Data (de)serialization failure.
    #[error("serialization error: {message}")]
    SerializationError { message: String },

    /// Filesystem failure in the registry store.
    #[error("io error: {message}")]
    IoError { message: String },

    /// Unexpected runtime failure that fits no other variant.
    #[error("runtime error: {message}")]
    RuntimeError { message: String },
}

fn format_diagnostics(diagnostics: &[ModuleDiagnostic]) -> String {
    match diagnostics.first() {
        Some(first) if diagnostics.len() == 1 => first.to_string(),
        Some(first) => format!("{} (+{} more)", first, diagnostics.len() - 1),
        None => "no diagnostics".to_string(),
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::SerializationError {
            message: error.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        EngineError::IoError {
            message: error.to_string(),
        }
    }
}
