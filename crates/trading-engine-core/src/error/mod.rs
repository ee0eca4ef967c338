//! # Error Handling for the Trading Engine Core
//!
//! This module provides the error framework shared by every subsystem of the
//! pipeline:
//!
//! 1. **Structured error types**: every failure mode is a variant of
//!    [`EngineError`] with the context needed to act on it
//! 2. **Error categorization**: errors classify into the taxonomy used by the
//!    control plane (user input, lifecycle, transient, contract, internal)
//! 3. **Module diagnostics**: staged, position-carrying diagnostics for
//!    strategy module compilation failures
//!
//! User-input and lifecycle errors surface through return values and leave
//! system state unchanged. Background failures surface through the
//! supervisor's error stream. Resource-contract violations (a double recycle
//! in debug mode) are programmer errors and abort the offending task.

pub mod types;

pub use types::{DiagnosticStage, EngineError, ModuleDiagnostic};

use serde::{Deserialize, Serialize};

/// Result type used across the engine crates.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error categories for classification and handling.
///
/// The category determines the propagation policy: user and lifecycle errors
/// go back to the caller untouched, transient errors are retriable at the
/// caller's discretion, contract violations are fatal to the offending task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Invalid specs, unknown selectors, malformed module source
    UserInput,
    /// Already running, not running, duplicate id
    Lifecycle,
    /// Provider subscribe failures, order-router failures
    Transient,
    /// Resource-contract violations (recycler misuse, pool exhaustion)
    Contract,
    /// Everything else
    Internal,
}

impl EngineError {
    /// Classify this error into the propagation taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::InvalidSpec { .. }
            | EngineError::SpecImmutable { .. }
            | EngineError::ModuleNotFound { .. }
            | EngineError::UnknownTag { .. }
            | EngineError::HashBelongsToDifferentName { .. }
            | EngineError::MetadataInvalid { .. }
            | EngineError::InvalidRoute { .. }
            | EngineError::NoProvidersConfigured => ErrorCategory::UserInput,

            EngineError::InstanceExists { .. }
            | EngineError::InstanceNotFound { .. }
            | EngineError::InstanceAlreadyRunning { .. }
            | EngineError::InstanceNotRunning { .. }
            | EngineError::RevisionInUse { .. } => ErrorCategory::Lifecycle,

            EngineError::ProviderUnavailable { .. }
            | EngineError::ProviderRegisterFailed { .. }
            | EngineError::RiskCheckFailed { .. }
            | EngineError::RegistryUnavailable { .. } => ErrorCategory::Transient,

            EngineError::PoolExhausted { .. } | EngineError::BusClosed => {
                ErrorCategory::Contract
            }

            _ => ErrorCategory::Internal,
        }
    }

    /// Whether a caller may reasonably retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }
}
