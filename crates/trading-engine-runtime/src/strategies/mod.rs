//! Built-in reference strategies.
//!
//! These are the static strategy table entries consulted when an instance
//! binds a bare name with no matching dynamic module. They double as
//! reference implementations of the handler contract.

pub mod delay;
pub mod logging;

pub use delay::DelayStrategyFactory;
pub use logging::LoggingStrategyFactory;

use std::sync::Arc;

use crate::handler::StrategyFactory;

/// The built-in factory set registered by default.
pub fn builtin_factories() -> Vec<Arc<dyn StrategyFactory>> {
    vec![
        Arc::new(LoggingStrategyFactory),
        Arc::new(DelayStrategyFactory),
    ]
}
