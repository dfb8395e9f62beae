//! Runtime bootstrap: logging, metric descriptions, settings.

pub mod error;
pub mod telemetry;

use std::path::Path;

use crate::cache::ResponseCache;
use crate::config::{Settings, load};

pub use self::error::InfraError;

/// Load settings, install telemetry and build an in-memory engine from them.
pub fn bootstrap(explicit: Option<&Path>) -> Result<(Settings, ResponseCache), InfraError> {
    let settings = load(explicit)?;
    telemetry::init(&settings.logging)?;
    let engine = ResponseCache::in_memory(settings.cache.clone());
    Ok((settings, engine))
}
