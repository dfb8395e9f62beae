use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_BYPASS, METRIC_HIT, METRIC_INVALIDATE_MS, METRIC_INVALIDATED, METRIC_MISS,
    METRIC_NOT_MODIFIED, METRIC_STORE, METRIC_STORE_ERROR,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every route cache metric. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_HIT,
            Unit::Count,
            "Cached responses served in full."
        );
        describe_counter!(
            METRIC_MISS,
            Unit::Count,
            "Requests with no live cache entry."
        );
        describe_counter!(
            METRIC_NOT_MODIFIED,
            Unit::Count,
            "Conditional requests answered with 304."
        );
        describe_counter!(
            METRIC_STORE,
            Unit::Count,
            "Responses written to the cache."
        );
        describe_counter!(
            METRIC_BYPASS,
            Unit::Count,
            "Requests or responses streamed past the cache because of size or framing."
        );
        describe_counter!(
            METRIC_STORE_ERROR,
            Unit::Count,
            "Cache writes that failed; the response was delivered uncached."
        );
        describe_counter!(
            METRIC_INVALIDATED,
            Unit::Count,
            "Entries deleted by tag invalidation."
        );
        describe_histogram!(
            METRIC_INVALIDATE_MS,
            Unit::Milliseconds,
            "Tag invalidation latency in milliseconds."
        );
    });
}
