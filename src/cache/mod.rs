//! Route response cache.
//!
//! Caches whole HTTP responses per route, keyed by a fingerprint of the
//! request:
//!
//! - **Fingerprint**: SHA-256 over a canonical JSON projection of the request
//!   (method, path, query, body by default)
//! - **Gateway**: pluggable async key/value backend with absolute expiry
//! - **Etag**: optional strong validator answering conditional requests with 304
//! - **Tags**: fingerprints filed under names that can be invalidated together
//!
//! ```ignore
//! let engine = ResponseCache::in_memory(CacheDefaults::default());
//! let binding = engine.bind(CacheOptions::from_duration("5m").with_tag("posts"))?;
//! let app = Router::new().route(
//!     "/posts",
//!     get(list_posts).layer(middleware::from_fn_with_state(binding, response_cache_layer)),
//! );
//! engine.invalidate("posts").await?;
//! ```

pub mod config;
mod engine;
pub mod etag;
mod events;
pub mod gateway;
mod interceptor;
pub mod keys;
mod lock;
mod middleware;
mod registry;
mod store;

pub use self::config::{CacheDefaults, CacheOptions, CacheSettings, ConfigError, TagSpec};
pub use engine::{CacheBinding, ResponseCache};
pub use events::{
    CacheEvent, Epoch, EventChannel, EventKind, Listener, RequestSummary, SubscriptionId,
};
pub use gateway::{CacheGateway, GatewayError, hash_json};
pub use interceptor::{InterceptOutcome, ResponseInterceptor, ResponseMeta};
pub use keys::{Fingerprint, RequestSnapshot, canonicalize, fingerprint};
pub use middleware::response_cache_layer;
pub use registry::{IntoTags, InvalidationError, TagIndex};
pub use store::{CacheEntry, MemoryGateway};

pub const METRIC_HIT: &str = "route_cache_hit_total";
pub const METRIC_MISS: &str = "route_cache_miss_total";
pub const METRIC_NOT_MODIFIED: &str = "route_cache_not_modified_total";
pub const METRIC_STORE: &str = "route_cache_store_total";
pub const METRIC_BYPASS: &str = "route_cache_bypass_total";
pub const METRIC_STORE_ERROR: &str = "route_cache_store_error_total";
pub const METRIC_INVALIDATED: &str = "route_cache_invalidated_total";
pub const METRIC_INVALIDATE_MS: &str = "route_cache_invalidate_ms";
