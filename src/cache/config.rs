//! Per-route cache settings.
//!
//! [`CacheOptions`] is what a route asks for, [`CacheDefaults`] is what the
//! engine was configured with, and [`CacheSettings`] is the immutable merge
//! of the two that a binding carries for its whole lifetime.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use super::etag::default_generate_etag;
use super::gateway::{CacheGateway, GatewayError};
use super::interceptor::ResponseMeta;
use super::keys::{Fingerprint, RequestSnapshot, default_projection};

pub const DEFAULT_DURATION: &str = "1h";
pub const DEFAULT_TAG_STORE_PREFIX: &str = "route-cache-tagstore";
pub const DEFAULT_MEMORY_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024;

pub type ProjectionFn = Arc<dyn Fn(&RequestSnapshot) -> Value + Send + Sync>;
pub type CacheQueryFn = Arc<dyn Fn(&RequestSnapshot, &ResponseMeta, &[u8]) -> bool + Send + Sync>;
pub type EtagFn =
    Arc<dyn Fn(&Fingerprint, &CacheSettings) -> Result<String, GatewayError> + Send + Sync>;
pub type TagFn = Arc<dyn Fn(&RequestSnapshot) -> String + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid cache duration `{spec}`: {reason}")]
    Duration { spec: String, reason: String },
    #[error("both `tag` and `tags` were supplied; use only one")]
    ConflictingTags,
    #[error("invalid cache option `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Engine-wide defaults, normally loaded through [`crate::config::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDefaults {
    pub duration: String,
    pub etag: bool,
    pub subscribe: bool,
    pub tag_store_prefix: String,
    /// Entry limit of the in-memory gateway.
    pub memory_capacity: usize,
    /// Responses with larger bodies are delivered but never stored.
    pub max_entry_bytes: usize,
    /// Requests with larger bodies skip the cache and go straight to the handler.
    pub max_request_bytes: usize,
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            duration: DEFAULT_DURATION.to_string(),
            etag: true,
            subscribe: true,
            tag_store_prefix: DEFAULT_TAG_STORE_PREFIX.to_string(),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl CacheDefaults {
    /// Memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Tag names a binding files its writes under.
#[derive(Clone, Default)]
pub enum TagSpec {
    #[default]
    None,
    Static(Vec<String>),
    /// Evaluated for every request that gets stored.
    Dynamic(TagFn),
}

impl TagSpec {
    pub fn from_fn<F>(tag: F) -> Self
    where
        F: Fn(&RequestSnapshot) -> String + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(tag))
    }

    pub fn resolve(&self, request: &RequestSnapshot) -> Vec<String> {
        match self {
            Self::None => Vec::new(),
            Self::Static(tags) => tags.clone(),
            Self::Dynamic(tag) => {
                let name = tag(request);
                if name.is_empty() {
                    Vec::new()
                } else {
                    vec![name]
                }
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Static(tags) if tags.iter().any(|tag| tag.trim().is_empty()) => {
                Err(ConfigError::invalid("tag", "tag names must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for TagSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Static(tags) => f.debug_tuple("Static").field(tags).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<&str> for TagSpec {
    fn from(tag: &str) -> Self {
        Self::Static(vec![tag.to_string()])
    }
}

impl From<String> for TagSpec {
    fn from(tag: String) -> Self {
        Self::Static(vec![tag])
    }
}

impl From<Vec<String>> for TagSpec {
    fn from(tags: Vec<String>) -> Self {
        Self::Static(tags)
    }
}

impl From<Vec<&str>> for TagSpec {
    fn from(tags: Vec<&str>) -> Self {
        Self::Static(tags.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for TagSpec {
    fn from(tags: [&str; N]) -> Self {
        Self::Static(tags.into_iter().map(str::to_string).collect())
    }
}

/// Options a route binds caching with. Unset fields fall back to
/// [`CacheDefaults`].
#[derive(Clone, Default)]
pub struct CacheOptions {
    pub duration: Option<String>,
    /// Backend for this binding; the engine's gateway when unset.
    pub gateway: Option<Arc<dyn CacheGateway>>,
    pub hash_object: Option<ProjectionFn>,
    pub etag: Option<bool>,
    pub cache_query: Option<CacheQueryFn>,
    pub generate_etag: Option<EtagFn>,
    pub tag: Option<TagSpec>,
    pub tags: Option<TagSpec>,
    pub tag_store_prefix: Option<String>,
    pub subscribe: Option<bool>,
    pub max_entry_bytes: Option<usize>,
    pub max_request_bytes: Option<usize>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_duration(duration: impl Into<String>) -> Self {
        Self::new().with_duration(duration)
    }

    pub fn from_options(options: CacheOptions) -> Self {
        options
    }

    /// `duration` wins over any duration already set on `options`.
    pub fn from_both(duration: impl Into<String>, options: CacheOptions) -> Self {
        options.with_duration(duration)
    }

    pub fn with_duration(mut self, duration: impl Into<String>) -> Self {
        self.duration = Some(duration.into());
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn CacheGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_hash_object<F>(mut self, projection: F) -> Self
    where
        F: Fn(&RequestSnapshot) -> Value + Send + Sync + 'static,
    {
        self.hash_object = Some(Arc::new(projection));
        self
    }

    pub fn with_etag(mut self, enabled: bool) -> Self {
        self.etag = Some(enabled);
        self
    }

    pub fn with_cache_query<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestSnapshot, &ResponseMeta, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.cache_query = Some(Arc::new(predicate));
        self
    }

    pub fn with_generate_etag<F>(mut self, generate: F) -> Self
    where
        F: Fn(&Fingerprint, &CacheSettings) -> Result<String, GatewayError> + Send + Sync + 'static,
    {
        self.generate_etag = Some(Arc::new(generate));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<TagSpec>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_tags(mut self, tags: impl Into<TagSpec>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    pub fn with_tag_store_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tag_store_prefix = Some(prefix.into());
        self
    }

    pub fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = Some(subscribe);
        self
    }

    pub fn with_max_entry_bytes(mut self, limit: usize) -> Self {
        self.max_entry_bytes = Some(limit);
        self
    }

    pub fn with_max_request_bytes(mut self, limit: usize) -> Self {
        self.max_request_bytes = Some(limit);
        self
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("duration", &self.duration)
            .field("etag", &self.etag)
            .field("tag", &self.tag)
            .field("tags", &self.tags)
            .field("tag_store_prefix", &self.tag_store_prefix)
            .field("subscribe", &self.subscribe)
            .field("max_entry_bytes", &self.max_entry_bytes)
            .field("max_request_bytes", &self.max_request_bytes)
            .finish_non_exhaustive()
    }
}

/// Resolved settings of one binding.
#[derive(Clone)]
pub struct CacheSettings {
    /// Duration as written by the caller.
    pub duration: String,
    pub ttl: Duration,
    pub tags: TagSpec,
    pub hash_object: ProjectionFn,
    pub etag: bool,
    pub cache_query: CacheQueryFn,
    pub generate_etag: EtagFn,
    pub tag_store_prefix: String,
    pub subscribe: bool,
    pub max_entry_bytes: usize,
    pub max_request_bytes: usize,
    pub gateway: Arc<dyn CacheGateway>,
}

impl CacheSettings {
    pub fn resolve(
        defaults: &CacheDefaults,
        options: CacheOptions,
        gateway: Arc<dyn CacheGateway>,
    ) -> Result<Self, ConfigError> {
        let duration = options
            .duration
            .unwrap_or_else(|| defaults.duration.clone());
        let ttl = parse_duration(&duration)?;

        let tags = match (options.tag, options.tags) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingTags),
            (Some(spec), None) | (None, Some(spec)) => spec,
            (None, None) => TagSpec::None,
        };
        tags.validate()?;

        let tag_store_prefix = options
            .tag_store_prefix
            .unwrap_or_else(|| defaults.tag_store_prefix.clone());
        if tag_store_prefix.trim().is_empty() {
            return Err(ConfigError::invalid(
                "tag_store_prefix",
                "must not be empty",
            ));
        }

        Ok(Self {
            duration,
            ttl,
            tags,
            hash_object: options.hash_object.unwrap_or_else(default_hash_object),
            etag: options.etag.unwrap_or(defaults.etag),
            cache_query: options.cache_query.unwrap_or_else(default_cache_query_fn),
            generate_etag: options.generate_etag.unwrap_or_else(default_etag_fn),
            tag_store_prefix,
            subscribe: options.subscribe.unwrap_or(defaults.subscribe),
            max_entry_bytes: options.max_entry_bytes.unwrap_or(defaults.max_entry_bytes),
            max_request_bytes: options
                .max_request_bytes
                .unwrap_or(defaults.max_request_bytes),
            gateway: options.gateway.unwrap_or(gateway),
        })
    }

    /// TTL in whole milliseconds, saturating at `u64::MAX`.
    pub fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }
}

impl fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSettings")
            .field("duration", &self.duration)
            .field("ttl", &self.ttl)
            .field("tags", &self.tags)
            .field("etag", &self.etag)
            .field("tag_store_prefix", &self.tag_store_prefix)
            .field("subscribe", &self.subscribe)
            .field("max_entry_bytes", &self.max_entry_bytes)
            .field("max_request_bytes", &self.max_request_bytes)
            .finish_non_exhaustive()
    }
}

fn default_hash_object() -> ProjectionFn {
    Arc::new(default_projection)
}

fn default_cache_query_fn() -> CacheQueryFn {
    Arc::new(default_cache_query)
}

fn default_etag_fn() -> EtagFn {
    Arc::new(default_generate_etag)
}

/// Only successful responses are stored unless a binding says otherwise.
pub fn default_cache_query(_: &RequestSnapshot, response: &ResponseMeta, _: &[u8]) -> bool {
    response.status.is_success()
}

/// Parse a human duration such as `"90s"`, `"2 seconds"` or `"1h 30m"`.
pub fn parse_duration(spec: &str) -> Result<Duration, ConfigError> {
    let compact: String = spec.split_whitespace().collect();
    let ttl = humantime::parse_duration(&compact).map_err(|err| ConfigError::Duration {
        spec: spec.to_string(),
        reason: err.to_string(),
    })?;
    if ttl.is_zero() {
        return Err(ConfigError::Duration {
            spec: spec.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(ttl)
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, Method, StatusCode};

    use super::*;
    use crate::cache::store::MemoryGateway;

    fn resolve(options: CacheOptions) -> Result<CacheSettings, ConfigError> {
        CacheSettings::resolve(
            &CacheDefaults::default(),
            options,
            Arc::new(MemoryGateway::default()),
        )
    }

    #[test]
    fn default_values() {
        let defaults = CacheDefaults::default();
        assert_eq!(defaults.duration, "1h");
        assert!(defaults.etag);
        assert!(defaults.subscribe);
        assert_eq!(defaults.tag_store_prefix, "route-cache-tagstore");
        assert_eq!(defaults.memory_capacity, 1024);
        assert_eq!(defaults.max_request_bytes, 1024 * 1024);
    }

    #[test]
    fn ttl_ms_saturates_instead_of_truncating() {
        let mut settings = resolve(CacheOptions::from_duration("1s")).expect("valid settings");
        settings.ttl = Duration::MAX;
        assert_eq!(settings.ttl_ms(), u64::MAX);
    }

    #[test]
    fn body_limits_fall_back_to_defaults() {
        let settings =
            resolve(CacheOptions::new().with_max_request_bytes(64)).expect("valid settings");
        assert_eq!(settings.max_request_bytes, 64);
        assert_eq!(settings.max_entry_bytes, DEFAULT_MAX_ENTRY_BYTES);
    }

    #[test]
    fn no_options_uses_defaults() {
        let settings = resolve(CacheOptions::new()).expect("valid settings");
        assert_eq!(settings.ttl_ms(), 60 * 60 * 1000);
        assert!(settings.etag);
        assert!(matches!(settings.tags, TagSpec::None));
    }

    #[test]
    fn parses_supported_units() {
        let cases = [
            ("250ms", 250),
            ("1s", 1_000),
            ("2 seconds", 2_000),
            ("3000ms", 3_000),
            ("5m", 300_000),
            ("1h 30m", 5_400_000),
            ("2 days", 172_800_000),
            ("1w", 604_800_000),
        ];
        for (spec, expected) in cases {
            assert_eq!(
                parse_duration(spec).expect(spec).as_millis(),
                expected,
                "duration {spec}"
            );
        }
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(matches!(
            parse_duration("soon"),
            Err(ConfigError::Duration { .. })
        ));
        assert!(matches!(parse_duration("0s"), Err(ConfigError::Duration { .. })));
        assert!(matches!(
            resolve(CacheOptions::from_duration("")),
            Err(ConfigError::Duration { .. })
        ));
    }

    #[test]
    fn duration_argument_overrides_options() {
        let options = CacheOptions::new().with_duration("1h").with_etag(false);
        let settings = resolve(CacheOptions::from_both("1s", options)).expect("valid settings");
        assert_eq!(settings.ttl_ms(), 1_000);
        assert!(!settings.etag);
    }

    #[test]
    fn options_only_keeps_default_duration() {
        let settings = resolve(CacheOptions::from_options(
            CacheOptions::new().with_tag("posts"),
        ))
        .expect("valid settings");
        assert_eq!(settings.duration, DEFAULT_DURATION);
        assert_eq!(
            settings
                .tags
                .resolve(&RequestSnapshot::new(Method::GET, "/")),
            vec!["posts".to_string()]
        );
    }

    #[test]
    fn tag_and_tags_conflict() {
        let options = CacheOptions::new().with_tag("a").with_tags(["b", "c"]);
        assert!(matches!(resolve(options), Err(ConfigError::ConflictingTags)));
    }

    #[test]
    fn empty_tag_is_rejected() {
        let options = CacheOptions::new().with_tags(["ok", " "]);
        assert!(matches!(
            resolve(options),
            Err(ConfigError::Invalid { key: "tag", .. })
        ));
    }

    #[test]
    fn empty_prefix_is_rejected() {
        let options = CacheOptions::new().with_tag_store_prefix("");
        assert!(matches!(
            resolve(options),
            Err(ConfigError::Invalid {
                key: "tag_store_prefix",
                ..
            })
        ));
    }

    #[test]
    fn dynamic_tag_is_evaluated_per_request() {
        let spec = TagSpec::from_fn(|request: &RequestSnapshot| {
            request.param("tag").unwrap_or_default().to_string()
        });
        let foo = RequestSnapshot::new(Method::GET, "/t/foo").with_param("tag", "foo");
        let bar = RequestSnapshot::new(Method::GET, "/t/bar").with_param("tag", "bar");
        let none = RequestSnapshot::new(Method::GET, "/t");

        assert_eq!(spec.resolve(&foo), vec!["foo".to_string()]);
        assert_eq!(spec.resolve(&bar), vec!["bar".to_string()]);
        assert!(spec.resolve(&none).is_empty());
    }

    #[test]
    fn default_predicate_accepts_only_success() {
        let request = RequestSnapshot::new(Method::GET, "/");
        let meta = |status| ResponseMeta {
            status,
            headers: HeaderMap::new(),
        };
        assert!(default_cache_query(&request, &meta(StatusCode::OK), b""));
        assert!(default_cache_query(&request, &meta(StatusCode::ACCEPTED), b""));
        assert!(!default_cache_query(
            &request,
            &meta(StatusCode::NOT_FOUND),
            b""
        ));
        assert!(!default_cache_query(
            &request,
            &meta(StatusCode::INTERNAL_SERVER_ERROR),
            b""
        ));
    }

    #[test]
    fn memory_capacity_clamps_to_one() {
        let defaults = CacheDefaults {
            memory_capacity: 0,
            ..Default::default()
        };
        assert_eq!(defaults.memory_capacity_non_zero().get(), 1);
    }
}
