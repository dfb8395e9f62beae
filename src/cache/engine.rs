//! Engine handle and per-route bindings.
//!
//! [`ResponseCache::new`] returns a ready engine. Routes call
//! [`ResponseCache::bind`] once to obtain a [`CacheBinding`], which is the
//! state of [`response_cache_layer`](super::response_cache_layer).
//! Invalidation through the engine reaches every subscribed binding.

use std::sync::{Arc, RwLock};

use futures::future::join_all;
use tracing::info;

use super::config::{CacheDefaults, CacheOptions, CacheSettings, ConfigError};
use super::events::{EventChannel, EventKind};
use super::gateway::{CacheGateway, GatewayError};
use super::interceptor::ResponseInterceptor;
use super::keys::{Fingerprint, RequestSnapshot};
use super::lock::{rw_read, rw_write};
use super::registry::{IntoTags, InvalidationError, TagIndex};
use super::store::{CacheEntry, MemoryGateway};

const SOURCE: &str = "cache::engine";

#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    defaults: CacheDefaults,
    gateway: Arc<dyn CacheGateway>,
    events: EventChannel,
    /// One index per distinct (gateway, prefix) among subscribed bindings.
    subscribers: RwLock<Vec<TagIndex>>,
}

impl ResponseCache {
    pub fn new(gateway: Arc<dyn CacheGateway>, defaults: CacheDefaults) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                defaults,
                gateway,
                events: EventChannel::new(),
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Engine backed by a [`MemoryGateway`] sized from `defaults`.
    pub fn in_memory(defaults: CacheDefaults) -> Self {
        let gateway = Arc::new(MemoryGateway::new(defaults.memory_capacity_non_zero()));
        Self::new(gateway, defaults)
    }

    pub fn defaults(&self) -> &CacheDefaults {
        &self.inner.defaults
    }

    pub fn gateway(&self) -> &Arc<dyn CacheGateway> {
        &self.inner.gateway
    }

    pub fn events(&self) -> &EventChannel {
        &self.inner.events
    }

    /// Resolve `options` into a binding for one route.
    ///
    /// Invalid options are a programming error and are reported here, before
    /// any request is served.
    pub fn bind(&self, options: CacheOptions) -> Result<CacheBinding, ConfigError> {
        let settings = Arc::new(CacheSettings::resolve(
            &self.inner.defaults,
            options,
            Arc::clone(&self.inner.gateway),
        )?);
        let tags = TagIndex::new(
            Arc::clone(&settings.gateway),
            settings.tag_store_prefix.clone(),
            self.inner.events.clone(),
        );

        if settings.subscribe {
            let mut subscribers = rw_write(&self.inner.subscribers, SOURCE, "bind");
            if !subscribers
                .iter()
                .any(|existing| existing.shares_store_with(&tags))
            {
                subscribers.push(tags.clone());
            }
        }

        info!(
            duration = %settings.duration,
            ttl_ms = settings.ttl_ms(),
            etag = settings.etag,
            tags = ?settings.tags,
            subscribe = settings.subscribe,
            "Route cache bound"
        );

        Ok(CacheBinding {
            settings,
            tags,
            events: self.inner.events.clone(),
        })
    }

    /// Invalidate `tags` across every subscribed binding.
    ///
    /// Bindings sharing a gateway and tag-store prefix are invalidated once.
    pub async fn invalidate(&self, tags: impl IntoTags) -> Result<usize, InvalidationError> {
        let tags = tags.into_tags();
        self.inner.events.publish(EventKind::InvalidateRequested { tags: tags.clone() });

        let subscribers = rw_read(&self.inner.subscribers, SOURCE, "invalidate").clone();
        let outcomes = join_all(
            subscribers
                .iter()
                .map(|index| index.invalidate(tags.clone())),
        )
        .await;

        let mut cleared = 0;
        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                Ok(count) => cleared += count,
                Err(err) => {
                    cleared += err.cleared;
                    failure.get_or_insert(err.source);
                }
            }
        }

        info!(?tags, cleared, "Route cache invalidated");
        match failure {
            None => Ok(cleared),
            Some(source) => Err(InvalidationError { cleared, source }),
        }
    }
}

/// Caching bound to one route. Cheap to clone.
#[derive(Clone)]
pub struct CacheBinding {
    settings: Arc<CacheSettings>,
    tags: TagIndex,
    events: EventChannel,
}

impl CacheBinding {
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn tag_index(&self) -> &TagIndex {
        &self.tags
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Invalidate `tags` in this binding's tag store only.
    pub async fn invalidate(&self, tags: impl IntoTags) -> Result<usize, InvalidationError> {
        self.tags.invalidate(tags).await
    }

    /// Read the entry stored under `fingerprint`.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, GatewayError> {
        match self.settings.gateway.get(fingerprint.as_str()).await? {
            Some(raw) => CacheEntry::decode(fingerprint.as_str(), &raw).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn interceptor(
        &self,
        request: RequestSnapshot,
        fingerprint: Fingerprint,
    ) -> ResponseInterceptor {
        ResponseInterceptor::new(
            Arc::clone(&self.settings),
            self.tags.clone(),
            self.events.clone(),
            request,
            fingerprint,
        )
    }
}
