//! Tag index.
//!
//! Each tag owns a JSON list of fingerprints pinned in the gateway at
//! `"{prefix}-{tag}"`, so capacity eviction of entries never drops a list
//! while the entries it indexes are still live. Writes append to the list; invalidation deletes every
//! listed fingerprint and then the list itself.
//!
//! Appends are read-modify-write without coordination. Two writers appending
//! under the same tag at the same moment can lose one append; the affected
//! entry then only leaves the cache through its TTL.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant as WallInstant;

use futures::future::join_all;
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{debug, warn};

use super::events::{EventChannel, EventKind};
use super::gateway::{CacheGateway, GatewayError, load_json, pin_json};
use super::keys::Fingerprint;
use super::{METRIC_INVALIDATE_MS, METRIC_INVALIDATED};

/// Invalidation stopped on a gateway error. `cleared` counts the
/// fingerprints deleted before and alongside the failure.
#[derive(Debug, Error)]
#[error("tag invalidation failed after clearing {cleared} entries: {source}")]
pub struct InvalidationError {
    pub cleared: usize,
    #[source]
    pub source: GatewayError,
}

/// Anything that names one or more tags.
pub trait IntoTags {
    fn into_tags(self) -> Vec<String>;
}

impl IntoTags for &str {
    fn into_tags(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoTags for String {
    fn into_tags(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoTags for &String {
    fn into_tags(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl IntoTags for Vec<String> {
    fn into_tags(self) -> Vec<String> {
        self
    }
}

impl IntoTags for Vec<&str> {
    fn into_tags(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl IntoTags for &[&str] {
    fn into_tags(self) -> Vec<String> {
        self.iter().map(|tag| tag.to_string()).collect()
    }
}

impl IntoTags for &[String] {
    fn into_tags(self) -> Vec<String> {
        self.to_vec()
    }
}

impl<const N: usize> IntoTags for [&str; N] {
    fn into_tags(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

#[derive(Default)]
struct TagOutcome {
    cleared: usize,
    error: Option<GatewayError>,
}

/// Tag → fingerprint index over a gateway.
#[derive(Clone)]
pub struct TagIndex {
    gateway: Arc<dyn CacheGateway>,
    prefix: String,
    events: EventChannel,
}

impl TagIndex {
    pub fn new(gateway: Arc<dyn CacheGateway>, prefix: impl Into<String>, events: EventChannel) -> Self {
        Self {
            gateway,
            prefix: prefix.into(),
            events,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Gateway key holding the fingerprint list of `tag`.
    pub fn store_key(&self, tag: &str) -> String {
        format!("{}-{}", self.prefix, tag)
    }

    /// Fingerprints currently filed under `tag`. A missing list is empty.
    pub async fn fingerprints(&self, tag: &str) -> Result<Vec<String>, GatewayError> {
        Ok(load_json(self.gateway.as_ref(), &self.store_key(tag))
            .await?
            .unwrap_or_default())
    }

    /// File `fingerprint` under `tag`. Returns false when it was already listed.
    pub async fn append(&self, tag: &str, fingerprint: &Fingerprint) -> Result<bool, GatewayError> {
        let mut listed = self.fingerprints(tag).await?;
        if listed.iter().any(|existing| existing == fingerprint.as_str()) {
            return Ok(false);
        }
        listed.push(fingerprint.to_string());
        pin_json(self.gateway.as_ref(), &self.store_key(tag), &listed).await?;
        debug!(tag, fingerprint = %fingerprint, listed = listed.len(), "fingerprint tagged");
        Ok(true)
    }

    /// Delete every fingerprint filed under `tags`.
    ///
    /// Tags are processed concurrently, as are the deletions within a tag.
    /// Returns the number of fingerprints deleted, whether or not their
    /// entries were still live.
    pub async fn invalidate(&self, tags: impl IntoTags) -> Result<usize, InvalidationError> {
        let started = WallInstant::now();
        let mut seen = HashSet::new();
        let tags: Vec<String> = tags
            .into_tags()
            .into_iter()
            .filter(|tag| seen.insert(tag.clone()))
            .collect();

        let outcomes = join_all(tags.iter().map(|tag| self.invalidate_tag(tag))).await;

        let mut cleared = 0;
        let mut failure = None;
        for outcome in outcomes {
            cleared += outcome.cleared;
            if let Some(error) = outcome.error {
                failure.get_or_insert(error);
            }
        }

        counter!(METRIC_INVALIDATED).increment(cleared as u64);
        histogram!(METRIC_INVALIDATE_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        match failure {
            None => {
                debug!(?tags, cleared, "tags invalidated");
                Ok(cleared)
            }
            Some(source) => Err(InvalidationError { cleared, source }),
        }
    }

    async fn invalidate_tag(&self, tag: &str) -> TagOutcome {
        let listed = match self.fingerprints(tag).await {
            Ok(listed) => listed,
            Err(error) => {
                warn!(tag, error = %error, "failed to load tag index");
                return TagOutcome {
                    cleared: 0,
                    error: Some(error),
                };
            }
        };

        let deletions = join_all(listed.iter().map(|fingerprint| async move {
            (fingerprint, self.gateway.delete(fingerprint).await)
        }))
        .await;

        let mut outcome = TagOutcome::default();
        for (fingerprint, result) in deletions {
            match result {
                Ok(()) => {
                    outcome.cleared += 1;
                    self.events.publish(EventKind::Invalidated {
                        tag: tag.to_string(),
                        fingerprint: fingerprint.clone(),
                    });
                }
                Err(error) => {
                    warn!(tag, fingerprint, error = %error, "failed to delete tagged entry");
                    outcome.error.get_or_insert(error);
                }
            }
        }

        // A partially cleared tag keeps its list so a retry can finish the job.
        if outcome.error.is_none() {
            if let Err(error) = self.gateway.delete(&self.store_key(tag)).await {
                warn!(tag, error = %error, "failed to clear tag index");
                outcome.error = Some(error);
            }
        }
        outcome
    }

    /// True when both indexes read and write the same lists.
    pub(crate) fn shares_store_with(&self, other: &TagIndex) -> bool {
        self.prefix == other.prefix
            && std::ptr::eq(
                Arc::as_ptr(&self.gateway).cast::<()>(),
                Arc::as_ptr(&other.gateway).cast::<()>(),
            )
    }
}
