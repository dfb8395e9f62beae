//! Cache storage.
//!
//! [`CacheEntry`] is the persisted form of a captured response.
//! [`MemoryGateway`] is an in-process [`CacheGateway`] with LRU eviction and
//! lazy expiry, used as the default backend and in tests.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::RwLock;

use async_trait::async_trait;
use axum::http::{
    HeaderMap, HeaderName,
    header::{CONNECTION, CONTENT_LENGTH, ETAG, SET_COOKIE, TRANSFER_ENCODING},
};
use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::config::DEFAULT_MEMORY_CAPACITY;
use super::gateway::{CacheGateway, GatewayError};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// Response headers never replayed from the cache. Cookies are per client,
/// framing headers are recomputed, and the etag is managed separately.
const UNCACHED_HEADERS: [HeaderName; 5] = [
    SET_COOKIE,
    CONTENT_LENGTH,
    TRANSFER_ENCODING,
    CONNECTION,
    ETAG,
];

// ============================================================================
// Cache entry
// ============================================================================

/// Captured response stored under a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    /// Replayable response headers in emission order, names lowercased.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl CacheEntry {
    pub fn encode(&self) -> Result<Bytes, GatewayError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(key: &str, raw: &[u8]) -> Result<Self, GatewayError> {
        serde_json::from_slice(raw).map_err(|err| GatewayError::decode(key, err))
    }

    /// Headers worth replaying on a hit. Values that are not visible ASCII
    /// are skipped.
    pub fn capture_headers(headers: &HeaderMap) -> Vec<(String, String)> {
        headers
            .iter()
            .filter(|(name, _)| !UNCACHED_HEADERS.contains(*name))
            .filter_map(|(name, value)| match value.to_str() {
                Ok(value) => Some((name.as_str().to_string(), value.to_string())),
                Err(_) => {
                    debug!(header = %name, "skipping non-ascii header value");
                    None
                }
            })
            .collect()
    }

    /// First stored value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(stored, _)| stored.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

mod body_base64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// In-memory gateway
// ============================================================================

struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// LRU-bounded in-memory backend.
///
/// Expired values are dropped when read. Capacity evictions are silent, the
/// same way an external cache server would evict. Pinned values live in a
/// separate map that neither expires nor counts against the capacity.
pub struct MemoryGateway {
    entries: RwLock<LruCache<String, StoredValue>>,
    pinned: RwLock<HashMap<String, Bytes>>,
}

impl MemoryGateway {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            pinned: RwLock::new(HashMap::new()),
        }
    }

    /// Create a gateway holding at most `capacity` values, clamping to 1 if zero.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
    }

    /// Number of stored values, including ones that expired but were not read
    /// yet and pinned ones.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len() + self.pinned_len()
    }

    pub fn pinned_len(&self) -> usize {
        rw_read(&self.pinned, SOURCE, "pinned_len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
        rw_write(&self.pinned, SOURCE, "clear").clear();
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

#[async_trait]
impl CacheGateway for MemoryGateway {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, GatewayError> {
        if let Some(value) = rw_read(&self.pinned, SOURCE, "get").get(key) {
            return Ok(Some(value.clone()));
        }

        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let found = entries
            .get(key)
            .map(|stored| (stored.value.clone(), stored.is_expired(now)));
        match found {
            Some((value, false)) => Ok(Some(value)),
            Some((_, true)) => {
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        expires_at: Option<Instant>,
    ) -> Result<(), GatewayError> {
        rw_write(&self.pinned, SOURCE, "set").remove(key);
        rw_write(&self.entries, SOURCE, "set")
            .put(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        rw_write(&self.pinned, SOURCE, "delete").remove(key);
        rw_write(&self.entries, SOURCE, "delete").pop(key);
        Ok(())
    }

    async fn set_pinned(&self, key: &str, value: Bytes) -> Result<(), GatewayError> {
        rw_write(&self.entries, SOURCE, "set_pinned").pop(key);
        rw_write(&self.pinned, SOURCE, "set_pinned").insert(key.to_string(), value);
        Ok(())
    }
}
