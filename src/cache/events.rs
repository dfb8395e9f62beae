//! Cache lifecycle notifications.
//!
//! Every engine owns one [`EventChannel`]. Listeners are registered
//! explicitly and receive each [`CacheEvent`] synchronously, in publish order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::keys::{Fingerprint, RequestSnapshot};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::events";

/// Monotonic epoch for ordering events within one channel.
pub type Epoch = u64;

/// Cache event envelope.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    pub kind: EventKind,
    /// When the event was created.
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Identifies the request an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: String,
    pub path: String,
}

impl From<&RequestSnapshot> for RequestSummary {
    fn from(request: &RequestSnapshot) -> Self {
        Self {
            method: request.method.to_string(),
            path: request.path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A request entered a cached route.
    RequestReceived { request: RequestSummary },
    /// The request could not be fingerprinted; it was answered with 500.
    HashError {
        request: RequestSummary,
        error: String,
    },
    /// The cache read failed; the request was answered with 500.
    LookupFailed {
        request: RequestSummary,
        fingerprint: Fingerprint,
        error: String,
    },
    /// The client's etag matched; the request was answered with 304.
    EtagMatch {
        request: RequestSummary,
        fingerprint: Fingerprint,
    },
    /// A stored response was served.
    Served {
        request: RequestSummary,
        fingerprint: Fingerprint,
    },
    /// A freshly computed response was stored.
    Fresh {
        request: RequestSummary,
        fingerprint: Fingerprint,
    },
    /// Storing a freshly computed response failed; it was still delivered.
    StoreFailed {
        request: RequestSummary,
        fingerprint: Fingerprint,
        error: String,
    },
    /// Invalidation was requested through the engine.
    InvalidateRequested { tags: Vec<String> },
    /// A fingerprint filed under `tag` was deleted.
    Invalidated { tag: String, fingerprint: String },
}

pub type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Handle returned by [`EventChannel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscriber list shared by an engine and all of its bindings.
#[derive(Clone, Default)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

#[derive(Default)]
struct ChannelInner {
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    epoch_counter: AtomicU64,
    next_subscription: AtomicU64,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        rw_write(&self.inner.listeners, SOURCE, "subscribe").push((id, Arc::new(listener)));
        id
    }

    /// Returns false when `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = rw_write(&self.inner.listeners, SOURCE, "unsubscribe");
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        rw_read(&self.inner.listeners, SOURCE, "listener_count").len()
    }

    /// Get the next epoch number.
    pub fn next_epoch(&self) -> Epoch {
        self.inner.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Deliver `kind` to every listener.
    ///
    /// Listeners run outside the subscriber lock, so a listener may
    /// subscribe or publish without deadlocking.
    pub fn publish(&self, kind: EventKind) {
        let event = CacheEvent::new(kind, self.next_epoch());

        debug!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Route cache event published"
        );

        let listeners: Vec<Listener> = rw_read(&self.inner.listeners, SOURCE, "publish")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}
