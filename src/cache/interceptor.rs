//! Write-through capture of freshly computed responses.
//!
//! On a miss the middleware hands the downstream future to
//! [`ResponseInterceptor::wrap`]. The interceptor sees the emitted response
//! once, decides whether it is cacheable, persists it when it is, and always
//! delivers the same content to the caller.
//!
//! Bodies are only collected when their exact length is known and fits in
//! `max_entry_bytes`. Streams, event streams and oversized bodies pass
//! through untouched so the first byte reaches the client without waiting.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::{Body, HttpBody, to_bytes},
    http::{
        HeaderMap, StatusCode,
        header::{CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::CacheSettings;
use super::etag::attach_etag;
use super::events::{EventChannel, EventKind, RequestSummary};
use super::gateway::GatewayError;
use super::keys::{Fingerprint, RequestSnapshot};
use super::registry::TagIndex;
use super::store::CacheEntry;
use super::{METRIC_BYPASS, METRIC_STORE, METRIC_STORE_ERROR};

/// Response metadata offered to caching predicates.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Where a captured response ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptOutcome {
    /// Accepted by the predicate; a write was attempted and the response delivered.
    StoreAndDeliver,
    /// Rejected by the predicate, too large or streamed; delivered untouched.
    DeliverOnly,
}

pub struct ResponseInterceptor {
    settings: Arc<CacheSettings>,
    tags: TagIndex,
    events: EventChannel,
    request: RequestSnapshot,
    fingerprint: Fingerprint,
}

impl ResponseInterceptor {
    pub fn new(
        settings: Arc<CacheSettings>,
        tags: TagIndex,
        events: EventChannel,
        request: RequestSnapshot,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            settings,
            tags,
            events,
            request,
            fingerprint,
        }
    }

    /// Await the downstream emission and capture what it produces.
    pub async fn wrap<F>(self, emit: F) -> Response
    where
        F: Future<Output = Response>,
    {
        let response = emit.await;
        self.capture(response).await.0
    }

    pub async fn capture(self, response: Response) -> (Response, InterceptOutcome) {
        if let Some(reason) = self.bypass_reason(&response) {
            counter!(METRIC_BYPASS).increment(1);
            debug!(
                cache = "route",
                outcome = "bypass",
                reason,
                fingerprint = %self.fingerprint,
                "response streamed through uncached"
            );
            return (response, InterceptOutcome::DeliverOnly);
        }

        let (mut parts, body) = response.into_parts();
        let content = match to_bytes(body, self.settings.max_entry_bytes).await {
            Ok(content) => content,
            Err(err) => {
                warn!(
                    fingerprint = %self.fingerprint,
                    error = %err,
                    "failed to collect handler response body"
                );
                return (
                    StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                    InterceptOutcome::DeliverOnly,
                );
            }
        };

        let meta = ResponseMeta {
            status: parts.status,
            headers: parts.headers.clone(),
        };
        let storable = (self.settings.cache_query)(&self.request, &meta, &content[..]);

        if !storable {
            debug!(
                cache = "route",
                outcome = "skip",
                status = meta.status.as_u16(),
                body_bytes = content.len(),
                "response not cacheable"
            );
            return (
                Response::from_parts(parts, Body::from(content)),
                InterceptOutcome::DeliverOnly,
            );
        }

        match self.persist(&meta, content.clone()).await {
            Ok(etag) => {
                counter!(METRIC_STORE).increment(1);
                debug!(
                    cache = "route",
                    outcome = "stored",
                    fingerprint = %self.fingerprint,
                    ttl_ms = self.settings.ttl_ms(),
                    "caching response"
                );
                if let Some(etag) = etag.as_deref() {
                    attach_etag(&mut parts.headers, etag);
                }
                self.events.publish(EventKind::Fresh {
                    request: RequestSummary::from(&self.request),
                    fingerprint: self.fingerprint.clone(),
                });
            }
            Err(error) => {
                counter!(METRIC_STORE_ERROR).increment(1);
                warn!(
                    cache = "route",
                    fingerprint = %self.fingerprint,
                    error = %error,
                    "failed to store response; delivering uncached"
                );
                self.events.publish(EventKind::StoreFailed {
                    request: RequestSummary::from(&self.request),
                    fingerprint: self.fingerprint.clone(),
                    error: error.to_string(),
                });
            }
        }

        (
            Response::from_parts(parts, Body::from(content)),
            InterceptOutcome::StoreAndDeliver,
        )
    }

    /// Why a response must not be buffered, if it must not.
    fn bypass_reason(&self, response: &Response) -> Option<&'static str> {
        let limit = u64::try_from(self.settings.max_entry_bytes).unwrap_or(u64::MAX);
        let headers = response.headers();

        let event_stream = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.trim_start().starts_with("text/event-stream"));
        if event_stream {
            return Some("event_stream");
        }

        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        if declared.is_some_and(|length| length > limit) {
            return Some("oversized");
        }

        match HttpBody::size_hint(response.body()).exact() {
            None => Some("unknown_length"),
            Some(length) if length > limit => Some("oversized"),
            Some(_) => None,
        }
    }

    /// Tag, generate an etag, then write the entry. Returns the stored etag.
    async fn persist(&self, meta: &ResponseMeta, content: Bytes) -> Result<Option<String>, GatewayError> {
        for tag in self.settings.tags.resolve(&self.request) {
            self.tags.append(&tag, &self.fingerprint).await?;
        }

        let etag = if self.settings.etag {
            Some((self.settings.generate_etag)(
                &self.fingerprint,
                self.settings.as_ref(),
            )?)
        } else {
            None
        };

        let entry = CacheEntry {
            status: meta.status.as_u16(),
            headers: CacheEntry::capture_headers(&meta.headers),
            body: content,
            etag: etag.clone(),
        };
        let expires_at = Instant::now() + self.settings.ttl;
        self.settings
            .gateway
            .set(self.fingerprint.as_str(), entry.encode()?, Some(expires_at))
            .await?;
        Ok(etag)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::{
        Method,
        header::{CACHE_CONTROL, ETAG, SET_COOKIE},
    };
    use futures::stream;

    use super::*;
    use crate::cache::config::{CacheDefaults, CacheOptions};
    use crate::cache::gateway::CacheGateway;
    use crate::cache::store::MemoryGateway;

    struct Fixture {
        gateway: Arc<MemoryGateway>,
        settings: Arc<CacheSettings>,
        tags: TagIndex,
    }

    fn fixture(options: CacheOptions) -> Fixture {
        let gateway = Arc::new(MemoryGateway::default());
        let settings = Arc::new(
            CacheSettings::resolve(&CacheDefaults::default(), options, gateway.clone())
                .expect("valid settings"),
        );
        let tags = TagIndex::new(gateway.clone(), "it", EventChannel::new());
        Fixture {
            gateway,
            settings,
            tags,
        }
    }

    fn interceptor(fixture: &Fixture, fingerprint: &str) -> ResponseInterceptor {
        ResponseInterceptor::new(
            Arc::clone(&fixture.settings),
            fixture.tags.clone(),
            EventChannel::new(),
            RequestSnapshot::new(Method::GET, "/items"),
            Fingerprint::from(fingerprint.to_string()),
        )
    }

    fn response(status: StatusCode, body: &'static str) -> Response {
        (status, [(CONTENT_TYPE, "application/json")], body).into_response()
    }

    async fn body_of(response: Response) -> Bytes {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body")
    }

    #[tokio::test]
    async fn accepted_response_is_stored_and_delivered() {
        let fixture = fixture(CacheOptions::new().with_tag("items"));
        let (delivered, outcome) = interceptor(&fixture, "fp-1")
            .capture(response(StatusCode::OK, r#"{"n":1}"#))
            .await;

        assert_eq!(outcome, InterceptOutcome::StoreAndDeliver);
        let etag = delivered
            .headers()
            .get(ETAG)
            .expect("etag header")
            .to_str()
            .expect("ascii")
            .to_string();
        assert_eq!(body_of(delivered).await, Bytes::from_static(br#"{"n":1}"#));

        let raw = fixture.gateway.get("fp-1").await.expect("get").expect("stored");
        let entry = CacheEntry::decode("fp-1", &raw).expect("decode");
        assert_eq!(entry.body, Bytes::from_static(br#"{"n":1}"#));
        assert_eq!(entry.etag.as_deref(), Some(etag.as_str()));
        assert_eq!(entry.header("content-type"), Some("application/json"));
        assert_eq!(
            fixture.tags.fingerprints("items").await.expect("list"),
            vec!["fp-1".to_string()]
        );
    }

    #[tokio::test]
    async fn rejected_response_is_only_delivered() {
        let fixture = fixture(
            CacheOptions::new()
                .with_tag("items")
                .with_cache_query(|_, meta, _| meta.status == StatusCode::OK),
        );
        let (delivered, outcome) = interceptor(&fixture, "fp-2")
            .capture(response(StatusCode::ACCEPTED, "{}"))
            .await;

        assert_eq!(outcome, InterceptOutcome::DeliverOnly);
        assert_eq!(delivered.status(), StatusCode::ACCEPTED);
        assert!(delivered.headers().get(ETAG).is_none());
        assert!(fixture.gateway.get("fp-2").await.expect("get").is_none());
        assert!(fixture.tags.fingerprints("items").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn oversized_response_is_not_stored() {
        let fixture = fixture(CacheOptions::new().with_max_entry_bytes(4));
        let (delivered, outcome) = interceptor(&fixture, "fp-3")
            .capture(response(StatusCode::OK, "too large"))
            .await;

        assert_eq!(outcome, InterceptOutcome::DeliverOnly);
        assert_eq!(body_of(delivered).await, Bytes::from_static(b"too large"));
        assert!(fixture.gateway.is_empty());
    }

    #[tokio::test]
    async fn response_headers_are_stored_without_cookies() {
        let fixture = fixture(CacheOptions::new());
        let response = (
            [
                (CONTENT_TYPE, "text/plain"),
                (CACHE_CONTROL, "public, max-age=60"),
                (SET_COOKIE, "session=abc"),
            ],
            "hello",
        )
            .into_response();
        interceptor(&fixture, "fp-7").capture(response).await;

        let raw = fixture.gateway.get("fp-7").await.expect("get").expect("stored");
        let entry = CacheEntry::decode("fp-7", &raw).expect("decode");
        assert_eq!(entry.header("cache-control"), Some("public, max-age=60"));
        assert_eq!(entry.header("content-type"), Some("text/plain"));
        assert_eq!(entry.header("set-cookie"), None);
    }

    #[tokio::test]
    async fn unbounded_stream_is_passed_through_without_reading() {
        let fixture = fixture(CacheOptions::new());
        let endless = Body::from_stream(stream::pending::<Result<Bytes, std::io::Error>>());
        let response = Response::new(endless);

        let (delivered, outcome) = tokio::time::timeout(
            Duration::from_secs(5),
            interceptor(&fixture, "fp-8").capture(response),
        )
        .await
        .expect("capture must not wait for the body");

        assert_eq!(outcome, InterceptOutcome::DeliverOnly);
        assert_eq!(delivered.status(), StatusCode::OK);
        assert!(fixture.gateway.is_empty());
    }

    #[tokio::test]
    async fn event_stream_is_never_stored() {
        let fixture = fixture(CacheOptions::new());
        let response = ([(CONTENT_TYPE, "text/event-stream")], "data: 1\n\n").into_response();
        let (delivered, outcome) = interceptor(&fixture, "fp-9").capture(response).await;

        assert_eq!(outcome, InterceptOutcome::DeliverOnly);
        assert_eq!(body_of(delivered).await, Bytes::from_static(b"data: 1\n\n"));
        assert!(fixture.gateway.is_empty());
    }

    #[tokio::test]
    async fn declared_length_over_limit_skips_collection() {
        let fixture = fixture(CacheOptions::new().with_max_entry_bytes(4));
        let mut response = Response::new(Body::from_stream(stream::iter([Ok::<_, std::io::Error>(
            Bytes::from_static(b"abcdefgh"),
        )])));
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, "8".parse().expect("header"));

        let (delivered, outcome) = interceptor(&fixture, "fp-10").capture(response).await;
        assert_eq!(outcome, InterceptOutcome::DeliverOnly);
        assert_eq!(body_of(delivered).await, Bytes::from_static(b"abcdefgh"));
        assert!(fixture.gateway.is_empty());
    }

    #[tokio::test]
    async fn etag_disabled_stores_without_etag() {
        let fixture = fixture(CacheOptions::new().with_etag(false));
        let (delivered, _) = interceptor(&fixture, "fp-4")
            .capture(response(StatusCode::OK, "x"))
            .await;

        assert!(delivered.headers().get(ETAG).is_none());
        let raw = fixture.gateway.get("fp-4").await.expect("get").expect("stored");
        assert_eq!(CacheEntry::decode("fp-4", &raw).expect("decode").etag, None);
    }

    #[tokio::test]
    async fn failing_etag_generator_still_delivers() {
        let fixture = fixture(
            CacheOptions::new()
                .with_generate_etag(|_, _| Err(GatewayError::backend("no clock"))),
        );
        let (delivered, outcome) = interceptor(&fixture, "fp-5")
            .capture(response(StatusCode::OK, "payload"))
            .await;

        assert_eq!(outcome, InterceptOutcome::StoreAndDeliver);
        assert_eq!(delivered.status(), StatusCode::OK);
        assert!(delivered.headers().get(ETAG).is_none());
        assert_eq!(body_of(delivered).await, Bytes::from_static(b"payload"));
        assert!(fixture.gateway.get("fp-5").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn wrap_awaits_downstream_once() {
        let fixture = fixture(CacheOptions::new());
        let delivered = interceptor(&fixture, "fp-6")
            .wrap(async { response(StatusCode::OK, "wrapped") })
            .await;

        assert_eq!(body_of(delivered).await, Bytes::from_static(b"wrapped"));
        assert!(fixture.gateway.get("fp-6").await.expect("get").is_some());
    }
}
