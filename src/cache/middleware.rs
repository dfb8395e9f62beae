//! Route response cache middleware.
//!
//! Fingerprints the request, serves a stored response or a 304 when one
//! applies, and otherwise runs the handler through the response interceptor.
//! Request bodies larger than `max_request_bytes` are not fingerprinted; the
//! request reaches the handler with its body intact and nothing is cached.
//! Attach it per route so path parameters are visible:
//!
//! ```ignore
//! let binding = engine.bind(CacheOptions::from_duration("5m"))?;
//! let route = get(handler).layer(middleware::from_fn_with_state(binding, response_cache_layer));
//! ```

use std::collections::BTreeMap;

use axum::{
    body::{Body, HttpBody},
    extract::{FromRequestParts, RawPathParams, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use metrics::counter;
use tracing::{debug, error, instrument};

use super::engine::CacheBinding;
use super::etag::{self, Negotiation};
use super::events::{EventKind, RequestSummary};
use super::keys::{RequestSnapshot, fingerprint};
use super::{METRIC_BYPASS, METRIC_HIT, METRIC_MISS, METRIC_NOT_MODIFIED};

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(binding): State<CacheBinding>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let settings = binding.settings();
    let events = binding.events();

    let (mut parts, body) = request.into_parts();
    let params: BTreeMap<String, String> = RawPathParams::from_request_parts(&mut parts, &())
        .await
        .map(|params| {
            params
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let limit = settings.max_request_bytes;
    if HttpBody::size_hint(&body).lower() > u64::try_from(limit).unwrap_or(u64::MAX) {
        return bypass(Request::from_parts(parts, body), next).await;
    }

    let body = match buffer_request_body(body, limit).await {
        Ok(RequestBody::Buffered(body)) => body,
        Ok(RequestBody::Oversized(body)) => {
            return bypass(Request::from_parts(parts, body), next).await;
        }
        Err(err) => {
            let request = RequestSnapshot::new(parts.method.clone(), parts.uri.path());
            error!(error = %err, "failed to read request body for fingerprinting");
            events.publish(EventKind::HashError {
                request: RequestSummary::from(&request),
                error: err.to_string(),
            });
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let snapshot = RequestSnapshot::from_parts(&parts, params, &body);
    let summary = RequestSummary::from(&snapshot);
    events.publish(EventKind::RequestReceived {
        request: summary.clone(),
    });

    let fingerprint = match fingerprint(settings, &snapshot) {
        Ok(fingerprint) => fingerprint,
        Err(err) => {
            error!(error = %err, "failed to fingerprint request");
            events.publish(EventKind::HashError {
                request: summary,
                error: err.to_string(),
            });
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let cached = match binding.lookup(&fingerprint).await {
        Ok(cached) => cached,
        Err(err) => {
            error!(fingerprint = %fingerprint, error = %err, "cache lookup failed");
            events.publish(EventKind::LookupFailed {
                request: summary,
                fingerprint,
                error: err.to_string(),
            });
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match cached {
        Some(entry) => match etag::negotiate(settings, &snapshot.headers, &entry) {
            Negotiation::NotModified => {
                counter!(METRIC_NOT_MODIFIED).increment(1);
                debug!(cache = "route", outcome = "not_modified", fingerprint = %fingerprint, "etag matched");
                events.publish(EventKind::EtagMatch {
                    request: summary,
                    fingerprint,
                });
                etag::not_modified(&entry)
            }
            Negotiation::Serve => {
                counter!(METRIC_HIT).increment(1);
                debug!(cache = "route", outcome = "hit", fingerprint = %fingerprint, "serving cached response");
                events.publish(EventKind::Served {
                    request: summary,
                    fingerprint,
                });
                etag::serve(entry, settings.etag)
            }
        },
        None => {
            counter!(METRIC_MISS).increment(1);
            debug!(cache = "route", outcome = "miss", fingerprint = %fingerprint, "cache miss, executing handler");
            let request = Request::from_parts(parts, Body::from(body));
            binding
                .interceptor(snapshot, fingerprint)
                .wrap(next.run(request))
                .await
        }
    }
}

async fn bypass(request: Request<Body>, next: Next) -> Response {
    counter!(METRIC_BYPASS).increment(1);
    debug!(
        cache = "route",
        outcome = "bypass",
        reason = "request_too_large",
        "request body over limit, executing handler uncached"
    );
    next.run(request).await
}

enum RequestBody {
    Buffered(Bytes),
    /// Limit exceeded; the chunks read so far are stitched back in front of the rest.
    Oversized(Body),
}

async fn buffer_request_body(body: Body, limit: usize) -> Result<RequestBody, axum::Error> {
    let mut chunks = body.into_data_stream();
    let mut buffered = BytesMut::new();

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if buffered.len().saturating_add(chunk.len()) > limit {
            let head = stream::iter([Ok(buffered.freeze()), Ok(chunk)]);
            return Ok(RequestBody::Oversized(Body::from_stream(head.chain(chunks))));
        }
        buffered.extend_from_slice(&chunk);
    }

    Ok(RequestBody::Buffered(buffered.freeze()))
}
