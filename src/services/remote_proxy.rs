//! Streams remote media through this service, answering range requests even
//! when the origin ignores them.

use crate::services::{
    delivery_service::{DEFAULT_CONTENT_TYPE, MEDIA_CACHE_CONTROL},
    http_range::{
        RangeRequest, content_range, if_range_matches, parse_range, range_len, unsatisfied_range,
    },
};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use futures::{Stream, StreamExt, ready};
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Request headers relayed to the origin.
const FORWARDED_HEADERS: [HeaderName; 5] = [
    header::RANGE,
    header::IF_RANGE,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
    header::ACCEPT,
];

/// Connection-scoped headers that must not be relayed back to the client.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to build upstream client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("upstream request to {url} failed: {source}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RemoteMediaProxy {
    client: reqwest::Client,
}

impl RemoteMediaProxy {
    /// `connect_timeout` bounds connection setup only; long bodies stream
    /// for as long as the client keeps reading.
    pub fn new(connect_timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ProxyError::Client)?;
        Ok(Self { client })
    }

    pub async fn proxy(
        &self,
        url: &str,
        content_type: Option<&str>,
        method: &Method,
        request: &HeaderMap,
    ) -> Result<Response, ProxyError> {
        let is_head = method == Method::HEAD;
        let mut outgoing = HeaderMap::new();
        for name in FORWARDED_HEADERS {
            if let Some(value) = request.get(&name) {
                outgoing.insert(name, value.clone());
            }
        }

        let upstream_method = if is_head { Method::HEAD } else { Method::GET };
        let upstream = self
            .client
            .request(upstream_method, url)
            .headers(outgoing)
            .send()
            .await
            .map_err(|source| ProxyError::Upstream {
                url: url.to_string(),
                source,
            })?;

        let status = upstream.status();
        let mut headers = relayed_headers(upstream.headers(), content_type);

        if status == StatusCode::PARTIAL_CONTENT && headers.contains_key(header::CONTENT_RANGE) {
            debug!(url, "origin answered the range itself");
            return Ok(passthrough(status, headers, upstream, is_head));
        }

        let range = request.get(header::RANGE).and_then(|v| v.to_str().ok());
        let Some(range) = range else {
            return Ok(passthrough(status, headers, upstream, is_head));
        };
        if status != StatusCode::OK || is_encoded(&headers) {
            return Ok(passthrough(status, headers, upstream, is_head));
        }
        if !if_range_holds(request, &headers) {
            debug!(url, "If-Range no longer matches the origin; sending full body");
            return Ok(passthrough(status, headers, upstream, is_head));
        }

        let size = match content_length(&headers) {
            Some(size) => Some(size),
            None => self.discover_size(url).await,
        };
        let Some(size) = size else {
            debug!(url, "origin size unknown; range ignored");
            return Ok(passthrough(status, headers, upstream, is_head));
        };

        match parse_range(range, size) {
            None => Ok(passthrough(status, headers, upstream, is_head)),
            Some(RangeRequest::Invalid) => {
                headers.remove(header::CONTENT_LENGTH);
                set(&mut headers, header::CONTENT_RANGE, &unsatisfied_range(size));
                Ok(respond(StatusCode::RANGE_NOT_SATISFIABLE, headers, Body::empty()))
            }
            Some(RangeRequest::Satisfiable { start, end }) => {
                let len = range_len(start, end);
                set(&mut headers, header::CONTENT_RANGE, &content_range(start, end, size));
                set(&mut headers, header::CONTENT_LENGTH, &len.to_string());
                debug!(url, start, end, size, "slicing origin response");

                let body = if is_head {
                    Body::empty()
                } else {
                    Body::from_stream(SliceStream::new(upstream.bytes_stream().boxed(), start, len))
                };
                Ok(respond(StatusCode::PARTIAL_CONTENT, headers, body))
            }
        }
    }

    /// Ask the origin for the resource size with a bare HEAD.
    async fn discover_size(&self, url: &str) -> Option<u64> {
        match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => content_length(response.headers()),
            Ok(response) => {
                debug!(url, status = %response.status(), "size probe rejected");
                None
            }
            Err(err) => {
                warn!(url, "size probe failed: {}", err);
                None
            }
        }
    }
}

/// Yields bytes `[start, start + len)` of an inner byte stream, dropping the
/// inner stream as soon as the window has been produced.
pub struct SliceStream<S> {
    inner: Option<S>,
    to_skip: u64,
    remaining: u64,
}

impl<S> SliceStream<S> {
    pub fn new(inner: S, start: u64, len: u64) -> Self {
        Self {
            inner: Some(inner),
            to_skip: start,
            remaining: len,
        }
    }
}

impl<S, E> Stream for SliceStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.remaining == 0 {
                this.inner = None;
                return Poll::Ready(None);
            }
            let Some(inner) = this.inner.as_mut() else {
                return Poll::Ready(None);
            };

            let mut chunk = match ready!(Pin::new(inner).poll_next(cx)) {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    this.inner = None;
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    this.inner = None;
                    return Poll::Ready(None);
                }
            };

            let chunk_len = chunk.len() as u64;
            if this.to_skip >= chunk_len {
                this.to_skip -= chunk_len;
                continue;
            }
            if this.to_skip > 0 {
                chunk = chunk.slice(this.to_skip as usize..);
                this.to_skip = 0;
            }

            let chunk_len = chunk.len() as u64;
            if chunk_len >= this.remaining {
                chunk.truncate(this.remaining as usize);
                this.remaining = 0;
                this.inner = None;
            } else {
                this.remaining -= chunk_len;
            }
            return Poll::Ready(Some(Ok(chunk)));
        }
    }
}

fn relayed_headers(upstream: &HeaderMap, content_type: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let upstream_is_audio = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("audio/"));
    if !upstream_is_audio {
        headers.insert(
            header::CONTENT_TYPE,
            content_type
                .and_then(|ct| HeaderValue::from_str(ct).ok())
                .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
        );
    }
    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(MEDIA_CACHE_CONTROL),
        );
    }
    headers
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Byte offsets of an encoded body do not line up with the media.
fn is_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|enc| !enc.trim().eq_ignore_ascii_case("identity"))
}

fn if_range_holds(request: &HeaderMap, upstream: &HeaderMap) -> bool {
    let Some(if_range) = request.get(header::IF_RANGE).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let etag = upstream.get(header::ETAG).and_then(|v| v.to_str().ok());
    let last_modified = upstream
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok());
    if etag.is_none() && last_modified.is_none() {
        return true;
    }
    if_range_matches(if_range, etag, last_modified)
}

fn passthrough(
    status: StatusCode,
    headers: HeaderMap,
    upstream: reqwest::Response,
    is_head: bool,
) -> Response {
    let body = if is_head {
        Body::empty()
    } else {
        Body::from_stream(upstream.bytes_stream())
    };
    respond(status, headers, body)
}

fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn respond(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
