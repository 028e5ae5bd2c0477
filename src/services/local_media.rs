//! Serves files from local disk with byte-range and conditional support.

use crate::services::{
    delivery_service::{DEFAULT_CONTENT_TYPE, DeliveryError, MEDIA_CACHE_CONTROL},
    http_range::{
        RangeRequest, content_range, if_range_matches, none_match_hits, not_modified_since,
        parse_range, range_len, unsatisfied_range,
    },
};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::Response,
};
use httpdate::fmt_http_date;
use std::{
    fs::Metadata,
    io::SeekFrom,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Weak ETag and Last-Modified derived from file metadata.
#[derive(Debug, Clone)]
struct Validators {
    etag: String,
    last_modified: String,
    modified: SystemTime,
}

impl Validators {
    fn from_metadata(meta: &Metadata) -> Self {
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        let mtime_ms = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Self {
            etag: format!("W/\"{:x}-{:x}\"", mtime_ms, meta.len()),
            last_modified: fmt_http_date(modified),
            modified,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalMediaServer;

impl LocalMediaServer {
    pub async fn serve(
        &self,
        path: &Path,
        content_type: Option<&str>,
        method: &Method,
        request: &HeaderMap,
    ) -> Result<Response, DeliveryError> {
        let meta = match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Err(DeliveryError::NotFound(path.display().to_string())),
        };
        let size = meta.len();
        let validators = Validators::from_metadata(&meta);
        let mut headers = base_headers(&validators, content_type);

        let range = request
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .filter(|_| range_still_valid(request, &validators))
            .and_then(|v| parse_range(v, size));
        let is_head = method == Method::HEAD;

        match range {
            Some(RangeRequest::Invalid) => {
                debug!(path = %path.display(), size, "unsatisfiable range");
                insert(&mut headers, header::CONTENT_RANGE, &unsatisfied_range(size));
                Ok(respond(StatusCode::RANGE_NOT_SATISFIABLE, headers, Body::empty()))
            }
            Some(RangeRequest::Satisfiable { start, end }) => {
                let len = range_len(start, end);
                insert(&mut headers, header::CONTENT_RANGE, &content_range(start, end, size));
                insert(&mut headers, header::CONTENT_LENGTH, &len.to_string());

                let body = if is_head {
                    Body::empty()
                } else {
                    let mut file = File::open(path).await?;
                    file.seek(SeekFrom::Start(start)).await?;
                    Body::from_stream(ReaderStream::new(file.take(len)))
                };
                Ok(respond(StatusCode::PARTIAL_CONTENT, headers, body))
            }
            None => {
                if is_not_modified(request, &validators) {
                    return Ok(respond(StatusCode::NOT_MODIFIED, headers, Body::empty()));
                }

                insert(&mut headers, header::CONTENT_LENGTH, &size.to_string());
                let body = if is_head {
                    Body::empty()
                } else {
                    Body::from_stream(ReaderStream::new(File::open(path).await?))
                };
                Ok(respond(StatusCode::OK, headers, body))
            }
        }
    }
}

fn base_headers(validators: &Validators, content_type: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(MEDIA_CACHE_CONTROL),
    );
    headers.insert(
        header::CONTENT_TYPE,
        content_type
            .and_then(|ct| HeaderValue::from_str(ct).ok())
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
    );
    insert(&mut headers, header::ETAG, &validators.etag);
    insert(&mut headers, header::LAST_MODIFIED, &validators.last_modified);
    headers
}

/// `Range` applies unless an `If-Range` precondition fails.
fn range_still_valid(request: &HeaderMap, validators: &Validators) -> bool {
    match request.get(header::IF_RANGE).and_then(|v| v.to_str().ok()) {
        Some(if_range) => if_range_matches(
            if_range,
            Some(&validators.etag),
            Some(&validators.last_modified),
        ),
        None => true,
    }
}

fn is_not_modified(request: &HeaderMap, validators: &Validators) -> bool {
    if let Some(tags) = request.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        return none_match_hits(tags, &validators.etag);
    }
    request
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|since| not_modified_since(since, validators.modified))
}

fn insert(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
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
