//! `Range`, `If-Range` and conditional-request helpers shared by the local
//! media server and the remote proxy.

use httpdate::parse_http_date;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A parsed single-range request against a resource of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// Inclusive byte offsets, `start <= end < size`.
    Satisfiable { start: u64, end: u64 },
    /// Syntactically broken or outside the resource: answer 416.
    Invalid,
}

/// Byte count of the inclusive range `[start, end]`.
pub fn range_len(start: u64, end: u64) -> u64 {
    end - start + 1
}

/// Parse a `Range` header against a resource of `size` bytes.
///
/// Returns `None` when the header should be ignored entirely (a unit other
/// than `bytes`, or a multi-range list), in which case the full resource is
/// served. `start` is mandatory; a missing `end` means "to the last byte" and
/// an `end` past the resource is clamped.
pub fn parse_range(header: &str, size: u64) -> Option<RangeRequest> {
    let header = header.trim();
    let (unit, ranges) = header.split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return None;
    }
    if ranges.contains(',') {
        return None;
    }

    let Some((start, end)) = ranges.split_once('-') else {
        return Some(RangeRequest::Invalid);
    };
    let (start, end) = (start.trim(), end.trim());

    let Ok(start) = start.parse::<u64>() else {
        return Some(RangeRequest::Invalid);
    };
    if start >= size {
        return Some(RangeRequest::Invalid);
    }

    let last = size - 1;
    let end = if end.is_empty() {
        last
    } else {
        match end.parse::<u64>() {
            Ok(end) => end.min(last),
            Err(_) => return Some(RangeRequest::Invalid),
        }
    };
    if end < start {
        return Some(RangeRequest::Invalid);
    }

    Some(RangeRequest::Satisfiable { start, end })
}

pub fn content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, size)
}

pub fn unsatisfied_range(size: u64) -> String {
    format!("bytes */{}", size)
}

/// Truncate to whole seconds, the precision of HTTP dates.
pub fn to_http_precision(time: SystemTime) -> SystemTime {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Whether an `If-Range` value still matches the representation.
///
/// The value may be an entity tag or an HTTP date; a date only matches when
/// it equals `Last-Modified` exactly.
pub fn if_range_matches(if_range: &str, etag: Option<&str>, last_modified: Option<&str>) -> bool {
    let if_range = if_range.trim();
    if if_range.starts_with('"') || if_range.starts_with("W/") {
        return etag.is_some_and(|tag| tag == if_range);
    }

    match (
        parse_http_date(if_range),
        last_modified.map(parse_http_date),
    ) {
        (Ok(requested), Some(Ok(current))) => requested == current,
        _ => false,
    }
}

/// `If-None-Match` is `*` or lists `etag`.
pub fn none_match_hits(if_none_match: &str, etag: &str) -> bool {
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate == etag)
}

/// `If-Modified-Since` is at or after `modified`.
pub fn not_modified_since(if_modified_since: &str, modified: SystemTime) -> bool {
    parse_http_date(if_modified_since.trim())
        .map(|since| since >= to_http_precision(modified))
        .unwrap_or(false)
}
