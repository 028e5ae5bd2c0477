//! Delivery registry entries and access log records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A logical media resource known to the delivery path.
///
/// `location` is either an absolute `http(s)://` URL served through the
/// proxy, or a path relative to the local media root.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MediaAsset {
    pub id: String,
    pub location: String,
    pub content_type: Option<String>,
}

impl MediaAsset {
    pub fn remote_url(&self) -> Option<&str> {
        let lower = self.location.to_ascii_lowercase();
        (lower.starts_with("http://") || lower.starts_with("https://"))
            .then_some(self.location.as_str())
    }
}

/// One delivery request, recorded best-effort.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct AccessLogEntry {
    pub media_id: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub range: Option<String>,
    pub accessed_at: DateTime<Utc>,
}
