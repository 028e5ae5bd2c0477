//! Media delivery: resolve a media id, record the access, then serve the
//! bytes from local disk or through the remote proxy.

use crate::{
    models::media::{AccessLogEntry, MediaAsset},
    services::{local_media::LocalMediaServer, remote_proxy::RemoteMediaProxy},
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::Response,
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_CONTENT_TYPE: &str = "audio/mpeg";
pub const MEDIA_CACHE_CONTROL: &str = "public, max-age=3600";

/// Access log text fields are cut to this many characters.
const MAX_LOG_FIELD_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("media `{0}` not found")]
    NotFound(String),
    #[error("cannot redirect to `{0}`")]
    InvalidLocation(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Maps logical media ids to where their bytes live.
#[async_trait]
pub trait MediaRegistry: Send + Sync {
    async fn resolve(&self, media_id: &str) -> Result<Option<MediaAsset>, sqlx::Error>;
}

/// Best-effort sink for delivery access records.
#[async_trait]
pub trait AccessLogSink: Send + Sync {
    async fn record(&self, entry: AccessLogEntry) -> Result<(), sqlx::Error>;
}

#[derive(Clone)]
pub struct SqliteMediaRegistry {
    db: Arc<SqlitePool>,
}

impl SqliteMediaRegistry {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MediaRegistry for SqliteMediaRegistry {
    async fn resolve(&self, media_id: &str) -> Result<Option<MediaAsset>, sqlx::Error> {
        sqlx::query_as::<_, MediaAsset>(
            "SELECT id, location, content_type FROM media_assets WHERE id = ?",
        )
        .bind(media_id)
        .fetch_optional(&*self.db)
        .await
    }
}

#[derive(Clone)]
pub struct SqliteAccessLog {
    db: Arc<SqlitePool>,
}

impl SqliteAccessLog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AccessLogSink for SqliteAccessLog {
    async fn record(&self, entry: AccessLogEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO media_access_log (id, media_id, ip, user_agent, referer, range, accessed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&entry.media_id)
        .bind(&entry.ip)
        .bind(&entry.user_agent)
        .bind(&entry.referer)
        .bind(&entry.range)
        .bind(entry.accessed_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct DeliveryService {
    registry: Arc<dyn MediaRegistry>,
    access_log: Arc<dyn AccessLogSink>,
    local: LocalMediaServer,
    proxy: RemoteMediaProxy,
    media_root: PathBuf,
}

impl DeliveryService {
    pub fn new(
        registry: Arc<dyn MediaRegistry>,
        access_log: Arc<dyn AccessLogSink>,
        proxy: RemoteMediaProxy,
        media_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            access_log,
            local: LocalMediaServer,
            proxy,
            media_root: media_root.into(),
        }
    }

    pub async fn deliver(
        &self,
        media_id: &str,
        method: &Method,
        headers: &HeaderMap,
    ) -> Result<Response, DeliveryError> {
        let id = strip_extension(media_id);
        if id.is_empty() {
            return Err(DeliveryError::NotFound(media_id.to_string()));
        }

        let asset = self
            .registry
            .resolve(id)
            .await?
            .ok_or_else(|| DeliveryError::NotFound(id.to_string()))?;

        self.record_access(id, headers);

        let content_type = asset.content_type.as_deref();
        if let Some(url) = asset.remote_url() {
            return match self.proxy.proxy(url, content_type, method, headers).await {
                Ok(response) => Ok(response),
                Err(err) => {
                    warn!(media_id = %id, "proxy failed, redirecting client: {}", err);
                    redirect(url)
                }
            };
        }

        let path = resolve_under(&self.media_root, &asset.location)
            .ok_or_else(|| DeliveryError::NotFound(id.to_string()))?;
        debug!(media_id = %id, path = %path.display(), "serving local media");
        self.local.serve(&path, content_type, method, headers).await
    }

    /// Spawn the access-log insert; failures are logged and dropped.
    fn record_access(&self, media_id: &str, headers: &HeaderMap) {
        let entry = AccessLogEntry {
            media_id: media_id.to_string(),
            ip: client_ip(headers).map(|ip| truncate_chars(&ip, MAX_LOG_FIELD_CHARS)),
            user_agent: header_text(headers, header::USER_AGENT),
            referer: header_text(headers, header::REFERER)
                .or_else(|| header_text(headers, HeaderName::from_static("referrer"))),
            range: header_text(headers, header::RANGE),
            accessed_at: Utc::now(),
        };
        let sink = self.access_log.clone();
        tokio::spawn(async move {
            let media_id = entry.media_id.clone();
            if let Err(err) = sink.record(entry).await {
                warn!(media_id = %media_id, "failed to record media access: {}", err);
            }
        });
    }
}

/// `abc.mp3` -> `abc`.
fn strip_extension(media_id: &str) -> &str {
    media_id
        .split_once('.')
        .map_or(media_id, |(stem, _)| stem)
}

/// Join a registry location onto `root`, refusing anything that could leave it.
fn resolve_under(root: &Path, location: &str) -> Option<PathBuf> {
    let location = location.split(['?', '#']).next().unwrap_or_default();
    let relative = Path::new(location.trim_start_matches('/'));

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (depth > 0).then_some(resolved)
}

/// First `X-Forwarded-For` hop, else `CF-Connecting-IP`, else `X-Real-IP`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or_else(|| {
            ["cf-connecting-ip", "x-real-ip"].into_iter().find_map(|name| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
            })
        })
        .map(str::to_string)
}

fn header_text(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| truncate_chars(v, MAX_LOG_FIELD_CHARS))
}

fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

fn redirect(url: &str) -> Result<Response, DeliveryError> {
    let location =
        HeaderValue::from_str(url).map_err(|_| DeliveryError::InvalidLocation(url.to_string()))?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(header::LOCATION, location);
    Ok(response)
}
