//! Defines routes for chunked uploads and media delivery.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST /uploads/chunk` — multipart chunk upload; the last chunk assembles
//!   - `GET  /uploads/resume` — chunk indices already stored for `uploadId`
//!
//! - **Delivery endpoints**
//!   - `GET|HEAD /media/{id}` — range-aware streaming of a registered asset
//!
//! - **Probes**: `/healthz`, `/readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        media_handlers::get_media,
        upload_handlers::{resume_upload, upload_chunk},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Multipart framing and the small text fields on top of the chunk itself.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// Build the router; `max_chunk_bytes` caps a single chunk upload.
pub fn routes(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload routes
        .route(
            "/uploads/chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(
                max_chunk_bytes.saturating_add(FORM_OVERHEAD_BYTES),
            )),
        )
        .route("/uploads/resume", get(resume_upload))
        // Delivery routes
        .route("/media/{id}", get(get_media).head(get_media))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::test_pool,
        services::{
            audio_probe::{SymphoniaProber, tests::wav_bytes},
            delivery_service::{
                DeliveryService, SqliteAccessLog, SqliteMediaRegistry, tests::register,
            },
            remote_proxy::RemoteMediaProxy,
            upload_service::UploadService,
        },
        storage::{FilesystemBackend, filesystem::scratch_dir},
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::{path::PathBuf, sync::Arc, time::Duration};
    use tower::ServiceExt;

    const BOUNDARY: &str = "media-store-test-boundary";

    async fn app() -> (Router, Arc<sqlx::SqlitePool>, PathBuf) {
        let db = Arc::new(test_pool().await);
        let dir = scratch_dir("routes");
        let uploads = UploadService::new(
            db.clone(),
            Arc::new(FilesystemBackend::new(&dir)),
            Arc::new(SymphoniaProber),
        );
        let delivery = DeliveryService::new(
            Arc::new(SqliteMediaRegistry::new(db.clone())),
            Arc::new(SqliteAccessLog::new(db.clone())),
            RemoteMediaProxy::new(Duration::from_secs(2)).unwrap(),
            &dir,
        );
        let state = AppState {
            db: db.clone(),
            uploads,
            delivery,
            storage_dir: dir.clone(),
        };
        (routes(1024 * 1024).with_state(state), db, dir)
    }

    fn chunk_request(fields: &[(&str, &str)], chunk: Option<&[u8]>) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\n\
                     Content-Disposition: form-data; name=\"{name}\"\r\n\r\n\
                     {value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some(chunk) = chunk {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\n\
                     Content-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(chunk);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/uploads/chunk")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn chunked_upload_resume_and_delivery() {
        let (app, db, _) = app().await;
        let wav = wav_bytes(8000, 8000);
        let (first, second) = wav.split_at(wav.len() / 2);

        let response = app
            .clone()
            .oneshot(chunk_request(
                &[
                    ("uploadId", "u-1"),
                    ("chunkIndex", "1"),
                    ("totalChunks", "2"),
                    ("fileName", "intro.wav"),
                ],
                Some(second),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["status"], "chunk_uploaded");
        assert_eq!(body["chunkIndex"], 1);

        let response = app
            .clone()
            .oneshot(
                Request::get("/uploads/resume?uploadId=u-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json(response).await["uploadedChunks"], serde_json::json!([1]));

        let response = app
            .clone()
            .oneshot(chunk_request(
                &[
                    ("uploadId", "u-1"),
                    ("chunkIndex", "0"),
                    ("totalChunks", "2"),
                    ("fileName", "intro.wav"),
                ],
                Some(first),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["status"], "complete");
        assert_eq!(body["file"], "intro.wav");
        assert_eq!(body["metadata"]["durationMs"], 1000);
        assert_eq!(body["metadata"]["fileSize"], 16044);
        assert_eq!(body["metadata"]["format"], "wav");

        register(&db, "intro", "intro.wav", Some("audio/wav")).await;
        let response = app
            .clone()
            .oneshot(
                Request::get("/media/intro.wav")
                    .header(header::RANGE, "bytes=0-3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-3/16044");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"RIFF");
    }

    #[tokio::test]
    async fn invalid_chunk_fields_are_reported() {
        let (app, _, _) = app().await;
        let response = app
            .oneshot(chunk_request(
                &[
                    ("uploadId", "u-2"),
                    ("chunkIndex", "first"),
                    ("totalChunks", "3"),
                    ("fileName", "notes.txt"),
                ],
                None,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json(response).await;
        assert_eq!(body["status"], 400);
        let fields: Vec<&str> = body["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["field"].as_str().unwrap())
            .collect();
        assert!(fields.contains(&"chunk"));
        assert!(fields.contains(&"chunkIndex"));
        assert!(fields.contains(&"fileName"));
        assert!(!fields.contains(&"totalChunks"));
    }

    #[tokio::test]
    async fn resume_requires_upload_id() {
        let (app, _, _) = app().await;
        let response = app
            .oneshot(Request::get("/uploads/resume").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["errors"][0]["field"], "uploadId");
    }

    #[tokio::test]
    async fn unknown_media_is_not_found_and_head_has_no_body() {
        let (app, db, dir) = app().await;
        let response = app
            .clone()
            .oneshot(Request::get("/media/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        tokio::fs::write(dir.join("clip.mp3"), vec![1u8; 64]).await.unwrap();
        register(&db, "clip", "clip.mp3", None).await;
        let response = app
            .oneshot(
                Request::head("/media/clip")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "64");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn readiness_reports_backend() {
        let (app, _, _) = app().await;
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["backend"], "filesystem");
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["disk"]["ok"], true);
    }
}
