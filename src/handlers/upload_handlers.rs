//! Chunked upload endpoints.
//!
//! - `POST /uploads/chunk`            -> store one chunk; assembles on the last one
//! - `GET  /uploads/resume?uploadId=` -> chunk indices already received

use crate::{
    errors::AppError,
    services::upload_service::{ChunkOutcome, ChunkUpload, FieldError, UploadError},
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Query, State},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Raw multipart fields before parsing.
#[derive(Default)]
struct ChunkForm {
    chunk: Option<Bytes>,
    upload_id: Option<String>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    file_name: Option<String>,
}

impl ChunkForm {
    /// Parse numeric fields and run field validation, reporting every
    /// problem in one response.
    fn into_upload(self) -> Result<ChunkUpload, AppError> {
        let mut errors = Vec::new();

        let bytes = self.chunk.unwrap_or_default();
        if bytes.is_empty() {
            errors.push(FieldError::new("chunk", "Chunk data is required"));
        }

        let chunk_index = parse_count(
            "chunkIndex",
            self.chunk_index.as_deref(),
            "Chunk index must be a non-negative integer",
            &mut errors,
        );
        let total_chunks = parse_count(
            "totalChunks",
            self.total_chunks.as_deref(),
            "Total chunks must be a positive integer",
            &mut errors,
        );

        let upload = ChunkUpload {
            upload_id: self.upload_id.unwrap_or_default(),
            // placeholders keep validation from double-reporting unparsable fields
            chunk_index: chunk_index.unwrap_or(0),
            total_chunks: total_chunks.unwrap_or(i64::MAX),
            file_name: self.file_name.unwrap_or_default(),
            bytes,
        };

        if let Err(UploadError::Validation(more)) = upload.validate() {
            for err in more {
                if !errors.iter().any(|e| e.field == err.field) {
                    errors.push(err);
                }
            }
        }

        if errors.is_empty() {
            Ok(upload)
        } else {
            Err(AppError::invalid(errors))
        }
    }
}

fn parse_count(
    field: &'static str,
    raw: Option<&str>,
    message: &str,
    errors: &mut Vec<FieldError>,
) -> Option<i64> {
    match raw.map(str::trim).map(str::parse::<i64>) {
        Some(Ok(value)) => Some(value),
        _ => {
            errors.push(FieldError::new(field, message));
            None
        }
    }
}

/// `POST /uploads/chunk`
pub async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkOutcome>, AppError> {
    let mut form = ChunkForm::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "chunk" => form.chunk = Some(field.bytes().await?),
            "uploadId" => form.upload_id = Some(field.text().await?),
            "chunkIndex" => form.chunk_index = Some(field.text().await?),
            "totalChunks" => form.total_chunks = Some(field.text().await?),
            "fileName" => form.file_name = Some(field.text().await?),
            other => tracing::debug!("ignoring unexpected form field `{}`", other),
        }
    }

    let upload = form.into_upload()?;
    let outcome = state.uploads.accept_chunk(upload).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct ResumeQuery {
    #[serde(rename = "uploadId")]
    upload_id: Option<String>,
}

#[derive(Serialize)]
pub struct ResumeResponse {
    #[serde(rename = "uploadedChunks")]
    uploaded_chunks: Vec<i64>,
}

/// `GET /uploads/resume?uploadId=...`
pub async fn resume_upload(
    State(state): State<AppState>,
    Query(query): Query<ResumeQuery>,
) -> Result<Json<ResumeResponse>, AppError> {
    let upload_id = query
        .upload_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| {
            AppError::invalid(vec![FieldError::new("uploadId", "Upload ID is required")])
        })?;

    let uploaded_chunks = state.uploads.uploaded_chunks(&upload_id).await?;
    Ok(Json(ResumeResponse { uploaded_chunks }))
}
