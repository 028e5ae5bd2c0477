//! Chunked upload coordination.
//!
//! `UploadService` receives chunks, records them in SQLite, and assembles the
//! upload once every chunk has landed. Only the request that wins the
//! `receiving -> assembling` transition assembles; concurrent final chunks
//! observe the flipped status and report `chunk_uploaded`.

use crate::{
    models::upload::{AudioMetadata, ChunkRecord, UploadSession, UploadStatus},
    services::audio_probe::{AudioProber, ProbeError},
    storage::{StorageBackend, StorageError, ensure_name_safe},
};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Extensions accepted for uploaded media, compared case-insensitively.
pub const ALLOWED_EXTENSIONS: [&str; 4] = [".mp3", ".wav", ".aac", ".m4a"];

/// A single rejected request field.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload request")]
    Validation(Vec<FieldError>),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to parse audio metadata: {0}")]
    Metadata(#[from] ProbeError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// One chunk as received from a client.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub upload_id: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub file_name: String,
    pub bytes: Bytes,
}

impl ChunkUpload {
    /// Check every field and report all failures at once.
    pub fn validate(&self) -> UploadResult<()> {
        let mut errors = Vec::new();

        if self.upload_id.trim().is_empty() {
            errors.push(FieldError::new("uploadId", "Upload ID is required"));
        } else if ensure_name_safe("uploadId", &self.upload_id).is_err() {
            errors.push(FieldError::new(
                "uploadId",
                "Upload ID contains unsupported characters",
            ));
        }

        if self.chunk_index < 0 {
            errors.push(FieldError::new(
                "chunkIndex",
                "Chunk index must be a non-negative integer",
            ));
        }
        if self.total_chunks < 1 {
            errors.push(FieldError::new("totalChunks", "Total chunks must be at least 1"));
        } else if self.chunk_index >= self.total_chunks {
            errors.push(FieldError::new(
                "chunkIndex",
                "Chunk index must be less than total chunks",
            ));
        }

        if !has_allowed_extension(&self.file_name) {
            errors.push(FieldError::new(
                "fileName",
                "File must have a supported extension (.mp3, .wav, .aac, .m4a)",
            ));
        } else if ensure_name_safe("fileName", &self.file_name).is_err() {
            errors.push(FieldError::new(
                "fileName",
                "File name contains unsupported characters",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(UploadError::Validation(errors))
        }
    }
}

pub fn has_allowed_extension(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    ALLOWED_EXTENSIONS
        .iter()
        .any(|ext| lower.len() > ext.len() && lower.ends_with(ext))
}

/// Result of accepting one chunk.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkOutcome {
    ChunkUploaded {
        #[serde(rename = "chunkIndex")]
        chunk_index: i64,
    },
    Complete {
        file: String,
        metadata: AudioMetadata,
    },
}

#[derive(Clone)]
pub struct UploadService {
    db: Arc<SqlitePool>,
    storage: Arc<dyn StorageBackend>,
    prober: Arc<dyn AudioProber>,
}

impl UploadService {
    pub fn new(
        db: Arc<SqlitePool>,
        storage: Arc<dyn StorageBackend>,
        prober: Arc<dyn AudioProber>,
    ) -> Self {
        Self {
            db,
            storage,
            prober,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    async fn fetch_session(&self, upload_id: &str) -> UploadResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(
            "SELECT id, file_name, total_chunks, status, created_at, updated_at
             FROM uploads WHERE id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    /// Persist a chunk and, when it is the last missing one, assemble the upload.
    pub async fn accept_chunk(&self, chunk: ChunkUpload) -> UploadResult<ChunkOutcome> {
        chunk.validate()?;

        if let Some(existing) = self.fetch_session(&chunk.upload_id).await? {
            if existing.total_chunks != chunk.total_chunks {
                return Err(UploadError::Validation(vec![FieldError::new(
                    "totalChunks",
                    format!(
                        "Upload already declared {} total chunks",
                        existing.total_chunks
                    ),
                )]));
            }
        }

        self.storage
            .save_chunk(&chunk.upload_id, chunk.chunk_index, chunk.bytes.clone())
            .await?;

        let now = Utc::now();
        let session = sqlx::query_as::<_, UploadSession>(
            r#"
            INSERT INTO uploads (id, file_name, total_chunks, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at
            RETURNING id, file_name, total_chunks, status, created_at, updated_at
            "#,
        )
        .bind(&chunk.upload_id)
        .bind(&chunk.file_name)
        .bind(chunk.total_chunks)
        .bind(UploadStatus::Receiving)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO upload_chunks (upload_id, chunk_index, received_at)
             VALUES (?, ?, ?)",
        )
        .bind(&chunk.upload_id)
        .bind(chunk.chunk_index)
        .bind(now)
        .execute(&*self.db)
        .await?;

        let received: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT chunk_index) FROM upload_chunks WHERE upload_id = ?",
        )
        .bind(&chunk.upload_id)
        .fetch_one(&*self.db)
        .await?;

        debug!(
            upload_id = %chunk.upload_id,
            chunk_index = chunk.chunk_index,
            received,
            total = session.total_chunks,
            "recorded chunk"
        );

        let uploaded = ChunkOutcome::ChunkUploaded {
            chunk_index: chunk.chunk_index,
        };
        if received < session.total_chunks {
            return Ok(uploaded);
        }

        if !self.claim_assembly(&session.id).await? {
            debug!(upload_id = %session.id, "assembly already claimed by another request");
            return Ok(uploaded);
        }

        match self.assemble(&session).await {
            Ok(metadata) => {
                info!(
                    upload_id = %session.id,
                    file = %session.file_name,
                    size = metadata.file_size,
                    "upload complete"
                );
                Ok(ChunkOutcome::Complete {
                    file: session.file_name,
                    metadata,
                })
            }
            Err(err) => {
                warn!(upload_id = %session.id, "assembly failed, discarding upload: {}", err);
                self.discard_upload(&session.id).await;
                Err(err)
            }
        }
    }

    /// Flip `receiving -> assembling`; true only for the single winner.
    async fn claim_assembly(&self, upload_id: &str) -> UploadResult<bool> {
        let result = sqlx::query("UPDATE uploads SET status = ? WHERE id = ? AND status = ?")
            .bind(UploadStatus::Assembling)
            .bind(upload_id)
            .bind(UploadStatus::Receiving)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop every trace of an upload whose assembly failed.
    ///
    /// Storage may already have consumed the chunks (or the multipart token),
    /// so the recorded indices cannot be trusted; the client starts over.
    async fn discard_upload(&self, upload_id: &str) {
        if let Err(err) = self.storage.cleanup(upload_id).await {
            warn!(upload_id, "failed to clean up storage for failed upload: {}", err);
        }
        if let Err(err) = delete_upload_rows(&self.db, upload_id).await {
            warn!(upload_id, "failed to delete records for failed upload: {}", err);
        }
    }

    async fn assemble(&self, session: &UploadSession) -> UploadResult<AudioMetadata> {
        self.storage
            .assemble_file(&session.id, &session.file_name, session.total_chunks)
            .await?;

        let data = self.storage.get_file(&session.file_name).await?;
        let prober = self.prober.clone();
        let file_name = session.file_name.clone();
        let metadata = tokio::task::spawn_blocking(move || prober.probe(&file_name, &data))
            .await
            .map_err(|err| ProbeError::Task(err.to_string()))??;

        delete_upload_rows(&self.db, &session.id).await?;
        Ok(metadata)
    }

    /// Chunk indices already recorded for an upload, ascending. Unknown uploads
    /// have none.
    pub async fn uploaded_chunks(&self, upload_id: &str) -> UploadResult<Vec<i64>> {
        let records = sqlx::query_as::<_, ChunkRecord>(
            "SELECT upload_id, chunk_index, received_at FROM upload_chunks
             WHERE upload_id = ? ORDER BY chunk_index ASC",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(records.into_iter().map(|r| r.chunk_index).collect())
    }
}

/// Delete an upload's chunk records and session in one transaction.
///
/// Returns whether a session row was removed.
pub(crate) async fn delete_upload_rows(db: &SqlitePool, upload_id: &str) -> sqlx::Result<bool> {
    let mut tx = db.begin().await?;
    sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;
    let removed = sqlx::query("DELETE FROM uploads WHERE id = ?")
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(removed.rows_affected() > 0)
}
