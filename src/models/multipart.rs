//! Persisted multipart context for the object-store backend.
//!
//! The backend token and part ETags live in SQLite next to the upload
//! session so a restart or another instance can finish the upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A backend multipart upload opened for one chunked upload session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    /// Chunked upload session this multipart upload belongs to.
    pub upload_id: String,

    /// Staging object key the parts are uploaded against.
    pub object_key: String,

    /// Token assigned by the object store when the multipart upload opened.
    pub backend_upload_id: String,

    /// Timestamp when the multipart upload was opened.
    pub created_at: DateTime<Utc>,
}

/// Represents a single uploaded part in a multipart upload.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartPart {
    /// Reference to the parent upload session.
    pub upload_id: String,

    /// Part number (1-based, `chunk_index + 1`).
    pub part_number: i64,

    /// Completion token returned by the object store for this part.
    pub etag: String,

    /// Timestamp when this part was uploaded.
    pub uploaded_at: DateTime<Utc>,
}
