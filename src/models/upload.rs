//! Represents chunked upload sessions and the chunks received for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of an upload session.
///
/// A session stays `Receiving` while chunks arrive. Exactly one request may
/// move it to `Assembling` once every chunk is recorded.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Receiving,
    Assembling,
}

/// A server-side record tracking one logical chunked upload.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Client-supplied opaque identifier (typically filename + timestamp).
    pub id: String,

    /// Name of the final assembled object.
    pub file_name: String,

    /// Number of chunks the client announced for this upload.
    pub total_chunks: i64,

    /// Whether the session is still receiving chunks or being assembled.
    pub status: UploadStatus,

    /// When the first chunk arrived.
    pub created_at: DateTime<Utc>,

    /// When the most recent chunk arrived.
    pub updated_at: DateTime<Utc>,
}

/// A single received chunk of an upload session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ChunkRecord {
    /// Parent upload session id.
    pub upload_id: String,

    /// Zero-based chunk index, always below the session's `total_chunks`.
    pub chunk_index: i64,

    /// When this chunk was first recorded.
    pub received_at: DateTime<Utc>,
}

/// Audio properties reported back to the client once an upload completes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioMetadata {
    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Size of the assembled object in bytes.
    pub file_size: u64,

    /// Container format, e.g. "mp3" or "wav".
    pub format: String,

    /// Bitrate in bits per second, when it can be derived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
}
