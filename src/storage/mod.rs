//! Durable chunk persistence and assembly.
//!
//! Every backend exposes the same four operations so the upload coordinator
//! never needs to know where chunks land:
//!
//! - `save_chunk` — persist one chunk, overwriting a previous copy of it
//! - `assemble_file` — concatenate all chunks, in index order, into the final object
//! - `get_file` — read an assembled object back
//! - `cleanup` — drop all transient per-upload state (idempotent)

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

pub mod filesystem;
pub mod object_store;

pub use filesystem::FilesystemBackend;
pub use object_store::{ObjectStoreBackend, S3MultipartApi};

const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid {field} `{value}`")]
    InvalidName { field: &'static str, value: String },
    #[error("upload `{upload_id}` is missing chunks {missing:?}")]
    IncompleteUpload { upload_id: String, missing: Vec<i64> },
    #[error("file `{0}` not found")]
    FileNotFound(String),
    #[error("object store request failed: {0}")]
    Backend(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name used in logs and readiness output.
    fn name(&self) -> &'static str;

    async fn save_chunk(&self, upload_id: &str, chunk_index: i64, bytes: Bytes)
    -> StorageResult<()>;

    /// Fails with `IncompleteUpload` unless all `total_chunks` chunks are present.
    async fn assemble_file(
        &self,
        upload_id: &str,
        file_name: &str,
        total_chunks: i64,
    ) -> StorageResult<()>;

    async fn get_file(&self, file_name: &str) -> StorageResult<Bytes>;

    async fn cleanup(&self, upload_id: &str) -> StorageResult<()>;
}

/// Reject names that could escape the storage root or confuse key layouts.
///
/// Applied to upload ids and file names before they become path segments or
/// object keys.
pub fn ensure_name_safe(field: &'static str, value: &str) -> StorageResult<()> {
    let invalid = || StorageError::InvalidName {
        field,
        value: value.to_string(),
    };

    if value.is_empty() || value.len() > MAX_NAME_LEN {
        return Err(invalid());
    }
    if value == "." || value.contains("..") || value.starts_with('.') {
        return Err(invalid());
    }
    if value
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\')
    {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(ensure_name_safe("uploadId", "episode-1.mp3-1718000000").is_ok());
        assert!(ensure_name_safe("fileName", "My Episode 12.m4a").is_ok());
    }

    #[test]
    fn rejects_traversal_and_separators() {
        for bad in ["", "..", "../etc", "a/b", "a\\b", ".hidden", "nul\0byte"] {
            assert!(
                matches!(
                    ensure_name_safe("fileName", bad),
                    Err(StorageError::InvalidName { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
        assert!(ensure_name_safe("fileName", &"a".repeat(256)).is_err());
    }
}
