//! Local-disk storage backend.
//!
//! Chunks live beneath `base_path/.chunks/{upload_id}/chunk-{index}`; an
//! assembled upload is written to `base_path/{file_name}` through a temporary
//! file that is fsynced and atomically renamed into place.

use super::{StorageBackend, StorageError, StorageResult, ensure_name_safe};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::PathBuf,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const CHUNK_DIR: &str = ".chunks";

#[derive(Clone, Debug)]
pub struct FilesystemBackend {
    /// Base directory holding assembled files and the chunk staging area.
    base_path: PathBuf,
}

impl FilesystemBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(CHUNK_DIR).join(upload_id)
    }

    fn chunk_path(&self, upload_id: &str, chunk_index: i64) -> PathBuf {
        self.upload_dir(upload_id)
            .join(format!("chunk-{}", chunk_index))
    }

    /// Location of an assembled file.
    pub fn file_path(&self, file_name: &str) -> PathBuf {
        self.base_path.join(file_name)
    }

    /// Append every chunk, in index order, to `out`.
    async fn write_chunks(
        &self,
        upload_id: &str,
        total_chunks: i64,
        out: &mut File,
    ) -> io::Result<()> {
        for index in 0..total_chunks {
            let mut chunk = File::open(self.chunk_path(upload_id, index)).await?;
            tokio::io::copy(&mut chunk, out).await?;
        }
        out.flush().await?;
        out.sync_all().await
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn save_chunk(
        &self,
        upload_id: &str,
        chunk_index: i64,
        bytes: Bytes,
    ) -> StorageResult<()> {
        ensure_name_safe("uploadId", upload_id)?;
        let dir = self.upload_dir(upload_id);
        fs::create_dir_all(&dir).await?;

        // Concurrent re-sends of the same index each write their own temp file,
        // so the chunk path only ever holds one complete copy.
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let result: io::Result<()> = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, self.chunk_path(upload_id, chunk_index)).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        debug!(upload_id, chunk_index, size = bytes.len(), "stored chunk on disk");
        Ok(())
    }

    async fn assemble_file(
        &self,
        upload_id: &str,
        file_name: &str,
        total_chunks: i64,
    ) -> StorageResult<()> {
        ensure_name_safe("uploadId", upload_id)?;
        ensure_name_safe("fileName", file_name)?;

        let mut missing = Vec::new();
        for index in 0..total_chunks {
            if fs::metadata(self.chunk_path(upload_id, index)).await.is_err() {
                missing.push(index);
            }
        }
        if total_chunks < 1 || !missing.is_empty() {
            return Err(StorageError::IncompleteUpload {
                upload_id: upload_id.to_string(),
                missing,
            });
        }

        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = self.write_chunks(upload_id, total_chunks, &mut file).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        let file_path = self.file_path(file_name);
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        debug!(
            upload_id,
            total_chunks,
            path = %file_path.display(),
            "assembled upload"
        );
        self.cleanup(upload_id).await
    }

    async fn get_file(&self, file_name: &str) -> StorageResult<Bytes> {
        ensure_name_safe("fileName", file_name)?;
        match fs::read(self.file_path(file_name)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::FileNotFound(file_name.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn cleanup(&self, upload_id: &str) -> StorageResult<()> {
        ensure_name_safe("uploadId", upload_id)?;
        let dir = self.upload_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(_) => {
                debug!("removed chunk directory {}", dir.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

/// Create a fresh scratch directory for tests.
#[cfg(test)]
pub(crate) fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("media-store-{}-{}", label, Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assembles_chunks_in_index_order() {
        let backend = FilesystemBackend::new(scratch_dir("fs-assemble"));

        backend.save_chunk("up-1", 2, Bytes::from_static(b"cc")).await.unwrap();
        backend.save_chunk("up-1", 0, Bytes::from_static(b"aa")).await.unwrap();
        backend.save_chunk("up-1", 1, Bytes::from_static(b"bb")).await.unwrap();
        // a re-sent chunk replaces the earlier copy
        backend.save_chunk("up-1", 1, Bytes::from_static(b"BB")).await.unwrap();

        backend.assemble_file("up-1", "show.mp3", 3).await.unwrap();

        let data = backend.get_file("show.mp3").await.unwrap();
        assert_eq!(&data[..], b"aaBBcc");
        assert!(!backend.upload_dir("up-1").exists());
    }

    #[tokio::test]
    async fn refuses_to_assemble_with_missing_chunks() {
        let backend = FilesystemBackend::new(scratch_dir("fs-missing"));
        backend.save_chunk("up-2", 0, Bytes::from_static(b"aa")).await.unwrap();
        backend.save_chunk("up-2", 2, Bytes::from_static(b"cc")).await.unwrap();

        let err = backend.assemble_file("up-2", "show.mp3", 3).await.unwrap_err();
        match err {
            StorageError::IncompleteUpload { missing, .. } => assert_eq!(missing, vec![1]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!backend.file_path("show.mp3").exists());
        assert!(backend.chunk_path("up-2", 0).exists());
    }

    #[tokio::test]
    async fn overwrites_previous_assembly() {
        let backend = FilesystemBackend::new(scratch_dir("fs-overwrite"));
        backend.save_chunk("a", 0, Bytes::from_static(b"first")).await.unwrap();
        backend.assemble_file("a", "ep.wav", 1).await.unwrap();
        backend.save_chunk("b", 0, Bytes::from_static(b"second")).await.unwrap();
        backend.assemble_file("b", "ep.wav", 1).await.unwrap();

        assert_eq!(&backend.get_file("ep.wav").await.unwrap()[..], b"second");
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let backend = FilesystemBackend::new(scratch_dir("fs-cleanup"));
        backend.save_chunk("up-3", 0, Bytes::from_static(b"x")).await.unwrap();

        backend.cleanup("up-3").await.unwrap();
        backend.cleanup("up-3").await.unwrap();
        backend.cleanup("never-existed").await.unwrap();
        assert!(!backend.upload_dir("up-3").exists());
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let backend = FilesystemBackend::new(scratch_dir("fs-get"));
        assert!(matches!(
            backend.get_file("nope.mp3").await,
            Err(StorageError::FileNotFound(_))
        ));
    }
}
