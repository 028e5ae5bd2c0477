//! Reclaims abandoned uploads.
//!
//! An upload is abandoned once it has not received a chunk for the TTL.
//! Usually that means it still has fewer chunks than announced, but a session
//! can also be left whole or `assembling` by a crash mid-assembly. Completed
//! uploads are deleted by the coordinator, so they never match.

use crate::{
    models::upload::{UploadSession, UploadStatus},
    services::upload_service::{UploadResult, delete_upload_rows},
    storage::StorageBackend,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Uploads idle for longer than this are eligible for reclamation.
pub const DEFAULT_UPLOAD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct UploadReaper {
    db: Arc<SqlitePool>,
    storage: Arc<dyn StorageBackend>,
    ttl: Duration,
}

impl UploadReaper {
    pub fn new(db: Arc<SqlitePool>, storage: Arc<dyn StorageBackend>, ttl: Duration) -> Self {
        Self { db, storage, ttl }
    }

    /// Reclaim every abandoned upload; returns how many were removed.
    pub async fn sweep(&self) -> UploadResult<usize> {
        let ttl = ChronoDuration::from_std(self.ttl).unwrap_or(ChronoDuration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.sweep_idle_since(cutoff).await
    }

    async fn sweep_idle_since(&self, cutoff: DateTime<Utc>) -> UploadResult<usize> {
        let expired = sqlx::query_as::<_, UploadSession>(
            r#"
            SELECT id, file_name, total_chunks, status, created_at, updated_at
            FROM uploads
            WHERE julianday(updated_at) <= julianday(?)
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;

        let mut reclaimed = 0;
        for session in expired {
            if session.status == UploadStatus::Assembling {
                warn!(upload_id = %session.id, "reclaiming upload stuck in assembly");
            }

            // a storage failure leaves the rows in place so the next sweep retries
            if let Err(err) = self.storage.cleanup(&session.id).await {
                warn!(upload_id = %session.id, "failed to clean up expired upload: {}", err);
                continue;
            }

            if delete_upload_rows(&self.db, &session.id).await? {
                debug!(upload_id = %session.id, "reclaimed expired upload");
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            info!(reclaimed, "expired upload sweep finished");
        }
        Ok(reclaimed)
    }

    /// Run `sweep` every `every` until the task is aborted.
    pub fn spawn_periodic(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if let Err(err) = self.sweep().await {
                    warn!("expired upload sweep failed: {}", err);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::upload_service::{
        ChunkOutcome,
        tests::{StubProber, chunk, service_with},
    };
    use bytes::Bytes;

    async fn age_upload(db: &SqlitePool, upload_id: &str, hours: i64) {
        sqlx::query("UPDATE uploads SET updated_at = ? WHERE id = ?")
            .bind(Utc::now() - ChronoDuration::hours(hours))
            .bind(upload_id)
            .execute(db)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reclaims_expired_incomplete_uploads() {
        let (service, backend, pool) = service_with(Arc::new(StubProber::default())).await;
        service.accept_chunk(chunk("stale", 0, 3, b"a")).await.unwrap();
        service.accept_chunk(chunk("stale", 2, 3, b"c")).await.unwrap();
        service.accept_chunk(chunk("fresh", 0, 2, b"a")).await.unwrap();
        age_upload(&pool, "stale", 25).await;

        let reaper = UploadReaper::new(pool.clone(), backend.clone(), DEFAULT_UPLOAD_TTL);
        assert_eq!(reaper.sweep().await.unwrap(), 1);

        assert!(service.uploaded_chunks("stale").await.unwrap().is_empty());
        assert_eq!(service.uploaded_chunks("fresh").await.unwrap(), vec![0]);
        let sessions: Vec<String> = sqlx::query_scalar("SELECT id FROM uploads")
            .fetch_all(&*pool)
            .await
            .unwrap();
        assert_eq!(sessions, vec!["fresh".to_string()]);

        // the stale upload's chunks are gone, so a late final chunk cannot assemble
        assert!(backend.assemble_file("stale", "x.mp3", 3).await.is_err());

        // already reclaimed: no-op
        assert_eq!(reaper.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn completed_uploads_are_not_touched() {
        let (service, backend, pool) = service_with(Arc::new(StubProber::default())).await;
        let outcome = service.accept_chunk(chunk("done", 0, 1, b"a")).await.unwrap();
        assert!(matches!(outcome, ChunkOutcome::Complete { .. }));

        let reaper = UploadReaper::new(pool, backend.clone(), Duration::ZERO);
        assert_eq!(reaper.sweep().await.unwrap(), 0);
        assert_eq!(&backend.get_file("episode.mp3").await.unwrap()[..], b"a");
    }

    #[tokio::test]
    async fn concurrent_sweeps_reclaim_once() {
        let (service, backend, pool) = service_with(Arc::new(StubProber::default())).await;
        service.accept_chunk(chunk("old", 0, 2, b"a")).await.unwrap();
        age_upload(&pool, "old", 48).await;

        let reaper = UploadReaper::new(pool, backend, DEFAULT_UPLOAD_TTL);
        let (a, b) = tokio::join!(reaper.sweep(), reaper.sweep());
        assert_eq!(a.unwrap() + b.unwrap(), 1);
    }

    #[tokio::test]
    async fn reclaims_whole_uploads_stuck_in_assembly() {
        let (service, backend, pool) = service_with(Arc::new(StubProber::default())).await;
        service.accept_chunk(chunk("stuck", 0, 2, b"a")).await.unwrap();
        // simulate a crash after the final chunk was recorded and assembly claimed
        backend.save_chunk("stuck", 1, Bytes::from_static(b"b")).await.unwrap();
        sqlx::query(
            "INSERT INTO upload_chunks (upload_id, chunk_index, received_at) VALUES (?, 1, ?)",
        )
        .bind("stuck")
        .bind(Utc::now())
        .execute(&*pool)
        .await
        .unwrap();
        sqlx::query("UPDATE uploads SET status = ? WHERE id = ?")
            .bind(UploadStatus::Assembling)
            .bind("stuck")
            .execute(&*pool)
            .await
            .unwrap();

        let reaper = UploadReaper::new(pool.clone(), backend.clone(), DEFAULT_UPLOAD_TTL);
        assert_eq!(reaper.sweep().await.unwrap(), 0, "still within the TTL");

        age_upload(&pool, "stuck", 30).await;
        assert_eq!(reaper.sweep().await.unwrap(), 1);
        assert!(service.uploaded_chunks("stuck").await.unwrap().is_empty());
        assert!(backend.assemble_file("stuck", "x.mp3", 2).await.is_err());

        // the id is usable again from scratch
        service.accept_chunk(chunk("stuck", 0, 1, b"z")).await.unwrap();
        assert_eq!(&backend.get_file("episode.mp3").await.unwrap()[..], b"z");
    }
}
