//! Multipart object-store backend (S3-compatible).
//!
//! Each chunk becomes part `chunk_index + 1` of a multipart upload opened
//! lazily against the staging key `{prefix}{upload_id}/file`. The backend
//! token and the part ETags are persisted in SQLite (`multipart_uploads`,
//! `multipart_parts`) so any instance can complete or abort the upload.
//! Assembly completes the multipart upload, then copies the staging object to
//! `{prefix}{file_name}`.

use super::{StorageBackend, StorageError, StorageResult, ensure_name_safe};
use crate::{
    config::S3Settings,
    models::multipart::{MultipartPart, MultipartUpload},
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    Client,
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
};
use bytes::Bytes;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, warn};

/// S3 DeleteObjects accepts at most this many keys per request.
const DELETE_BATCH: usize = 1000;

/// The object-store calls the multipart backend relies on.
#[async_trait]
pub trait MultipartApi: Send + Sync {
    /// Open a multipart upload and return the backend-assigned token.
    async fn create_multipart(&self, key: &str) -> StorageResult<String>;

    /// Upload one part and return its completion token (ETag).
    async fn upload_part(
        &self,
        key: &str,
        token: &str,
        part_number: i32,
        body: Bytes,
    ) -> StorageResult<String>;

    /// Finalize a multipart upload from parts sorted by part number.
    async fn complete_multipart(
        &self,
        key: &str,
        token: &str,
        parts: &[(i32, String)],
    ) -> StorageResult<()>;

    /// Abort a multipart upload; an unknown token is not an error.
    async fn abort_multipart(&self, key: &str, token: &str) -> StorageResult<()>;

    async fn copy_object(&self, from: &str, to: &str) -> StorageResult<()>;

    async fn get_object(&self, key: &str) -> StorageResult<Bytes>;

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>>;

    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()>;
}

/// `MultipartApi` over the AWS SDK.
#[derive(Clone)]
pub struct S3MultipartApi {
    client: Client,
    bucket: String,
}

impl S3MultipartApi {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from configuration. Custom endpoints (MinIO, RustFS, R2)
    /// get path-style addressing.
    pub async fn from_settings(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let Some((id, secret)) = &settings.credentials {
            loader = loader.credentials_provider(Credentials::new(
                id.clone(),
                secret.clone(),
                None,
                None,
                "media-store",
            ));
        }
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let aws_config = loader.load().await;

        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(settings.endpoint.is_some())
                .build(),
        );
        Self::new(client, settings.bucket.clone())
    }

    fn map_err<E>(err: E) -> StorageError
    where
        E: std::error::Error,
    {
        StorageError::Backend(DisplayErrorContext(&err).to_string())
    }
}

#[async_trait]
impl MultipartApi for S3MultipartApi {
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(Self::map_err)?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Backend("multipart upload returned no upload id".into()))
    }

    async fn upload_part(
        &self,
        key: &str,
        token: &str,
        part_number: i32,
        body: Bytes,
    ) -> StorageResult<String> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(token)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(Self::map_err)?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Backend(format!("part {} returned no ETag", part_number)))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        token: &str,
        parts: &[(i32, String)],
    ) -> StorageResult<()> {
        let completed = parts
            .iter()
            .map(|(number, etag)| {
                CompletedPart::builder()
                    .part_number(*number)
                    .e_tag(etag)
                    .build()
            })
            .collect::<Vec<_>>();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(token)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, token: &str) -> StorageResult<()> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(token)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_upload())
                    .unwrap_or(false) =>
            {
                Ok(())
            }
            Err(err) => Err(Self::map_err(err)),
        }
    }

    async fn copy_object(&self, from: &str, to: &str) -> StorageResult<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, encode_copy_source(from)))
            .key(to)
            .send()
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> StorageResult<Bytes> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false) =>
            {
                return Err(StorageError::FileNotFound(key.to_string()));
            }
            Err(err) => return Err(Self::map_err(err)),
        };

        let data = output.body.collect().await.map_err(Self::map_err)?;
        Ok(data.into_bytes())
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(Self::map_err)?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(Self::map_err)?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(Self::map_err)?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(Self::map_err)?;
        }
        Ok(())
    }
}

/// Percent-encode an object key for the `x-amz-copy-source` header.
fn encode_copy_source(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Storage backend that turns chunks into multipart-upload parts.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    api: Arc<dyn MultipartApi>,
    db: Arc<SqlitePool>,
    prefix: String,
}

impl ObjectStoreBackend {
    pub fn new(api: Arc<dyn MultipartApi>, db: Arc<SqlitePool>, prefix: impl Into<String>) -> Self {
        Self {
            api,
            db,
            prefix: prefix.into(),
        }
    }

    fn upload_prefix(&self, upload_id: &str) -> String {
        format!("{}{}/", self.prefix, upload_id)
    }

    fn staging_key(&self, upload_id: &str) -> String {
        format!("{}file", self.upload_prefix(upload_id))
    }

    fn object_key(&self, file_name: &str) -> String {
        format!("{}{}", self.prefix, file_name)
    }

    async fn fetch_multipart(&self, upload_id: &str) -> StorageResult<Option<MultipartUpload>> {
        let row = sqlx::query_as::<_, MultipartUpload>(
            "SELECT upload_id, object_key, backend_upload_id, created_at
             FROM multipart_uploads WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    /// Return the multipart upload for `upload_id`, opening one on first use.
    ///
    /// When two first chunks race, the request that loses the insert aborts
    /// the token it opened and adopts the persisted one.
    async fn ensure_multipart(&self, upload_id: &str) -> StorageResult<MultipartUpload> {
        if let Some(existing) = self.fetch_multipart(upload_id).await? {
            return Ok(existing);
        }

        let key = self.staging_key(upload_id);
        let token = self.api.create_multipart(&key).await?;
        let inserted = sqlx::query(
            "INSERT INTO multipart_uploads (upload_id, object_key, backend_upload_id, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(upload_id) DO NOTHING",
        )
        .bind(upload_id)
        .bind(&key)
        .bind(&token)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        if inserted.rows_affected() == 0 {
            if let Err(err) = self.api.abort_multipart(&key, &token).await {
                warn!(upload_id, "failed to abort duplicate multipart upload: {}", err);
            }
        } else {
            debug!(upload_id, key = %key, "opened multipart upload");
        }

        self.fetch_multipart(upload_id).await?.ok_or_else(|| {
            StorageError::Backend(format!("multipart state for `{}` vanished", upload_id))
        })
    }

    async fn fetch_parts(&self, upload_id: &str) -> StorageResult<Vec<MultipartPart>> {
        let parts = sqlx::query_as::<_, MultipartPart>(
            "SELECT upload_id, part_number, etag, uploaded_at
             FROM multipart_parts WHERE upload_id = ?
             ORDER BY part_number ASC",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(parts)
    }

    async fn forget_multipart(&self, upload_id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM multipart_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn save_chunk(
        &self,
        upload_id: &str,
        chunk_index: i64,
        bytes: Bytes,
    ) -> StorageResult<()> {
        ensure_name_safe("uploadId", upload_id)?;
        let part_number = i32::try_from(chunk_index + 1).map_err(|_| StorageError::InvalidName {
            field: "chunkIndex",
            value: chunk_index.to_string(),
        })?;

        let multipart = self.ensure_multipart(upload_id).await?;
        let etag = self
            .api
            .upload_part(
                &multipart.object_key,
                &multipart.backend_upload_id,
                part_number,
                bytes,
            )
            .await?;

        sqlx::query(
            "INSERT INTO multipart_parts (upload_id, part_number, etag, uploaded_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(upload_id, part_number) DO UPDATE SET
                etag = excluded.etag,
                uploaded_at = excluded.uploaded_at",
        )
        .bind(upload_id)
        .bind(part_number as i64)
        .bind(&etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        debug!(upload_id, part_number, "uploaded part");
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

        let incomplete = |missing: Vec<i64>| StorageError::IncompleteUpload {
            upload_id: upload_id.to_string(),
            missing,
        };
        let Some(multipart) = self.fetch_multipart(upload_id).await? else {
            return Err(incomplete((0..total_chunks).collect()));
        };

        let parts = self.fetch_parts(upload_id).await?;
        let missing = (1..=total_chunks)
            .filter(|number| !parts.iter().any(|p| p.part_number == *number))
            .map(|number| number - 1)
            .collect::<Vec<_>>();
        if total_chunks < 1 || parts.len() as i64 != total_chunks || !missing.is_empty() {
            return Err(incomplete(missing));
        }

        let ordered = parts
            .into_iter()
            .map(|p| (p.part_number as i32, p.etag))
            .collect::<Vec<_>>();
        self.api
            .complete_multipart(&multipart.object_key, &multipart.backend_upload_id, &ordered)
            .await?;

        let final_key = self.object_key(file_name);
        self.api.copy_object(&multipart.object_key, &final_key).await?;
        self.api
            .delete_objects(std::slice::from_ref(&multipart.object_key))
            .await?;
        self.forget_multipart(upload_id).await?;

        debug!(upload_id, key = %final_key, total_chunks, "completed multipart upload");
        Ok(())
    }

    async fn get_file(&self, file_name: &str) -> StorageResult<Bytes> {
        ensure_name_safe("fileName", file_name)?;
        self.api.get_object(&self.object_key(file_name)).await
    }

    async fn cleanup(&self, upload_id: &str) -> StorageResult<()> {
        ensure_name_safe("uploadId", upload_id)?;

        if let Some(multipart) = self.fetch_multipart(upload_id).await? {
            self.api
                .abort_multipart(&multipart.object_key, &multipart.backend_upload_id)
                .await?;
        }

        let keys = self.api.list_keys(&self.upload_prefix(upload_id)).await?;
        if !keys.is_empty() {
            debug!(upload_id, count = keys.len(), "deleting leftover objects");
            self.api.delete_objects(&keys).await?;
        }

        self.forget_multipart(upload_id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;
    use std::{
        collections::{BTreeMap, HashMap},
        sync::Mutex,
    };

    /// In-memory stand-in for an S3 bucket.
    #[derive(Default)]
    pub(crate) struct InMemoryApi {
        objects: Mutex<BTreeMap<String, Bytes>>,
        uploads: Mutex<HashMap<String, (String, BTreeMap<i32, Bytes>)>>,
        next_token: Mutex<u64>,
        pub completed: Mutex<Vec<Vec<i32>>>,
    }

    impl InMemoryApi {
        pub(crate) fn open_uploads(&self) -> usize {
            self.uploads.lock().unwrap().len()
        }

        pub(crate) fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }

        pub(crate) fn put(&self, key: &str, data: &'static [u8]) {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), Bytes::from_static(data));
        }
    }

    #[async_trait]
    impl MultipartApi for InMemoryApi {
        async fn create_multipart(&self, key: &str) -> StorageResult<String> {
            let mut next = self.next_token.lock().unwrap();
            *next += 1;
            let token = format!("token-{}", next);
            self.uploads
                .lock()
                .unwrap()
                .insert(token.clone(), (key.to_string(), BTreeMap::new()));
            Ok(token)
        }

        async fn upload_part(
            &self,
            _key: &str,
            token: &str,
            part_number: i32,
            body: Bytes,
        ) -> StorageResult<String> {
            let mut uploads = self.uploads.lock().unwrap();
            let (_, parts) = uploads
                .get_mut(token)
                .ok_or_else(|| StorageError::Backend("NoSuchUpload".into()))?;
            parts.insert(part_number, body);
            Ok(format!("\"etag-{}\"", part_number))
        }

        async fn complete_multipart(
            &self,
            key: &str,
            token: &str,
            parts: &[(i32, String)],
        ) -> StorageResult<()> {
            let (_, stored) = self
                .uploads
                .lock()
                .unwrap()
                .remove(token)
                .ok_or_else(|| StorageError::Backend("NoSuchUpload".into()))?;
            let mut data = Vec::new();
            for (number, _) in parts {
                data.extend_from_slice(&stored[number]);
            }
            self.completed
                .lock()
                .unwrap()
                .push(parts.iter().map(|(n, _)| *n).collect());
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), Bytes::from(data));
            Ok(())
        }

        async fn abort_multipart(&self, _key: &str, token: &str) -> StorageResult<()> {
            self.uploads.lock().unwrap().remove(token);
            Ok(())
        }

        async fn copy_object(&self, from: &str, to: &str) -> StorageResult<()> {
            let mut objects = self.objects.lock().unwrap();
            let data = objects
                .get(from)
                .cloned()
                .ok_or_else(|| StorageError::FileNotFound(from.to_string()))?;
            objects.insert(to.to_string(), data);
            Ok(())
        }

        async fn get_object(&self, key: &str) -> StorageResult<Bytes> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::FileNotFound(key.to_string()))
        }

        async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
            let mut objects = self.objects.lock().unwrap();
            for key in keys {
                objects.remove(key);
            }
            Ok(())
        }
    }

    async fn backend() -> (ObjectStoreBackend, Arc<InMemoryApi>, Arc<SqlitePool>) {
        let pool = Arc::new(db::test_pool().await);
        let api = Arc::new(InMemoryApi::default());
        let backend = ObjectStoreBackend::new(api.clone(), pool.clone(), "media/");
        (backend, api, pool)
    }

    #[tokio::test]
    async fn parts_are_completed_in_part_number_order() {
        let (backend, api, pool) = backend().await;

        backend.save_chunk("up", 2, Bytes::from_static(b"cc")).await.unwrap();
        backend.save_chunk("up", 0, Bytes::from_static(b"aa")).await.unwrap();
        backend.save_chunk("up", 1, Bytes::from_static(b"bb")).await.unwrap();
        assert_eq!(api.open_uploads(), 1);

        backend.assemble_file("up", "show.mp3", 3).await.unwrap();

        assert_eq!(api.completed.lock().unwrap().as_slice(), &[vec![1, 2, 3]]);
        assert_eq!(&backend.get_file("show.mp3").await.unwrap()[..], b"aabbcc");
        assert_eq!(api.keys(), vec!["media/show.mp3".to_string()]);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM multipart_parts")
            .fetch_one(&*pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn multipart_state_survives_a_new_backend_instance() {
        let (backend, api, pool) = backend().await;
        backend.save_chunk("up", 0, Bytes::from_static(b"aa")).await.unwrap();

        // a fresh instance sharing the database picks up the same token
        let restarted = ObjectStoreBackend::new(api.clone(), pool, "media/");
        restarted.save_chunk("up", 1, Bytes::from_static(b"bb")).await.unwrap();
        restarted.assemble_file("up", "ep.wav", 2).await.unwrap();

        assert_eq!(api.open_uploads(), 0);
        assert_eq!(&restarted.get_file("ep.wav").await.unwrap()[..], b"aabb");
    }

    #[tokio::test]
    async fn assembly_requires_every_part() {
        let (backend, api, _pool) = backend().await;
        backend.save_chunk("up", 0, Bytes::from_static(b"aa")).await.unwrap();
        backend.save_chunk("up", 2, Bytes::from_static(b"cc")).await.unwrap();

        match backend.assemble_file("up", "show.mp3", 3).await {
            Err(StorageError::IncompleteUpload { missing, .. }) => assert_eq!(missing, vec![1]),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert!(api.completed.lock().unwrap().is_empty());

        match backend.assemble_file("never", "show.mp3", 2).await {
            Err(StorageError::IncompleteUpload { missing, .. }) => assert_eq!(missing, vec![0, 1]),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn resent_chunk_replaces_its_part() {
        let (backend, _api, _pool) = backend().await;
        backend.save_chunk("up", 0, Bytes::from_static(b"old")).await.unwrap();
        backend.save_chunk("up", 0, Bytes::from_static(b"new")).await.unwrap();
        backend.assemble_file("up", "one.mp3", 1).await.unwrap();
        assert_eq!(&backend.get_file("one.mp3").await.unwrap()[..], b"new");
    }

    #[tokio::test]
    async fn cleanup_aborts_and_deletes_prefix() {
        let (backend, api, pool) = backend().await;
        backend.save_chunk("up", 0, Bytes::from_static(b"aa")).await.unwrap();
        api.put("media/up/file", b"stale");
        api.put("media/up/extra", b"stale");
        api.put("media/other/file", b"keep");

        backend.cleanup("up").await.unwrap();
        backend.cleanup("up").await.unwrap();

        assert_eq!(api.open_uploads(), 0);
        assert_eq!(api.keys(), vec!["media/other/file".to_string()]);
        let state: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM multipart_uploads")
            .fetch_one(&*pool)
            .await
            .unwrap();
        assert_eq!(state, 0);
    }

    #[test]
    fn copy_source_is_percent_encoded() {
        assert_eq!(encode_copy_source("a/b c+d.mp3"), "a/b%20c%2Bd.mp3");
    }
}
