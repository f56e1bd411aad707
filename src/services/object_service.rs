//! src/services/object_service.rs
//!
//! ObjectService - the public create/fetch/status/delete surface of the
//! ephemeral store. Composes the blob store, the metadata registry and the
//! lifecycle manager; handlers only ever talk to this type.
//!
//! Single-use objects are deleted after a *complete* download: a fetch
//! claims the object (concurrent fetches get `NotFound`), and the claim
//! turns into a deletion once the last stored byte has been handed out. A
//! download that is dropped early releases the claim and the object stays
//! retrievable until its TTL.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::{
    io,
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::{
    errors::{StoreError, StoreResult},
    models::object::{ConsumptionPolicy, ObjectMeta, ObjectStatus, sanitize_filename},
    services::{
        blob_store::{BlobStore, TypeAllowlist},
        id_generator::ObjectId,
        lifecycle::{LifecycleManager, MAX_TTL},
        registry::{Lookup, MetadataRegistry, ObjectRecord, RegistryStats, TransferState},
    },
};

const READ_CHUNK: usize = 64 * 1024;
const DEFAULT_MIME: &str = "application/octet-stream";

/// Everything the store needs to know from configuration.
#[derive(Clone, Debug)]
pub struct StoreSettings {
    pub storage_dir: PathBuf,
    pub max_file_size: u64,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub policy: ConsumptionPolicy,
    pub allowlist: TypeAllowlist,
    /// How long an expired id keeps answering `Expired` instead of `NotFound`.
    pub expired_retention: Duration,
}

/// Parameters of a single upload.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub original_name: String,
    pub mime_type: String,
    /// Size announced by the client, if any. Checked before any byte is
    /// written.
    pub declared_size: Option<u64>,
    pub size_limit: u64,
    pub ttl: Duration,
    pub policy: ConsumptionPolicy,
}

/// A fetched object: its metadata and the body to stream out.
pub struct ObjectDownload {
    pub meta: ObjectMeta,
    pub body: DownloadStream,
}

/// Streams a blob and, for single-use objects, finalizes the deletion as
/// soon as the last byte has been handed out.
///
/// HTTP/1 servers stop polling a body once `Content-Length` bytes are
/// written, so end of stream is never relied on to finish a transfer.
pub struct DownloadStream {
    inner: ReaderStream<File>,
    finalizer: Option<SingleUseFinalizer>,
}

struct SingleUseFinalizer {
    id: ObjectId,
    lifecycle: LifecycleManager,
    registry: Arc<MetadataRegistry>,
    expected: u64,
    delivered: u64,
    settled: bool,
}

impl SingleUseFinalizer {
    fn record(&mut self, bytes: usize) {
        self.delivered += bytes as u64;
    }

    fn is_complete(&self) -> bool {
        self.delivered >= self.expected
    }

    /// Consume the object if every byte went out, otherwise give the claim
    /// back so a retry can have it.
    fn settle(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        if self.delivered == self.expected {
            if self.lifecycle.consume_detached(&self.id) {
                info!(id = %self.id, bytes = self.delivered, "single-use object delivered");
            }
        } else {
            debug!(
                id = %self.id,
                delivered = self.delivered,
                expected = self.expected,
                "download incomplete; releasing claim"
            );
            self.registry.release(&self.id);
        }
    }
}

impl Drop for SingleUseFinalizer {
    fn drop(&mut self) {
        self.settle();
    }
}

impl Stream for DownloadStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(finalizer) = this.finalizer.as_mut() {
                    finalizer.record(chunk.len());
                    if finalizer.is_complete() {
                        finalizer.settle();
                        this.finalizer = None;
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                if let Some(mut finalizer) = this.finalizer.take() {
                    finalizer.settle();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ObjectService {
    registry: Arc<MetadataRegistry>,
    blobs: Arc<BlobStore>,
    lifecycle: LifecycleManager,
    settings: Arc<StoreSettings>,
}

impl ObjectService {
    /// Prepare the storage root, purge whatever a previous process left in
    /// it, and start the timer wheel and the sweep loop.
    pub async fn start(settings: StoreSettings) -> io::Result<Self> {
        fs::create_dir_all(&settings.storage_dir).await?;

        let registry = Arc::new(MetadataRegistry::new());
        let blobs = Arc::new(BlobStore::new(
            settings.storage_dir.clone(),
            settings.allowlist.clone(),
        ));
        let lifecycle =
            LifecycleManager::start(registry.clone(), blobs.clone(), settings.expired_retention);

        lifecycle.reconcile_startup().await?;
        lifecycle.spawn_sweeper(settings.sweep_interval);

        Ok(Self {
            registry,
            blobs,
            lifecycle,
            settings: Arc::new(settings),
        })
    }

    #[cfg(test)]
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// An upload request carrying the configured limits.
    pub fn upload_request(
        &self,
        original_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> UploadRequest {
        UploadRequest {
            original_name: original_name.into(),
            mime_type: mime_type.into(),
            declared_size: None,
            size_limit: self.settings.max_file_size,
            ttl: self.settings.ttl,
            policy: self.settings.policy,
        }
    }

    /// Store an upload and schedule its deletion.
    ///
    /// Nothing is registered unless the blob was written completely.
    pub async fn create<S>(&self, stream: S, request: UploadRequest) -> StoreResult<ObjectMeta>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        if request
            .declared_size
            .is_some_and(|declared| declared > request.size_limit)
        {
            return Err(StoreError::SizeExceeded {
                limit: request.size_limit,
            });
        }

        let original_name = sanitize_filename(&request.original_name);
        let mime_type = normalize_mime(&request.mime_type);
        let id = ObjectId::generate()?;

        let blob = self
            .blobs
            .put(&id, stream, request.size_limit, &mime_type, &original_name)
            .await?;

        let created_at = Utc::now();
        let meta = ObjectMeta {
            id: id.clone(),
            storage_path: blob.path.clone(),
            original_name,
            mime_type,
            size_bytes: blob.size_bytes,
            etag: blob.etag.clone(),
            created_at,
            expires_at: expiry_after(created_at, request.ttl),
            policy: request.policy,
        };

        if let Err(err) = self.registry.insert(ObjectRecord::new(meta.clone())) {
            error!(%id, error = %err, "identifier collision; generator invariant broken");
            return Err(err);
        }
        let handle = self.lifecycle.schedule(&id, meta.expires_at);
        if let Some(orphaned) = self.registry.set_deletion_handle(&id, handle) {
            orphaned.cancel();
        }
        // Registered; the sweep may now see the blob as live.
        drop(blob);

        info!(
            %id,
            size = meta.size_bytes,
            mime = %meta.mime_type,
            policy = %meta.policy,
            expires_at = %meta.expires_at,
            "object stored"
        );
        Ok(meta)
    }

    /// Open an object for download.
    pub async fn fetch(&self, id: &ObjectId) -> StoreResult<ObjectDownload> {
        let meta = match self.registry.lookup(id) {
            Lookup::Live { meta, .. } => meta,
            Lookup::Expired => return Err(StoreError::Expired),
            Lookup::Missing => return Err(StoreError::NotFound),
        };

        if meta.is_expired_at(Utc::now()) {
            self.lifecycle.expire(id).await;
            return Err(StoreError::Expired);
        }

        let finalizer = match meta.policy {
            ConsumptionPolicy::TtlOnly => None,
            ConsumptionPolicy::SingleUse => {
                if !self.registry.claim(id) {
                    return Err(self.gone_reason(id));
                }
                Some(SingleUseFinalizer {
                    id: id.clone(),
                    lifecycle: self.lifecycle.clone(),
                    registry: self.registry.clone(),
                    expected: meta.size_bytes,
                    delivered: 0,
                    settled: false,
                })
            }
        };

        // On failure the finalizer is dropped here and releases the claim.
        let file = self.blobs.open_for_read(&meta.storage_path).await?;

        debug!(%id, policy = %meta.policy, "streaming object");
        Ok(ObjectDownload {
            meta,
            body: DownloadStream {
                inner: ReaderStream::with_capacity(file, READ_CHUNK),
                finalizer,
            },
        })
    }

    /// Describe an object without touching its lifecycle.
    pub fn status(&self, id: &ObjectId) -> StoreResult<ObjectStatus> {
        match self.registry.lookup(id) {
            Lookup::Live { meta, .. } if meta.is_expired_at(Utc::now()) => Err(StoreError::Expired),
            Lookup::Live { meta, state } => Ok(ObjectStatus {
                exists: true,
                id: meta.id,
                original_name: meta.original_name,
                mime_type: meta.mime_type,
                size: meta.size_bytes,
                created_at: meta.created_at,
                expires_at: meta.expires_at,
                policy: meta.policy,
                downloading: state == TransferState::Claimed,
            }),
            Lookup::Expired => Err(StoreError::Expired),
            Lookup::Missing => Err(StoreError::NotFound),
        }
    }

    /// Remove an object before its deadline.
    pub async fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        if self.lifecycle.consume(id).await {
            info!(%id, "object deleted on request");
            Ok(())
        } else {
            Err(self.gone_reason(id))
        }
    }

    pub async fn probe_storage(&self) -> io::Result<()> {
        self.blobs.probe().await
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Stop background tasks. Stored blobs stay on disk until the next
    /// start purges them.
    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }

    fn gone_reason(&self, id: &ObjectId) -> StoreError {
        if self.registry.is_expired(id) {
            StoreError::Expired
        } else {
            StoreError::NotFound
        }
    }
}

fn normalize_mime(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_control) {
        DEFAULT_MIME.to_string()
    } else {
        trimmed.to_string()
    }
}

fn expiry_after(created_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl.min(MAX_TTL)).unwrap_or(chrono::Duration::zero());
    created_at + ttl
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{StreamExt, stream};
    use tempfile::TempDir;

    fn settings(dir: &TempDir, policy: ConsumptionPolicy) -> StoreSettings {
        StoreSettings {
            storage_dir: dir.path().join("blobs"),
            max_file_size: 1024,
            ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(3600),
            policy,
            allowlist: TypeAllowlist::default(),
            expired_retention: Duration::from_secs(3600),
        }
    }

    fn body(content: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(
            content
                .chunks(7)
                .map(|c| Ok::<_, io::Error>(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
    }

    async fn drain(mut body: DownloadStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    async fn wait_until_gone(path: &std::path::Path) -> bool {
        for _ in 0..50 {
            if !path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn fetch_returns_original_bytes_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let service = ObjectService::start(settings(&dir, ConsumptionPolicy::TtlOnly))
            .await
            .unwrap();
        let content: &'static [u8] = b"the quick brown fox jumps over the lazy dog";

        let meta = service
            .create(body(content), service.upload_request("fox.txt", "text/plain"))
            .await
            .unwrap();
        assert_eq!(meta.size_bytes, content.len() as u64);

        let download = service.fetch(&meta.id).await.unwrap();
        assert_eq!(download.meta.original_name, "fox.txt");
        assert_eq!(download.meta.mime_type, "text/plain");
        assert_eq!(drain(download.body).await, content);

        // TTL-only objects survive repeated downloads.
        let again = service.fetch(&meta.id).await.unwrap();
        assert_eq!(drain(again.body).await, content);
    }

    #[tokio::test]
    async fn single_use_second_fetch_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = ObjectService::start(settings(&dir, ConsumptionPolicy::SingleUse))
            .await
            .unwrap();
        let meta = service
            .create(body(b"secret"), service.upload_request("s.txt", "text/plain"))
            .await
            .unwrap();

        let first = service.fetch(&meta.id).await.unwrap();
        assert_eq!(drain(first.body).await, b"secret");

        assert!(matches!(service.fetch(&meta.id).await, Err(StoreError::NotFound)));
        assert!(wait_until_gone(&meta.storage_path).await);
    }

    #[tokio::test]
    async fn abandoned_single_use_download_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let service = ObjectService::start(settings(&dir, ConsumptionPolicy::SingleUse))
            .await
            .unwrap();
        let meta = service
            .create(body(b"retry me"), service.upload_request("r.txt", "text/plain"))
            .await
            .unwrap();

        let abandoned = service.fetch(&meta.id).await.unwrap();
        assert!(service.status(&meta.id).unwrap().downloading);
        drop(abandoned);

        let retry = service.fetch(&meta.id).await.unwrap();
        assert_eq!(drain(retry.body).await, b"retry me");
        assert!(matches!(service.fetch(&meta.id).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn single_use_is_consumed_on_last_chunk_without_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let service = ObjectService::start(settings(&dir, ConsumptionPolicy::SingleUse))
            .await
            .unwrap();
        let content: &'static [u8] = b"served with a content length";
        let meta = service
            .create(body(content), service.upload_request("cl.txt", "text/plain"))
            .await
            .unwrap();

        // Read exactly the stored size, then stop polling like an HTTP/1
        // writer that has satisfied Content-Length.
        let mut download = service.fetch(&meta.id).await.unwrap().body;
        let mut received = Vec::new();
        while (received.len() as u64) < meta.size_bytes {
            received.extend_from_slice(&download.next().await.unwrap().unwrap());
        }
        drop(download);

        assert_eq!(received, content);
        assert!(matches!(service.fetch(&meta.id).await, Err(StoreError::NotFound)));
        assert!(wait_until_gone(&meta.storage_path).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_single_use_fetch_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let service = ObjectService::start(settings(&dir, ConsumptionPolicy::SingleUse))
            .await
            .unwrap();
        let meta = service
            .create(body(b"only once"), service.upload_request("o.txt", "text/plain"))
            .await
            .unwrap();

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let service = service.clone();
                let id = meta.id.clone();
                tokio::spawn(async move {
                    match service.fetch(&id).await {
                        Ok(download) => Ok(drain(download.body).await),
                        Err(err) => Err(err),
                    }
                })
            })
            .collect();

        let mut delivered = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(bytes) => {
                    assert_eq!(bytes, b"only once");
                    delivered += 1;
                }
                Err(err) => assert!(matches!(err, StoreError::NotFound)),
            }
        }
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn fetch_detects_expiry_without_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let service = ObjectService::start(settings(&dir, ConsumptionPolicy::TtlOnly))
            .await
            .unwrap();
        let mut request = service.upload_request("t.txt", "text/plain");
        request.ttl = Duration::from_millis(100);
        let meta = service.create(body(b"short lived"), request).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(matches!(service.fetch(&meta.id).await, Err(StoreError::Expired)));
        assert!(wait_until_gone(&meta.storage_path).await);
        assert!(matches!(service.status(&meta.id), Err(StoreError::Expired)));
    }

    #[tokio::test]
    async fn oversized_upload_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let service = ObjectService::start(settings(&dir, ConsumptionPolicy::TtlOnly))
            .await
            .unwrap();
        let mut request = service.upload_request("big.bin", "application/octet-stream");
        request.size_limit = 4;

        let err = service.create(body(b"12345"), request).await.unwrap_err();

        assert!(matches!(err, StoreError::SizeExceeded { limit: 4 }));
        assert_eq!(service.stats().live, 0);
        let mut listing = fs::read_dir(&service.settings().storage_dir).await.unwrap();
        assert!(listing.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn declared_size_over_limit_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let service = ObjectService::start(settings(&dir, ConsumptionPolicy::TtlOnly))
            .await
            .unwrap();
        let mut request = service.upload_request("big.bin", "application/octet-stream");
        request.declared_size = Some(2048);

        let err = service.create(body(b"tiny"), request).await.unwrap_err();
        assert!(matches!(err, StoreError::SizeExceeded { limit: 1024 }));
    }

    #[tokio::test]
    async fn startup_purges_preexisting_files() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir, ConsumptionPolicy::TtlOnly);
        std::fs::create_dir_all(&settings.storage_dir).unwrap();
        for i in 0..4 {
            std::fs::write(settings.storage_dir.join(format!("leftover-{i}")), b"x").unwrap();
        }

        let service = ObjectService::start(settings).await.unwrap();

        let mut listing = fs::read_dir(&service.settings().storage_dir).await.unwrap();
        assert!(listing.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let service = ObjectService::start(settings(&dir, ConsumptionPolicy::TtlOnly))
            .await
            .unwrap();
        let meta = service
            .create(body(b"status"), service.upload_request("../x/s.txt", ""))
            .await
            .unwrap();

        let status = service.status(&meta.id).unwrap();
        assert!(status.exists);
        assert_eq!(status.original_name, "s.txt");
        assert_eq!(status.mime_type, DEFAULT_MIME);
        assert_eq!(status.size, 6);
        assert!(!status.downloading);

        service.delete(&meta.id).await.unwrap();
        assert!(!meta.storage_path.exists());
        assert!(matches!(service.status(&meta.id), Err(StoreError::NotFound)));
        assert!(matches!(service.delete(&meta.id).await, Err(StoreError::NotFound)));
    }
}
