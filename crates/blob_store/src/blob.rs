//! Handle to one stored blob.

use std::sync::{
    Arc,
    PoisonError,
    RwLock,
    atomic::{AtomicBool, Ordering},
};

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream::BoxStream};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    BlobError,
    BlobResult,
    attributes::{BlobMetrics, Headers},
    id::BlobId,
    traits::StorageBackend,
};

#[derive(Debug, Clone)]
struct LoadedState {
    headers: Headers,
    metrics: BlobMetrics,
    deleted: bool,
}

/// A blob shared by every caller in this process that is using it.
///
/// Headers and metrics are populated by the store when the blob is created or
/// refreshed; until then they are unavailable. The async lock serializes
/// writers of this blob.
pub struct Blob {
    id: BlobId,
    content_key: String,
    backend: Arc<dyn StorageBackend>,
    lock: Mutex<()>,
    stale: AtomicBool,
    state: RwLock<Option<LoadedState>>,
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.id)
            .field("content_key", &self.content_key)
            .field("stale", &self.is_stale())
            .finish()
    }
}

impl Blob {
    pub(crate) fn new(id: BlobId, content_key: String, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            id,
            content_key,
            backend,
            lock: Mutex::new(()),
            stale: AtomicBool::new(true),
            state: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &BlobId {
        &self.id
    }

    /// Fails when the blob's attributes were never loaded.
    pub fn ensure_loaded(&self) -> BlobResult<()> {
        self.loaded(|_| ())
    }

    pub fn headers(&self) -> BlobResult<Headers> {
        self.loaded(|state| state.headers.clone())
    }

    pub fn metrics(&self) -> BlobResult<BlobMetrics> {
        self.loaded(|state| state.metrics.clone())
    }

    /// Whether the last load saw a soft-deleted blob.
    pub fn is_deleted(&self) -> bool {
        self.read_state().as_ref().is_some_and(|state| state.deleted)
    }

    /// Streams the content record.
    pub async fn open_stream(&self) -> BlobResult<BoxStream<'static, BlobResult<Bytes>>> {
        self.backend.get_object_stream(&self.content_key).await
    }

    /// Reads the whole content record into memory.
    pub async fn read_bytes(&self) -> BlobResult<Bytes> {
        let mut stream = self.open_stream().await?;
        let mut content = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            content.extend_from_slice(&chunk?);
        }
        Ok(content.freeze())
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Installs freshly loaded state and clears the stale flag.
    pub(crate) fn refresh(&self, headers: Headers, metrics: BlobMetrics, deleted: bool) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(LoadedState {
            headers,
            metrics,
            deleted,
        });
        self.stale.store(false, Ordering::SeqCst);
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, Option<LoadedState>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn loaded<T>(&self, read: impl FnOnce(&LoadedState) -> T) -> BlobResult<T> {
        self.read_state()
            .as_ref()
            .map(read)
            .ok_or_else(|| BlobError::consistency(format!("blob {} has not been loaded", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::backends::memory::InMemoryBackend;

    #[tokio::test]
    async fn test_unloaded_blob_is_a_consistency_error() {
        let blob = Blob::new(
            BlobId::new("x"),
            "content/x.bytes".to_string(),
            Arc::new(InMemoryBackend::new("bucket")),
        );
        assert!(blob.is_stale());
        assert!(matches!(blob.metrics(), Err(BlobError::Consistency { .. })));
        assert!(blob.headers().is_err());
        assert!(!blob.is_deleted());

        let metrics = BlobMetrics::new(Utc::now(), "00".repeat(32), 3);
        blob.refresh(Headers::new(), metrics.clone(), false);
        assert!(!blob.is_stale());
        assert_eq!(blob.metrics().unwrap(), metrics);
        blob.mark_stale();
        assert!(blob.is_stale());
        assert_eq!(blob.metrics().unwrap(), metrics);
    }

    #[tokio::test]
    async fn test_reads_content() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        memory
            .put_object("content/x.bytes", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        let blob = Blob::new(BlobId::new("x"), "content/x.bytes".to_string(), memory);
        assert_eq!(blob.read_bytes().await.unwrap(), "payload");
    }
}
