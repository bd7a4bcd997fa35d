//! The blob store: content and attributes records addressed by blob id.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{TimeDelta, Utc};
use futures::{
    FutureExt,
    StreamExt,
    TryStreamExt,
    future::{self, BoxFuture},
    stream::{self, BoxStream},
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    BlobError,
    BlobResult,
    accumulator::{BlobStoreMetrics, MetricsAccumulator},
    attributes::{
        ATTRIBUTES_SUFFIX,
        BlobAttributes,
        BlobMetrics,
        CONTENT_SUFFIX,
        Headers,
        is_direct_path,
        is_temporary,
        load_attributes,
        store_attributes,
    },
    backends::{memory::InMemoryBackend, s3::S3Backend},
    blob::Blob,
    config::{BackendKind, BlobStoreConfig},
    id::{BlobId, DIRECT_PATH_ROOT, blob_id_from_attributes_key, resolve_blob_id},
    live_blobs::LiveBlobCache,
    location::{StorageLocationManager, deleted_tag},
    metrics::OperationMetrics,
    properties::{Properties, load_properties, store_properties},
    traits::{ObjectTag, StorageBackend},
    transport::{ByteStream, Copier, StreamMetrics, Uploader},
};

const CONTENT_DIR: &str = "content/";
const METRICS_DIR: &str = "metrics/";
const METADATA_FILENAME: &str = "metadata.properties";
const METADATA_TYPE_KEY: &str = "type";
const METADATA_TYPE_V1: &str = "s3/1";
const LEGACY_FILE_TYPE_V1: &str = "file/1";
const HARD_DELETE_REASON: &str = "hard-delete";
const MAX_ASYNC_DELETES: usize = 8;

pub struct BlobStore {
    config: BlobStoreConfig,
    backend: Arc<dyn StorageBackend>,
    uploader: Uploader,
    copier: Copier,
    location: StorageLocationManager,
    accumulator: Arc<MetricsAccumulator>,
    live_blobs: LiveBlobCache,
    telemetry: OperationMetrics,
    content_prefix: String,
    metadata_key: String,
    cancel: CancellationToken,
    started: AtomicBool,
    async_deletes: Arc<Semaphore>,
}

impl BlobStore {
    /// Builds the configured backend and opens the store on it.
    pub async fn connect(config: BlobStoreConfig) -> BlobResult<Arc<Self>> {
        let backend: Arc<dyn StorageBackend> = match config.backend {
            BackendKind::S3 => Arc::new(S3Backend::new(&config).await?),
            BackendKind::Memory => Arc::new(InMemoryBackend::new(&config.bucket)),
        };
        Self::open(config, backend).await
    }

    /// Prepares the bucket, checks the store metadata record, starts metrics
    /// accounting and the transfer workers.
    pub async fn open(config: BlobStoreConfig, backend: Arc<dyn StorageBackend>) -> BlobResult<Arc<Self>> {
        config.validate()?;
        let location = StorageLocationManager::new(backend.clone());
        location.prepare_storage_location(&config).await?;

        let prefix = config.bucket_prefix();
        let metadata_key = format!("{}{}", prefix, METADATA_FILENAME);
        check_metadata(backend.as_ref(), &metadata_key).await?;

        let cancel = CancellationToken::new();
        let accumulator = MetricsAccumulator::new(
            backend.clone(),
            format!("{}{}", prefix, METRICS_DIR),
            &config.node_id,
            config.flush_interval(),
            cancel.child_token(),
        );
        accumulator.start().await?;

        let uploader = Uploader::from_config(&config.uploader, backend.clone(), cancel.clone());
        let copier = Copier::from_config(&config.copier, backend.clone(), cancel.clone());
        info!(
            store = %config.name,
            bucket = %config.bucket,
            prefix = %prefix,
            uploader = uploader.name(),
            copier = copier.name(),
            soft_delete = config.is_soft_delete_enabled(),
            "Blob store started"
        );

        Ok(Arc::new(Self {
            content_prefix: format!("{}{}", prefix, CONTENT_DIR),
            metadata_key,
            config,
            backend,
            uploader,
            copier,
            location,
            accumulator,
            live_blobs: LiveBlobCache::new(),
            telemetry: OperationMetrics::global(),
            cancel,
            started: AtomicBool::new(true),
            async_deletes: Arc::new(Semaphore::new(MAX_ASYNC_DELETES)),
        }))
    }

    pub fn config(&self) -> &BlobStoreConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn ensure_started(&self) -> BlobResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(BlobError::consistency(format!(
                "blob store {} is stopped",
                self.config.name
            )))
        }
    }

    fn observe<T>(&self, op: &'static str, result: BlobResult<T>) -> BlobResult<T> {
        if result.is_err() {
            self.telemetry.record_error(op);
        }
        result
    }

    pub fn content_key(&self, blob_id: &BlobId) -> String {
        format!("{}{}{}", self.content_prefix, blob_id.location(), CONTENT_SUFFIX)
    }

    pub fn attributes_key(&self, blob_id: &BlobId) -> String {
        format!("{}{}{}", self.content_prefix, blob_id.location(), ATTRIBUTES_SUFFIX)
    }

    fn live_blob(&self, blob_id: &BlobId) -> Arc<Blob> {
        self.live_blobs.get_or_insert_with(blob_id, || {
            Blob::new(blob_id.clone(), self.content_key(blob_id), self.backend.clone())
        })
    }

    // --- Writes ---

    /// Stores `stream` as a new blob.
    ///
    /// The id is `blob_id` when given, derived from the blob name for
    /// direct-path headers, or random otherwise. A direct-path blob replaces
    /// any blob stored under the same name.
    pub async fn create(
        &self,
        stream: ByteStream,
        headers: Headers,
        blob_id: Option<BlobId>,
    ) -> BlobResult<Arc<Blob>> {
        self.ensure_started()?;
        let _timer = self.telemetry.timer("create");
        let uploader = &self.uploader;
        let result = self
            .create_with(headers, blob_id, |key| async move {
                uploader.upload(&key, stream).await
            })
            .await;
        self.observe("create", result)
    }

    /// Copies the content of `blob_id` into a new blob with `headers`.
    /// The new blob keeps the source's hash and size.
    pub async fn copy(&self, blob_id: &BlobId, headers: Headers) -> BlobResult<Option<Arc<Blob>>> {
        self.ensure_started()?;
        let _timer = self.telemetry.timer("copy");
        let result = self.copy_blob(blob_id, headers).await;
        self.observe("copy", result)
    }

    async fn copy_blob(&self, blob_id: &BlobId, headers: Headers) -> BlobResult<Option<Arc<Blob>>> {
        let Some(source) = self.load_blob(blob_id, false).await? else {
            return Ok(None);
        };
        let metrics = source.metrics()?;
        let source_key = self.content_key(source.id());
        let copier = &self.copier;
        debug!(source = %blob_id, "Copying blob");
        let blob = self
            .create_with(headers, None, |destination| async move {
                copier.copy(&source_key, &destination).await?;
                Ok(StreamMetrics {
                    size: metrics.content_size,
                    sha256_hash: metrics.sha256_hash,
                })
            })
            .await?;
        Ok(Some(blob))
    }

    /// Writes content through `write_content` and then the attributes record,
    /// holding the blob lock. On failure both records are removed.
    async fn create_with<F, Fut>(
        &self,
        headers: Headers,
        assigned: Option<BlobId>,
        write_content: F,
    ) -> BlobResult<Arc<Blob>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = BlobResult<StreamMetrics>>,
    {
        let blob_id = resolve_blob_id(&headers, assigned)?;
        let content_key = self.content_key(&blob_id);
        let attributes_key = self.attributes_key(&blob_id);
        let blob = self.live_blob(&blob_id);
        let _guard = blob.lock().await;

        let replaced_size = if is_direct_path(&headers) {
            self.recorded_size(&attributes_key).await
        } else {
            None
        };
        debug!(blob_id = %blob_id, key = %content_key, "Writing blob");

        let written = async {
            let content = write_content(content_key.clone()).await?;
            let metrics = BlobMetrics::new(Utc::now(), content.sha256_hash, content.size);
            let attributes = BlobAttributes::new(headers.clone(), metrics.clone());
            store_attributes(self.backend.as_ref(), &attributes_key, &attributes)
                .await
                .map_err(|e| e.into_transfer(&attributes_key, None))?;
            Ok::<_, BlobError>(metrics)
        }
        .await;

        if let Some(size) = replaced_size {
            self.accumulator.record_deletion(size);
        }
        match written {
            Ok(metrics) => {
                self.accumulator.record_addition(metrics.content_size);
                blob.refresh(headers, metrics, false);
                Ok(Arc::clone(&blob))
            }
            Err(e) => {
                warn!(blob_id = %blob_id, error = %e, "Blob write failed, removing partial records");
                self.delete_quietly(&[attributes_key, content_key.clone()]).await;
                blob.mark_stale();
                Err(e.into_transfer(&content_key, None))
            }
        }
    }

    /// Size recorded for a live (not soft-deleted) blob at `attributes_key`.
    async fn recorded_size(&self, attributes_key: &str) -> Option<u64> {
        match load_attributes(self.backend.as_ref(), attributes_key).await {
            Ok(attributes) => attributes
                .filter(BlobAttributes::is_counted)
                .map(|a| a.metrics.content_size),
            Err(e) => {
                warn!(key = %attributes_key, error = %e, "Unable to read attributes of replaced blob");
                None
            }
        }
    }

    async fn delete_quietly(&self, keys: &[String]) {
        if let Err(e) = self.backend.delete_objects(keys).await {
            warn!(keys = ?keys, error = %e, "Failed to delete blob records");
        }
    }

    /// Replaces the headers of an existing blob, keeping its metrics.
    pub async fn make_permanent(&self, blob_id: &BlobId, headers: Headers) -> BlobResult<Option<Arc<Blob>>> {
        self.ensure_started()?;
        if is_temporary(&headers) {
            return Err(BlobError::consistency(format!(
                "permanent headers for blob {} still mark it temporary",
                blob_id
            )));
        }
        let blob = self.live_blob(blob_id);
        let _guard = blob.lock().await;
        let key = self.attributes_key(blob_id);
        let Some(mut attributes) = load_attributes(self.backend.as_ref(), &key).await? else {
            warn!(blob_id = %blob_id, "Attempt to make non-existent blob permanent");
            return Ok(None);
        };
        attributes.headers = headers;
        store_attributes(self.backend.as_ref(), &key, &attributes).await?;
        blob.refresh(attributes.headers, attributes.metrics, attributes.deleted);
        Ok(Some(Arc::clone(&blob)))
    }

    // --- Reads ---

    /// Returns the blob, or `None` when it does not exist or is soft-deleted
    /// and `include_deleted` is false.
    pub async fn get(&self, blob_id: &BlobId, include_deleted: bool) -> BlobResult<Option<Arc<Blob>>> {
        self.ensure_started()?;
        let _timer = self.telemetry.timer("get");
        let result = self.load_blob(blob_id, include_deleted).await;
        self.observe("get", result)
    }

    async fn load_blob(&self, blob_id: &BlobId, include_deleted: bool) -> BlobResult<Option<Arc<Blob>>> {
        let blob = self.live_blob(blob_id);
        if blob.is_stale() {
            let _guard = blob.lock().await;
            if blob.is_stale() {
                let key = self.attributes_key(blob_id);
                let Some(attributes) = load_attributes(self.backend.as_ref(), &key).await? else {
                    warn!(blob_id = %blob_id, "Attempt to access non-existent blob");
                    return Ok(None);
                };
                blob.refresh(attributes.headers, attributes.metrics, attributes.deleted);
            }
        }
        if blob.is_deleted() && !include_deleted {
            warn!(blob_id = %blob_id, "Attempt to access soft-deleted blob");
            return Ok(None);
        }
        Ok(Some(blob))
    }

    /// Whether the attributes record of `blob_id` exists, soft-deleted or not.
    pub async fn exists(&self, blob_id: &BlobId) -> BlobResult<bool> {
        self.ensure_started()?;
        let _timer = self.telemetry.timer("exists");
        let result = self
            .backend
            .head_object(&self.attributes_key(blob_id))
            .await
            .map(|summary| summary.is_some());
        self.observe("exists", result)
    }

    pub async fn get_blob_attributes(&self, blob_id: &BlobId) -> BlobResult<Option<BlobAttributes>> {
        self.ensure_started()?;
        load_attributes(self.backend.as_ref(), &self.attributes_key(blob_id)).await
    }

    /// Overwrites the stored attributes of an existing blob. Failures are
    /// logged and reported as `false`.
    pub async fn set_blob_attributes(&self, blob_id: &BlobId, attributes: &BlobAttributes) -> bool {
        if self.ensure_started().is_err() {
            return false;
        }
        let blob = self.live_blob(blob_id);
        let _guard = blob.lock().await;
        let key = self.attributes_key(blob_id);
        let written = async {
            let Some(mut existing) = load_attributes(self.backend.as_ref(), &key).await? else {
                return Ok(false);
            };
            let previous = (existing.is_counted(), existing.metrics.content_size);
            existing.update_from(attributes);
            store_attributes(self.backend.as_ref(), &key, &existing).await?;
            if !existing.is_counted() {
                self.tag_records(blob_id, vec![deleted_tag()]).await?;
            }
            match (previous, existing.is_counted()) {
                ((true, size), false) => self.accumulator.record_deletion(size),
                ((false, _), true) => self
                    .accumulator
                    .record_addition(existing.metrics.content_size),
                _ => {}
            }
            Ok::<_, BlobError>(true)
        }
        .await;
        blob.mark_stale();
        written.unwrap_or_else(|e| {
            error!(blob_id = %blob_id, error = %e, "Failed to write blob attributes");
            false
        })
    }

    // --- Deletes ---

    /// Soft-deletes the blob when retention is configured, otherwise removes
    /// it. Returns `false` when there was nothing to delete.
    pub async fn delete(&self, blob_id: &BlobId, reason: &str) -> BlobResult<bool> {
        self.ensure_started()?;
        if self.config.force_hard_delete || !self.config.is_soft_delete_enabled() {
            self.perform_hard_delete(blob_id).await
        } else {
            self.expire(blob_id, reason).await
        }
    }

    /// Removes the blob's records, unless `prefer_expire` turns this into a
    /// soft delete.
    pub async fn delete_hard(&self, blob_id: &BlobId) -> BlobResult<bool> {
        self.ensure_started()?;
        if !self.config.force_hard_delete
            && self.config.prefer_expire
            && self.config.is_soft_delete_enabled()
        {
            self.expire(blob_id, HARD_DELETE_REASON).await
        } else {
            self.perform_hard_delete(blob_id).await
        }
    }

    /// Hard-deletes the blob in the background.
    ///
    /// With `prefer_async_cleanup` the delete starts immediately on a spawned
    /// task (at most 8 run at once); otherwise it runs when the returned
    /// future is awaited.
    pub fn async_delete(self: &Arc<Self>, blob_id: BlobId) -> BoxFuture<'static, BlobResult<bool>> {
        let store = Arc::clone(self);
        if !self.config.prefer_async_cleanup {
            return async move { store.delete_hard(&blob_id).await }.boxed();
        }
        let permits = Arc::clone(&self.async_deletes);
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|e| BlobError::Other {
                source: anyhow::Error::from(e),
            })?;
            store.delete_hard(&blob_id).await
        });
        async move {
            handle.await.map_err(|e| BlobError::Other {
                source: anyhow::Error::from(e),
            })?
        }
        .boxed()
    }

    /// Hard-deletes the blob only if it is marked temporary.
    pub async fn delete_if_temp(&self, blob_id: &BlobId) -> BlobResult<bool> {
        self.ensure_started()?;
        let Some(blob) = self.load_blob(blob_id, true).await? else {
            return Ok(false);
        };
        let temporary = blob.headers().map(|h| is_temporary(&h)).unwrap_or(true);
        if !temporary {
            debug!(blob_id = %blob_id, "Not deleting permanent blob");
            return Ok(false);
        }
        self.delete_hard(blob_id).await
    }

    async fn expire(&self, blob_id: &BlobId, reason: &str) -> BlobResult<bool> {
        let _timer = self.telemetry.timer("soft_delete");
        let result = self.soft_delete(blob_id, reason).await;
        self.observe("soft_delete", result)
    }

    async fn soft_delete(&self, blob_id: &BlobId, reason: &str) -> BlobResult<bool> {
        let blob = self.live_blob(blob_id);
        let _guard = blob.lock().await;
        let key = self.attributes_key(blob_id);
        let Some(mut attributes) = load_attributes(self.backend.as_ref(), &key).await? else {
            warn!(blob_id = %blob_id, "Attempt to mark-for-delete non-existent blob");
            return Ok(false);
        };
        if !attributes.is_counted() {
            // A previous delete may have failed after writing the attributes.
            debug!(blob_id = %blob_id, "Blob is already soft-deleted, reapplying tags");
            self.tag_records(blob_id, vec![deleted_tag()]).await?;
            return Ok(false);
        }
        debug!(blob_id = %blob_id, reason = %reason, "Soft deleting blob");
        attributes.mark_deleted(reason);
        // Overwriting a record drops its tags, so tagging comes last.
        store_attributes(self.backend.as_ref(), &key, &attributes).await?;
        blob.mark_stale();
        self.accumulator.record_deletion(attributes.metrics.content_size);
        self.tag_records(blob_id, vec![deleted_tag()]).await?;
        Ok(true)
    }

    async fn perform_hard_delete(&self, blob_id: &BlobId) -> BlobResult<bool> {
        let _timer = self.telemetry.timer("hard_delete");
        let blob = self.live_blob(blob_id);
        let result = {
            let _guard = blob.lock().await;
            let removed = self.remove_records(blob_id).await;
            blob.mark_stale();
            removed
        };
        self.observe("hard_delete", result)
    }

    async fn remove_records(&self, blob_id: &BlobId) -> BlobResult<bool> {
        let attributes_key = self.attributes_key(blob_id);
        let content_key = self.content_key(blob_id);
        let recorded = match load_attributes(self.backend.as_ref(), &attributes_key).await {
            Ok(Some(attributes)) => Some(attributes),
            Ok(None) => {
                debug!(blob_id = %blob_id, "Blob already removed");
                self.delete_quietly(&[content_key]).await;
                return Ok(false);
            }
            Err(e) => {
                warn!(
                    blob_id = %blob_id,
                    error = %e,
                    "Unable to read attributes, the delete will not be reflected in metrics"
                );
                None
            }
        };
        debug!(blob_id = %blob_id, "Hard deleting blob");
        self.backend
            .delete_objects(&[attributes_key, content_key])
            .await?;
        if let Some(attributes) = recorded.filter(BlobAttributes::is_counted) {
            self.accumulator.record_deletion(attributes.metrics.content_size);
        }
        Ok(true)
    }

    /// Removes the deletion tag from both records. A soft-deleted blob is
    /// marked restored and counted in the store metrics again.
    ///
    /// The attributes' deleted flag is left as is; callers restoring a blob
    /// clear it with [`BlobStore::set_blob_attributes`].
    pub async fn undelete(&self, blob_id: &BlobId) -> BlobResult<bool> {
        self.ensure_started()?;
        let _timer = self.telemetry.timer("undelete");
        let result = self.restore(blob_id).await;
        self.observe("undelete", result)
    }

    async fn restore(&self, blob_id: &BlobId) -> BlobResult<bool> {
        let blob = self.live_blob(blob_id);
        let _guard = blob.lock().await;
        let key = self.attributes_key(blob_id);
        let Some(mut attributes) = load_attributes(self.backend.as_ref(), &key).await? else {
            warn!(blob_id = %blob_id, "Attempt to undelete non-existent blob");
            return Ok(false);
        };
        debug!(blob_id = %blob_id, "Undeleting blob");
        self.tag_records(blob_id, Vec::new()).await?;
        if !attributes.is_counted() {
            attributes.mark_restored();
            store_attributes(self.backend.as_ref(), &key, &attributes).await?;
            self.accumulator.record_addition(attributes.metrics.content_size);
        }
        blob.mark_stale();
        Ok(true)
    }

    async fn tag_records(&self, blob_id: &BlobId, tags: Vec<ObjectTag>) -> BlobResult<()> {
        for key in [self.content_key(blob_id), self.attributes_key(blob_id)] {
            match self.backend.set_object_tags(&key, tags.clone()).await {
                Ok(()) => {}
                Err(BlobError::Unsupported { .. }) => {
                    warn!(
                        bucket = %self.config.bucket,
                        "Bucket does not support object tagging, soft-deleted blobs will not expire"
                    );
                    return Ok(());
                }
                Err(e) if e.is_not_found() => {
                    warn!(key = %key, "Blob record missing while updating tags");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // --- Enumeration ---

    fn stopped_stream<T: Send + 'static>(&self) -> Option<BoxStream<'static, BlobResult<T>>> {
        self.ensure_started()
            .err()
            .map(|e| stream::once(future::ready(Err(e))).boxed())
    }

    /// Ids of every blob with an attributes record, listed fresh on each call.
    pub fn blob_id_stream(&self) -> BoxStream<'static, BlobResult<BlobId>> {
        if let Some(stopped) = self.stopped_stream() {
            return stopped;
        }
        let content_prefix = self.content_prefix.clone();
        self.backend
            .list_objects(&self.content_prefix)
            .try_filter_map(move |summary| {
                future::ready(Ok(blob_id_from_attributes_key(&content_prefix, &summary.key)))
            })
            .boxed()
    }

    /// Ids of direct-path blobs whose name starts with the path `prefix`.
    pub fn direct_path_blob_id_stream(&self, prefix: &str) -> BoxStream<'static, BlobResult<BlobId>> {
        if let Some(stopped) = self.stopped_stream() {
            return stopped;
        }
        let content_prefix = self.content_prefix.clone();
        let subpath = format!(
            "{}{}/{}",
            self.content_prefix,
            DIRECT_PATH_ROOT,
            prefix.trim_matches('/')
        );
        self.backend
            .list_objects(&subpath)
            .try_filter_map(move |summary| {
                let id = blob_id_from_attributes_key(&content_prefix, &summary.key)
                    .filter(|id| id.direct_path_name().is_some());
                future::ready(Ok(id))
            })
            .boxed()
    }

    /// Ids of blobs whose attributes changed within the last `days` days.
    pub fn blob_ids_updated_since(&self, days: u32) -> BoxStream<'static, BlobResult<BlobId>> {
        if let Some(stopped) = self.stopped_stream() {
            return stopped;
        }
        let content_prefix = self.content_prefix.clone();
        let cutoff = Utc::now() - TimeDelta::days(i64::from(days));
        self.backend
            .list_objects(&self.content_prefix)
            .try_filter_map(move |summary| {
                let id = (summary.last_modified >= cutoff)
                    .then(|| blob_id_from_attributes_key(&content_prefix, &summary.key))
                    .flatten();
                future::ready(Ok(id))
            })
            .boxed()
    }

    // --- Store-wide ---

    pub async fn get_metrics(&self) -> BlobResult<BlobStoreMetrics> {
        self.ensure_started()?;
        self.accumulator.get_metrics().await
    }

    pub async fn is_storage_available(&self) -> bool {
        self.location.is_storage_available().await
    }

    /// Interrupts in-flight transfers, stops the worker pool and writes the
    /// final metrics record. Later operations fail.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.accumulator.stop().await;
        self.live_blobs.clear();
        info!(store = %self.config.name, "Blob store stopped");
    }

    /// Deletes a stopped store's bookkeeping and, when it holds no blobs, its
    /// storage location. A store with content only loses its lifecycle rule.
    pub async fn remove(&self) -> BlobResult<()> {
        if self.is_started() {
            return Err(BlobError::consistency(format!(
                "blob store {} must be stopped before it is removed",
                self.config.name
            )));
        }
        let content = self
            .backend
            .list_objects(&self.content_prefix)
            .next()
            .await
            .transpose()?;
        if content.is_some() {
            warn!(
                store = %self.config.name,
                bucket = %self.config.bucket,
                "Blob store still holds content, keeping bucket and removing only its lifecycle rule"
            );
            return self.location.remove_expiration_rule(&self.config).await;
        }
        self.backend.delete_object(&self.metadata_key).await?;
        self.accumulator.remove().await?;
        self.location.delete_storage_location(&self.config).await
    }
}

impl Drop for BlobStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Accepts a store written by this or a compatible version; writes the
/// current type to a fresh store.
async fn check_metadata(backend: &dyn StorageBackend, key: &str) -> BlobResult<()> {
    match load_properties(backend, key).await? {
        Some(props) => match props.get(METADATA_TYPE_KEY) {
            Some(METADATA_TYPE_V1) | Some(LEGACY_FILE_TYPE_V1) => Ok(()),
            other => Err(BlobError::configuration(format!(
                "unsupported blob store type {:?} in {}",
                other, key
            ))),
        },
        None => {
            let mut props = Properties::new();
            props.set(METADATA_TYPE_KEY, METADATA_TYPE_V1);
            store_properties(backend, key, &props, None).await
        }
    }
}
