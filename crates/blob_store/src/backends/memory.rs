//! In-memory backend: object bytes live in an object_store `InMemory`,
//! multipart sessions, tags and lifecycle rules in local maps.
//!
//! Used by tests and by the `memory` backend setting. It can inject part and
//! put failures and exposes session counters so callers can assert that
//! failed transfers were aborted.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::Range,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use object_store::{ObjectMeta, ObjectStore, PutPayload, memory::InMemory, path::Path as ObjectPath};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    BlobError,
    BlobResult,
    traits::{CompletedPart, LifecycleRule, ObjectSummary, ObjectTag, StorageBackend},
};

struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct BucketState {
    exists: bool,
    lifecycle: Option<Vec<LifecycleRule>>,
    tags: HashMap<String, Vec<ObjectTag>>,
    uploads: HashMap<String, PendingUpload>,
    failing_parts: HashSet<u32>,
    fail_puts: bool,
    fail_tagging: bool,
    tagging_unsupported: bool,
}

pub struct InMemoryBackend {
    bucket: String,
    objects: Arc<InMemory>,
    state: Mutex<BucketState>,
    aborted_uploads: AtomicUsize,
    completed_uploads: AtomicUsize,
    uploaded_parts: AtomicUsize,
}

impl InMemoryBackend {
    /// A backend whose bucket already exists.
    pub fn new(bucket: &str) -> Self {
        let backend = Self::without_bucket(bucket);
        backend.state().exists = true;
        backend
    }

    /// A backend whose bucket has not been created yet.
    pub fn without_bucket(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Arc::new(InMemory::new()),
            state: Mutex::new(BucketState::default()),
            aborted_uploads: AtomicUsize::new(0),
            completed_uploads: AtomicUsize::new(0),
            uploaded_parts: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_bucket(&self) -> BlobResult<()> {
        if self.state().exists {
            Ok(())
        } else {
            Err(BlobError::NotFound {
                key: self.bucket.clone(),
            })
        }
    }

    /// Every upload of `part_number` fails until cleared.
    pub fn fail_part(&self, part_number: u32) {
        self.state().failing_parts.insert(part_number);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_parts.clear();
        state.fail_puts = false;
        state.fail_tagging = false;
    }

    /// Single-request puts fail while set.
    pub fn fail_puts(&self, fail: bool) {
        self.state().fail_puts = fail;
    }

    /// Tagging requests fail with a backend error while set.
    pub fn fail_tagging(&self, fail: bool) {
        self.state().fail_tagging = fail;
    }

    /// Behave like a service without object tagging.
    pub fn disable_tagging(&self) {
        self.state().tagging_unsupported = true;
    }

    pub fn open_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    pub fn aborted_uploads(&self) -> usize {
        self.aborted_uploads.load(Ordering::SeqCst)
    }

    pub fn completed_uploads(&self) -> usize {
        self.completed_uploads.load(Ordering::SeqCst)
    }

    pub fn uploaded_parts(&self) -> usize {
        self.uploaded_parts.load(Ordering::SeqCst)
    }

    pub fn object_tags(&self, key: &str) -> Vec<ObjectTag> {
        self.state().tags.get(key).cloned().unwrap_or_default()
    }

    pub fn lifecycle_rules(&self) -> Option<Vec<LifecycleRule>> {
        self.state().lifecycle.clone()
    }

    /// Applies the `Expiration` of every enabled tag-filtered rule as if its
    /// retention had elapsed. Returns the number of objects removed.
    pub async fn expire_tagged_objects(&self) -> BlobResult<usize> {
        let expired: Vec<String> = {
            let state = self.state();
            let rules = state.lifecycle.clone().unwrap_or_default();
            state
                .tags
                .iter()
                .filter(|(key, tags)| {
                    rules.iter().any(|rule| {
                        rule.enabled
                            && rule.expiration_days.is_some()
                            && !rule.tags.is_empty()
                            && rule.prefix.as_deref().is_none_or(|p| key.starts_with(p))
                            && rule.tags.iter().all(|t| tags.contains(t))
                    })
                })
                .map(|(key, _)| key.clone())
                .collect()
        };
        self.delete_objects(&expired).await
    }

    fn record_part(&self, key: &str, upload_id: &str, part_number: u32, data: Bytes) -> BlobResult<String> {
        let mut state = self.state();
        if state.failing_parts.contains(&part_number) {
            return Err(BlobError::backend(anyhow::anyhow!(
                "injected failure for part {} of {}",
                part_number,
                key
            )));
        }
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| BlobError::NotFound {
                key: format!("{} (upload {})", key, upload_id),
            })?;
        let e_tag = format!("\"{}\"", hex::encode(Sha256::digest(&data)));
        upload.parts.insert(part_number, (e_tag.clone(), data));
        self.uploaded_parts.fetch_add(1, Ordering::SeqCst);
        Ok(e_tag)
    }
}

fn summary(meta: ObjectMeta) -> ObjectSummary {
    ObjectSummary {
        key: meta.location.to_string(),
        size: meta.size,
        last_modified: meta.last_modified,
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn bucket_exists(&self) -> BlobResult<bool> {
        Ok(self.state().exists)
    }

    async fn create_bucket(&self) -> BlobResult<()> {
        self.state().exists = true;
        Ok(())
    }

    async fn delete_bucket(&self) -> BlobResult<()> {
        self.ensure_bucket()?;
        if self.objects.list(None).next().await.is_some() {
            return Err(BlobError::consistency(format!(
                "bucket {} is not empty",
                self.bucket
            )));
        }
        let mut state = self.state();
        state.exists = false;
        state.lifecycle = None;
        Ok(())
    }

    async fn get_lifecycle_rules(&self) -> BlobResult<Vec<LifecycleRule>> {
        self.ensure_bucket()?;
        Ok(self.state().lifecycle.clone().unwrap_or_default())
    }

    async fn put_lifecycle_rules(&self, rules: Vec<LifecycleRule>) -> BlobResult<()> {
        self.ensure_bucket()?;
        self.state().lifecycle = Some(rules);
        Ok(())
    }

    async fn delete_lifecycle_configuration(&self) -> BlobResult<()> {
        self.ensure_bucket()?;
        self.state().lifecycle = None;
        Ok(())
    }

    async fn put_object(&self, key: &str, data: Bytes) -> BlobResult<()> {
        {
            self.ensure_bucket()?;
            if self.state().fail_puts {
                return Err(BlobError::backend(anyhow::anyhow!(
                    "injected failure for put of {}",
                    key
                )));
            }
        }
        self.objects
            .put(&ObjectPath::from(key), PutPayload::from(data))
            .await?;
        // A new version of an object starts without tags.
        self.state().tags.remove(key);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> BlobResult<Bytes> {
        self.ensure_bucket()?;
        let result = self.objects.get(&ObjectPath::from(key)).await?;
        Ok(result.bytes().await?)
    }

    async fn get_object_stream(
        &self,
        key: &str,
    ) -> BlobResult<BoxStream<'static, BlobResult<Bytes>>> {
        self.ensure_bucket()?;
        let result = self.objects.get(&ObjectPath::from(key)).await?;
        Ok(result.into_stream().map_err(BlobError::from).boxed())
    }

    async fn head_object(&self, key: &str) -> BlobResult<Option<ObjectSummary>> {
        self.ensure_bucket()?;
        match self.objects.head(&ObjectPath::from(key)).await {
            Ok(meta) => Ok(Some(summary(meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, key: &str) -> BlobResult<()> {
        self.ensure_bucket()?;
        self.objects.delete(&ObjectPath::from(key)).await?;
        self.state().tags.remove(key);
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> BlobResult<usize> {
        self.ensure_bucket()?;
        let mut deleted = 0;
        for key in keys {
            let path = ObjectPath::from(key.as_str());
            if self.objects.head(&path).await.is_ok() {
                self.objects.delete(&path).await?;
                deleted += 1;
            }
            self.state().tags.remove(key);
        }
        Ok(deleted)
    }

    fn list_objects(&self, prefix: &str) -> BoxStream<'static, BlobResult<ObjectSummary>> {
        let prefix = prefix.trim_end_matches('/');
        let listing = if prefix.is_empty() {
            self.objects.list(None)
        } else {
            self.objects.list(Some(&ObjectPath::from(prefix)))
        };
        listing
            .map(|entry| entry.map(summary).map_err(BlobError::from))
            .boxed()
    }

    async fn copy_object(&self, source: &str, destination: &str) -> BlobResult<()> {
        self.ensure_bucket()?;
        self.objects
            .copy(&ObjectPath::from(source), &ObjectPath::from(destination))
            .await?;
        Ok(())
    }

    async fn set_object_tags(&self, key: &str, tags: Vec<ObjectTag>) -> BlobResult<()> {
        self.ensure_bucket()?;
        {
            let state = self.state();
            if state.tagging_unsupported {
                return Err(BlobError::Unsupported {
                    operation: "object tagging".to_string(),
                });
            }
            if state.fail_tagging {
                return Err(BlobError::backend(anyhow::anyhow!(
                    "injected failure for tagging of {}",
                    key
                )));
            }
        }
        if self.objects.head(&ObjectPath::from(key)).await.is_err() {
            return Err(BlobError::NotFound {
                key: key.to_string(),
            });
        }
        let mut state = self.state();
        if tags.is_empty() {
            state.tags.remove(key);
        } else {
            state.tags.insert(key.to_string(), tags);
        }
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> BlobResult<String> {
        self.ensure_bucket()?;
        let upload_id = Uuid::new_v4().to_string();
        self.state().uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BlobResult<String> {
        // Yield so concurrent part uploads interleave like network calls do.
        tokio::task::yield_now().await;
        self.record_part(key, upload_id, part_number, data)
    }

    async fn upload_part_copy(
        &self,
        source: &str,
        destination: &str,
        upload_id: &str,
        part_number: u32,
        range: Range<u64>,
    ) -> BlobResult<String> {
        let data = self
            .objects
            .get_range(&ObjectPath::from(source), range)
            .await?;
        self.record_part(destination, upload_id, part_number, data)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> BlobResult<()> {
        let data = {
            let mut state = self.state();
            let upload = state
                .uploads
                .remove(upload_id)
                .filter(|upload| upload.key == key)
                .ok_or_else(|| BlobError::NotFound {
                    key: format!("{} (upload {})", key, upload_id),
                })?;
            let mut data = BytesMut::new();
            for (index, part) in parts.iter().enumerate() {
                let expected = index as u32 + 1;
                let stored = upload.parts.get(&part.part_number);
                match stored {
                    Some((e_tag, bytes)) if part.part_number == expected && *e_tag == part.e_tag => {
                        data.extend_from_slice(bytes);
                    }
                    _ => {
                        return Err(BlobError::consistency(format!(
                            "invalid part {} in completion of upload {}",
                            part.part_number, upload_id
                        )));
                    }
                }
            }
            data.freeze()
        };
        self.objects
            .put(&ObjectPath::from(key), PutPayload::from(data))
            .await?;
        self.state().tags.remove(key);
        self.completed_uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BlobResult<()> {
        let removed = self.state().uploads.remove(upload_id);
        match removed {
            Some(_) => {
                self.aborted_uploads.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(BlobError::NotFound {
                key: format!("{} (upload {})", key, upload_id),
            }),
        }
    }
}
