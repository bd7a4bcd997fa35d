//! Object storage backend trait.

use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::BlobResult;

/// Listing entry for a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Part tag returned by the backend for one uploaded or copied part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub e_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTag {
    pub key: String,
    pub value: String,
}

impl ObjectTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleTransition {
    pub days: u32,
    pub storage_class: String,
}

/// Bucket lifecycle rule.
///
/// A rule matches objects under `prefix` (when set) carrying every tag in
/// `tags`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleRule {
    pub id: String,
    pub enabled: bool,
    pub prefix: Option<String>,
    pub tags: Vec<ObjectTag>,
    pub expiration_days: Option<u32>,
    pub transitions: Vec<LifecycleTransition>,
}

/// Operations the blob store needs from an object storage service.
///
/// Keys are full object keys inside the configured bucket; the store applies
/// its own prefix before calling in.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn bucket(&self) -> &str;

    // --- Bucket management ---

    async fn bucket_exists(&self) -> BlobResult<bool>;

    async fn create_bucket(&self) -> BlobResult<()>;

    async fn delete_bucket(&self) -> BlobResult<()>;

    /// Returns an empty list when the bucket has no lifecycle configuration.
    async fn get_lifecycle_rules(&self) -> BlobResult<Vec<LifecycleRule>>;

    /// Replaces the whole lifecycle configuration.
    async fn put_lifecycle_rules(&self, rules: Vec<LifecycleRule>) -> BlobResult<()>;

    async fn delete_lifecycle_configuration(&self) -> BlobResult<()>;

    // --- Objects ---

    async fn put_object(&self, key: &str, data: Bytes) -> BlobResult<()>;

    /// Returns `BlobError::NotFound` if the object doesn't exist.
    async fn get_object(&self, key: &str) -> BlobResult<Bytes>;

    /// Returns `BlobError::NotFound` if the object doesn't exist.
    async fn get_object_stream(
        &self,
        key: &str,
    ) -> BlobResult<BoxStream<'static, BlobResult<Bytes>>>;

    async fn head_object(&self, key: &str) -> BlobResult<Option<ObjectSummary>>;

    /// Deleting a missing object is not an error.
    async fn delete_object(&self, key: &str) -> BlobResult<()>;

    /// Deletes `keys` in one batch and returns how many were removed.
    async fn delete_objects(&self, keys: &[String]) -> BlobResult<usize>;

    /// Lists every object under `prefix`, lazily.
    fn list_objects(&self, prefix: &str) -> BoxStream<'static, BlobResult<ObjectSummary>>;

    /// Server-side copy of a whole object.
    async fn copy_object(&self, source: &str, destination: &str) -> BlobResult<()>;

    /// Replaces the tag set of an object. An empty list clears it.
    ///
    /// Returns `BlobError::Unsupported` when the service has no tagging.
    async fn set_object_tags(&self, key: &str, tags: Vec<ObjectTag>) -> BlobResult<()>;

    // --- Multipart Upload Operations ---

    /// Create a multipart upload session and return its upload id.
    async fn create_multipart_upload(&self, key: &str) -> BlobResult<String>;

    /// Uploads one part and returns its tag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BlobResult<String>;

    /// Copies `range` (end exclusive) of `source` as one part of `destination`.
    async fn upload_part_copy(
        &self,
        source: &str,
        destination: &str,
        upload_id: &str,
        part_number: u32,
        range: Range<u64>,
    ) -> BlobResult<String>;

    /// Parts must be ordered by part number, contiguous from 1.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> BlobResult<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BlobResult<()>;
}
