//! Blob side-data: headers, content metrics and deletion state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{
    BlobError,
    BlobResult,
    properties::{Properties, load_properties, store_properties},
    traits::StorageBackend,
};

pub const BLOB_NAME_HEADER: &str = "BlobStore.blob-name";
pub const CONTENT_TYPE_HEADER: &str = "BlobStore.content-type";
pub const CREATED_BY_HEADER: &str = "BlobStore.created-by";
pub const CREATED_BY_IP_HEADER: &str = "BlobStore.created-by-ip";
pub const TEMPORARY_BLOB_HEADER: &str = "BlobStore.temporary-blob";
pub const DIRECT_PATH_HEADER: &str = "BlobStore.direct-path";
pub const REPO_NAME_HEADER: &str = "Bucket.repo-name";

/// Extension of the content record.
pub const CONTENT_SUFFIX: &str = ".bytes";
/// Extension of the attributes record.
pub const ATTRIBUTES_SUFFIX: &str = ".properties";

const HEADER_PREFIX: &str = "@";
const SHA256_KEY: &str = "sha256";
const SIZE_KEY: &str = "size";
const CREATION_TIME_KEY: &str = "creationTime";
const DELETED_KEY: &str = "deleted";
const DELETED_REASON_KEY: &str = "deletedReason";
const DELETED_DATETIME_KEY: &str = "deletedDateTime";
const RESTORED_KEY: &str = "restored";

pub type Headers = HashMap<String, String>;

pub fn is_direct_path(headers: &Headers) -> bool {
    headers
        .get(DIRECT_PATH_HEADER)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

pub fn is_temporary(headers: &Headers) -> bool {
    headers.contains_key(TEMPORARY_BLOB_HEADER)
}

/// Content metrics computed while the bytes were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetrics {
    pub creation_time: DateTime<Utc>,
    /// Lower-case hex SHA-256 of the content.
    pub sha256_hash: String,
    pub content_size: u64,
}

impl BlobMetrics {
    /// Creation time is truncated to milliseconds, the precision it is stored at.
    pub fn new(creation_time: DateTime<Utc>, sha256_hash: String, content_size: u64) -> Self {
        Self {
            creation_time: truncate_to_millis(creation_time),
            sha256_hash,
            content_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAttributes {
    pub headers: Headers,
    pub metrics: BlobMetrics,
    pub deleted: bool,
    pub deleted_reason: Option<String>,
    pub deleted_date_time: Option<DateTime<Utc>>,
    /// Set by undelete on a soft-deleted blob. The deleted flag stays, but the
    /// blob counts towards store metrics again.
    pub restored: bool,
}

impl BlobAttributes {
    pub fn new(headers: Headers, metrics: BlobMetrics) -> Self {
        Self {
            headers,
            metrics,
            deleted: false,
            deleted_reason: None,
            deleted_date_time: None,
            restored: false,
        }
    }

    pub fn mark_deleted(&mut self, reason: &str) {
        self.deleted = true;
        self.deleted_reason = Some(reason.to_string());
        self.deleted_date_time = Some(truncate_to_millis(Utc::now()));
        self.restored = false;
    }

    pub fn mark_restored(&mut self) {
        self.restored = true;
    }

    pub fn clear_deletion(&mut self) {
        self.deleted = false;
        self.deleted_reason = None;
        self.deleted_date_time = None;
        self.restored = false;
    }

    /// Whether the blob's size is included in the store metrics.
    pub fn is_counted(&self) -> bool {
        !self.deleted || self.restored
    }

    /// Copies headers, metrics and deletion state from `other`.
    pub fn update_from(&mut self, other: &BlobAttributes) {
        self.clone_from(other);
    }

    pub fn to_properties(&self) -> Properties {
        let mut props: Properties = self
            .headers
            .iter()
            .map(|(k, v)| (format!("{}{}", HEADER_PREFIX, k), v.clone()))
            .collect();
        props.set(SHA256_KEY, self.metrics.sha256_hash.clone());
        props.set(SIZE_KEY, self.metrics.content_size.to_string());
        props.set(
            CREATION_TIME_KEY,
            self.metrics.creation_time.timestamp_millis().to_string(),
        );
        if self.deleted {
            props.set(DELETED_KEY, "true");
            if let Some(reason) = &self.deleted_reason {
                props.set(DELETED_REASON_KEY, reason.clone());
            }
            if let Some(when) = self.deleted_date_time {
                props.set(DELETED_DATETIME_KEY, when.timestamp_millis().to_string());
            }
            if self.restored {
                props.set(RESTORED_KEY, "true");
            }
        }
        props
    }

    pub fn from_properties(props: &Properties) -> BlobResult<Self> {
        let headers = props
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(HEADER_PREFIX)
                    .map(|header| (header.to_string(), v.clone()))
            })
            .collect();
        let sha256_hash = required(props, SHA256_KEY)?.to_string();
        let content_size = required(props, SIZE_KEY)?
            .parse::<u64>()
            .map_err(|e| BlobError::consistency(format!("invalid {}: {}", SIZE_KEY, e)))?;
        let creation_time = parse_millis(required(props, CREATION_TIME_KEY)?, CREATION_TIME_KEY)?;
        let deleted_date_time = props
            .get(DELETED_DATETIME_KEY)
            .map(|v| parse_millis(v, DELETED_DATETIME_KEY))
            .transpose()?;
        let deleted = props.get(DELETED_KEY).is_some_and(|v| v == "true");
        Ok(Self {
            headers,
            metrics: BlobMetrics::new(creation_time, sha256_hash, content_size),
            deleted,
            deleted_reason: props.get(DELETED_REASON_KEY).map(str::to_string),
            deleted_date_time,
            restored: deleted && props.get(RESTORED_KEY).is_some_and(|v| v == "true"),
        })
    }
}

fn required<'a>(props: &'a Properties, key: &str) -> BlobResult<&'a str> {
    props
        .get(key)
        .ok_or_else(|| BlobError::consistency(format!("attributes record is missing '{}'", key)))
}

fn parse_millis(value: &str, key: &str) -> BlobResult<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| BlobError::consistency(format!("invalid {}: '{}'", key, value)))
}

fn truncate_to_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(time.timestamp_millis()).unwrap_or(time)
}

/// Reads the attributes record at `key`; `None` when it does not exist.
pub async fn load_attributes(
    backend: &dyn StorageBackend,
    key: &str,
) -> BlobResult<Option<BlobAttributes>> {
    match load_properties(backend, key).await? {
        Some(props) => BlobAttributes::from_properties(&props).map(Some),
        None => Ok(None),
    }
}

pub async fn store_attributes(
    backend: &dyn StorageBackend,
    key: &str,
    attributes: &BlobAttributes,
) -> BlobResult<()> {
    store_properties(backend, key, &attributes.to_properties(), Some(key)).await
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::backends::memory::InMemoryBackend;

    fn sample() -> BlobAttributes {
        let mut headers = Headers::new();
        headers.insert(BLOB_NAME_HEADER.to_string(), "com/acme/app-1.0.jar".to_string());
        headers.insert(CREATED_BY_HEADER.to_string(), "deployer".to_string());
        headers.insert("Custom:Header".to_string(), "a=b\nc".to_string());
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        BlobAttributes::new(
            headers,
            BlobMetrics::new(created, "ab".repeat(32), 1234),
        )
    }

    #[test]
    fn test_properties_layout() {
        let props = sample().to_properties();
        assert_eq!(props.get("@BlobStore.blob-name"), Some("com/acme/app-1.0.jar"));
        assert_eq!(props.get("size"), Some("1234"));
        assert_eq!(props.get("creationTime"), Some("1714566600000"));
        assert!(!props.contains_key("deleted"));
    }

    #[test]
    fn test_round_trip_with_deletion_state() {
        let mut attributes = sample();
        attributes.mark_deleted("cleanup task");
        let decoded = BlobAttributes::from_properties(&attributes.to_properties()).unwrap();
        assert_eq!(decoded, attributes);
        assert!(decoded.deleted);
        assert_eq!(decoded.deleted_reason.as_deref(), Some("cleanup task"));
    }

    #[test]
    fn test_restored_marker() {
        let mut attributes = sample();
        assert!(attributes.is_counted());
        attributes.mark_deleted("oops");
        assert!(!attributes.is_counted());
        attributes.mark_restored();
        assert!(attributes.is_counted());

        let props = attributes.to_properties();
        assert_eq!(props.get("restored"), Some("true"));
        let decoded = BlobAttributes::from_properties(&props).unwrap();
        assert!(decoded.deleted && decoded.restored);

        attributes.mark_deleted("again");
        assert!(!attributes.is_counted());
        attributes.clear_deletion();
        assert!(attributes.is_counted());
        assert!(!attributes.to_properties().contains_key("restored"));
    }

    #[test]
    fn test_missing_metrics_is_a_consistency_error() {
        let mut props = sample().to_properties();
        props.remove("sha256");
        assert!(matches!(
            BlobAttributes::from_properties(&props),
            Err(BlobError::Consistency { .. })
        ));
    }

    #[test]
    fn test_header_helpers() {
        let mut headers = Headers::new();
        assert!(!is_direct_path(&headers));
        headers.insert(DIRECT_PATH_HEADER.to_string(), "TRUE".to_string());
        headers.insert(TEMPORARY_BLOB_HEADER.to_string(), String::new());
        assert!(is_direct_path(&headers));
        assert!(is_temporary(&headers));
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let backend = InMemoryBackend::new("bucket");
        let key = "content/vol-01/chap-01/x.properties";
        assert!(load_attributes(&backend, key).await.unwrap().is_none());
        let attributes = sample();
        store_attributes(&backend, key, &attributes).await.unwrap();
        assert_eq!(load_attributes(&backend, key).await.unwrap(), Some(attributes));
    }
}
