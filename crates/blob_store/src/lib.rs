//! Artifact blob storage on S3-compatible object stores.
//!
//! A blob is an immutable byte payload addressed by a [`BlobId`]. Every blob
//! is kept as two objects under the store's prefix: a content record
//! (`.bytes`) and an attributes record (`.properties`) holding its headers,
//! size, SHA-256 and deletion state.
//!
//! The crate provides:
//!
//! - [`BlobStore`], the store facade: create, copy, get, soft and hard delete,
//!   undelete, enumeration and store-wide size accounting
//! - Pluggable upload strategies (sequential, parallel, producer-consumer)
//!   and copy strategies (sequential, parallel multipart copy)
//! - Bucket preparation including the lifecycle rule that expires
//!   soft-deleted blobs
//! - A [`StorageBackend`] trait with an S3 implementation and an in-memory
//!   one for tests and local runs
//!
//! # Usage
//!
//! ```rust,no_run
//! use blob_store::{BlobStore, BlobStoreConfig, Headers, BLOB_NAME_HEADER};
//! use bytes::Bytes;
//! use futures::{StreamExt, stream};
//!
//! # async fn example() -> Result<(), blob_store::BlobError> {
//! let config = BlobStoreConfig::new("my-artifacts");
//! let store = BlobStore::connect(config).await?;
//!
//! let mut headers = Headers::new();
//! headers.insert(BLOB_NAME_HEADER.to_string(), "com/acme/app-1.0.jar".to_string());
//! let content = stream::iter(vec![Ok(Bytes::from_static(b"jar bytes"))]).boxed();
//! let blob = store.create(content, headers, None).await?;
//!
//! if let Some(blob) = store.get(blob.id(), false).await? {
//!     let bytes = blob.read_bytes().await?;
//!     assert_eq!(&bytes[..], b"jar bytes");
//! }
//! store.delete(blob.id(), "no longer needed").await?;
//! store.stop().await;
//! # Ok(())
//! # }
//! ```

mod accumulator;
mod attributes;
mod backends;
mod blob;
mod config;
mod error;
mod id;
mod live_blobs;
mod location;
mod metrics;
mod properties;
mod store;
mod traits;
pub mod transport;

pub use accumulator::{BlobStoreMetrics, MetricsAccumulator};
pub use attributes::{
    ATTRIBUTES_SUFFIX,
    BLOB_NAME_HEADER,
    BlobAttributes,
    BlobMetrics,
    CONTENT_SUFFIX,
    CONTENT_TYPE_HEADER,
    CREATED_BY_HEADER,
    CREATED_BY_IP_HEADER,
    DIRECT_PATH_HEADER,
    Headers,
    REPO_NAME_HEADER,
    TEMPORARY_BLOB_HEADER,
    is_direct_path,
    is_temporary,
};
pub use backends::{
    memory::InMemoryBackend,
    s3::{S3Backend, SignerType},
};
pub use blob::Blob;
pub use config::{
    BackendKind,
    BlobStoreConfig,
    CopierConfig,
    CopierStrategy,
    DEFAULT_CHUNK_SIZE,
    DEFAULT_EXPIRATION_IN_DAYS,
    NO_AUTOMATIC_EXPIRY_HARD_DELETE,
    Secret,
    UploaderConfig,
    UploaderStrategy,
    validate_bucket_name,
};
pub use error::{BlobError, BlobResult};
pub use id::BlobId;
pub use location::{StorageLocationManager, lifecycle_rule_id};
pub use metrics::{OperationMetrics, Timer};
pub use properties::Properties;
pub use store::BlobStore;
pub use traits::{
    CompletedPart,
    LifecycleRule,
    LifecycleTransition,
    ObjectSummary,
    ObjectTag,
    StorageBackend,
};
pub use transport::{ByteStream, StreamMetrics};
