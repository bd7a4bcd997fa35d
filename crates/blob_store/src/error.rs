//! Error types for blob store operations.

use std::fmt;

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob store operations.
#[derive(Debug)]
pub enum BlobError {
    /// The store configuration or the storage location is unusable.
    Configuration { reason: String },

    /// Moving bytes into or between stored objects failed.
    ///
    /// `upload_id` is set when a multipart session had been opened; that
    /// session has already been aborted when this error is returned.
    Transfer {
        key: String,
        upload_id: Option<String>,
        source: anyhow::Error,
    },

    /// The transfer was cancelled because the store is shutting down.
    Interrupted {
        key: String,
        upload_id: Option<String>,
    },

    /// Object not found at the specified key.
    NotFound { key: String },

    /// Stored state does not match what the caller expected.
    Consistency { reason: String },

    /// The backend does not implement the requested capability.
    Unsupported { operation: String },

    /// Network or service error reported by the backend.
    Backend { source: anyhow::Error },

    /// I/O error during blob operation.
    Io { source: std::io::Error },

    /// Generic error.
    Other { source: anyhow::Error },
}

impl BlobError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        BlobError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn consistency(reason: impl Into<String>) -> Self {
        BlobError::Consistency {
            reason: reason.into(),
        }
    }

    pub fn backend(source: impl Into<anyhow::Error>) -> Self {
        BlobError::Backend {
            source: source.into(),
        }
    }

    /// Wraps this error as a transfer failure on `key`.
    ///
    /// Interruptions and transfer errors that already carry their own context
    /// are passed through untouched.
    pub fn into_transfer(self, key: &str, upload_id: Option<&str>) -> Self {
        match self {
            err @ (BlobError::Transfer { .. } | BlobError::Interrupted { .. }) => err,
            other => BlobError::Transfer {
                key: key.to_string(),
                upload_id: upload_id.map(str::to_string),
                source: anyhow::Error::from(other),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, BlobError::Interrupted { .. })
    }
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::Configuration { reason } => write!(f, "Configuration error: {}", reason),
            BlobError::Transfer {
                key,
                upload_id: Some(upload_id),
                source,
            } => write!(
                f,
                "Transfer of '{}' failed (upload {}): {}",
                key, upload_id, source
            ),
            BlobError::Transfer {
                key,
                upload_id: None,
                source,
            } => write!(f, "Transfer of '{}' failed: {}", key, source),
            BlobError::Interrupted { key, .. } => write!(f, "Transfer of '{}' interrupted", key),
            BlobError::NotFound { key } => write!(f, "Blob not found: {}", key),
            BlobError::Consistency { reason } => write!(f, "Consistency error: {}", reason),
            BlobError::Unsupported { operation } => {
                write!(f, "Operation not supported by backend: {}", operation)
            }
            BlobError::Backend { source } => write!(f, "Backend error: {}", source),
            BlobError::Io { source } => write!(f, "I/O error: {}", source),
            BlobError::Other { source } => write!(f, "Blob store error: {}", source),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobError::Io { source } => Some(source),
            BlobError::Transfer { source, .. } => Some(source.as_ref()),
            BlobError::Backend { source } => Some(source.as_ref()),
            BlobError::Other { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::Io { source: err }
    }
}

impl From<anyhow::Error> for BlobError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<BlobError>() {
            Ok(blob_error) => blob_error,
            Err(err) => BlobError::Other { source: err },
        }
    }
}

impl From<object_store::Error> for BlobError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => BlobError::NotFound { key: path },
            object_store::Error::NotImplemented => BlobError::Unsupported {
                operation: "object store request".to_string(),
            },
            _ => BlobError::Backend {
                source: anyhow::Error::from(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_transfer_wraps_backend_errors() {
        let err = BlobError::backend(anyhow::anyhow!("connection reset"))
            .into_transfer("content/a.bytes", Some("upload-1"));
        match err {
            BlobError::Transfer { key, upload_id, .. } => {
                assert_eq!(key, "content/a.bytes");
                assert_eq!(upload_id.as_deref(), Some("upload-1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_into_transfer_keeps_interruptions() {
        let err = BlobError::Interrupted {
            key: "content/a.bytes".to_string(),
            upload_id: None,
        }
        .into_transfer("other", None);
        assert!(err.is_interrupted());
    }

    #[test]
    fn test_anyhow_round_trip_preserves_variant() {
        let wrapped = anyhow::Error::from(BlobError::NotFound {
            key: "missing".to_string(),
        });
        assert!(BlobError::from(wrapped).is_not_found());
    }

    #[test]
    fn test_object_store_not_found_maps_to_not_found() {
        let err = object_store::Error::NotFound {
            path: "content/x.bytes".to_string(),
            source: "gone".into(),
        };
        match BlobError::from(err) {
            BlobError::NotFound { key } => assert_eq!(key, "content/x.bytes"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
