//! One multipart upload session: open, complete with ordered parts, or abort.

use std::sync::Arc;

use tracing::{debug, error};

use crate::{
    BlobError,
    BlobResult,
    traits::{CompletedPart, StorageBackend},
};

pub(crate) struct MultipartSession {
    backend: Arc<dyn StorageBackend>,
    key: String,
    upload_id: String,
}

impl MultipartSession {
    pub(crate) async fn open(backend: Arc<dyn StorageBackend>, key: &str) -> BlobResult<Self> {
        let upload_id = backend
            .create_multipart_upload(key)
            .await
            .map_err(|e| e.into_transfer(key, None))?;
        debug!(key = %key, upload_id = %upload_id, "Opened multipart upload");
        Ok(Self {
            backend,
            key: key.to_string(),
            upload_id,
        })
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Sorts `parts`, checks they are contiguous from 1 and finalizes the
    /// object. Any failure aborts the session.
    pub(crate) async fn complete(self, parts: Vec<CompletedPart>) -> BlobResult<()> {
        let parts = match order_parts(parts) {
            Ok(parts) => parts,
            Err(e) => return Err(self.abort(e).await),
        };
        let count = parts.len();
        match self
            .backend
            .complete_multipart_upload(&self.key, &self.upload_id, parts)
            .await
        {
            Ok(()) => {
                debug!(key = %self.key, upload_id = %self.upload_id, parts = count, "Completed multipart upload");
                Ok(())
            }
            Err(e) => Err(self.abort(e).await),
        }
    }

    /// Aborts the session and returns `cause` as a transfer error.
    pub(crate) async fn abort(self, cause: BlobError) -> BlobError {
        self.abort_quietly().await;
        cause.into_transfer(&self.key, Some(&self.upload_id))
    }

    /// Aborts the session after a cancellation.
    pub(crate) async fn interrupt(self) -> BlobError {
        debug!(key = %self.key, upload_id = %self.upload_id, "Multipart upload interrupted");
        self.abort_quietly().await;
        BlobError::Interrupted {
            key: self.key,
            upload_id: Some(self.upload_id),
        }
    }

    async fn abort_quietly(&self) {
        if let Err(e) = self
            .backend
            .abort_multipart_upload(&self.key, &self.upload_id)
            .await
        {
            error!(
                key = %self.key,
                upload_id = %self.upload_id,
                error = %e,
                "Failed to abort multipart upload"
            );
        }
    }
}

/// Orders part tags by part number and rejects gaps or duplicates.
pub(crate) fn order_parts(mut parts: Vec<CompletedPart>) -> BlobResult<Vec<CompletedPart>> {
    parts.sort_by_key(|part| part.part_number);
    for (index, part) in parts.iter().enumerate() {
        if part.part_number != index as u32 + 1 {
            return Err(BlobError::consistency(format!(
                "expected part {} but found part {}",
                index + 1,
                part.part_number
            )));
        }
    }
    if parts.is_empty() {
        return Err(BlobError::consistency("multipart upload has no parts"));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::backends::memory::InMemoryBackend;

    fn part(part_number: u32) -> CompletedPart {
        CompletedPart {
            part_number,
            e_tag: format!("etag-{part_number}"),
        }
    }

    #[test]
    fn test_order_parts_sorts() {
        let ordered = order_parts(vec![part(3), part(1), part(2)]).unwrap();
        let numbers: Vec<u32> = ordered.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_order_parts_rejects_gaps_and_duplicates() {
        assert!(order_parts(vec![part(1), part(3)]).is_err());
        assert!(order_parts(vec![part(1), part(1)]).is_err());
        assert!(order_parts(vec![part(2)]).is_err());
        assert!(order_parts(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_failed_completion_aborts() {
        let backend = Arc::new(InMemoryBackend::new("bucket"));
        let session = MultipartSession::open(backend.clone(), "key").await.unwrap();
        let upload_id = session.upload_id().to_string();
        backend
            .upload_part("key", &upload_id, 1, Bytes::from_static(b"data"))
            .await
            .unwrap();
        let err = session.complete(vec![part(1)]).await.unwrap_err();
        match err {
            BlobError::Transfer { upload_id: Some(id), .. } => assert_eq!(id, upload_id),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_reports_upload_id() {
        let backend = Arc::new(InMemoryBackend::new("bucket"));
        let session = MultipartSession::open(backend.clone(), "key").await.unwrap();
        let err = session.interrupt().await;
        assert!(err.is_interrupted());
        assert_eq!(backend.aborted_uploads(), 1);
    }
}
