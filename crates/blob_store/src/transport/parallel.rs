//! Uploads parts with a fixed number of workers per transfer.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::Mutex;

use crate::{
    BlobError,
    BlobResult,
    traits::{CompletedPart, StorageBackend},
    transport::{
        chunk::{ByteStream, ChunkReader, StreamMetrics},
        put_if_single_chunk,
        requester::ParallelRequester,
    },
};

pub struct ParallelUploader {
    backend: Arc<dyn StorageBackend>,
    chunk_size: usize,
    requester: ParallelRequester,
}

impl ParallelUploader {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        chunk_size: usize,
        requester: ParallelRequester,
    ) -> Self {
        Self {
            backend,
            chunk_size,
            requester,
        }
    }

    pub async fn upload(&self, key: &str, stream: ByteStream) -> BlobResult<StreamMetrics> {
        let mut reader = ChunkReader::new(stream, self.chunk_size);
        if let Some(metrics) = put_if_single_chunk(self.backend.as_ref(), key, &mut reader).await? {
            return Ok(metrics);
        }

        let reader = Arc::new(Mutex::new(reader));
        let next_part = Arc::new(AtomicU32::new(0));
        let backend = self.backend.clone();
        let destination = key.to_string();
        let shared_reader = reader.clone();
        self.requester
            .execute(self.backend.clone(), key, move |upload_id| {
                upload_claimed_chunks(
                    backend.clone(),
                    destination.clone(),
                    upload_id,
                    shared_reader.clone(),
                    next_part.clone(),
                )
            })
            .await?;

        let metrics = reader.lock().await.metrics();
        Ok(metrics)
    }
}

/// Claims chunk and part number together under the reader lock, so part
/// numbers follow byte order, then uploads outside the lock.
async fn upload_claimed_chunks(
    backend: Arc<dyn StorageBackend>,
    key: String,
    upload_id: String,
    reader: Arc<Mutex<ChunkReader>>,
    next_part: Arc<AtomicU32>,
) -> BlobResult<Vec<CompletedPart>> {
    let mut parts = Vec::new();
    loop {
        let (part_number, chunk) = {
            let mut reader = reader.lock().await;
            match reader.read_chunk().await.map_err(BlobError::from)? {
                Some(chunk) => (next_part.fetch_add(1, Ordering::SeqCst) + 1, chunk),
                None => break,
            }
        };
        let e_tag = backend
            .upload_part(&key, &upload_id, part_number, chunk)
            .await?;
        parts.push(CompletedPart { part_number, e_tag });
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        backends::memory::InMemoryBackend,
        transport::chunk::tests::{byte_stream, sha256_hex},
    };

    fn uploader(memory: &Arc<InMemoryBackend>, chunk_size: usize, workers: usize) -> ParallelUploader {
        ParallelUploader::new(
            memory.clone(),
            chunk_size,
            ParallelRequester::new(workers, CancellationToken::new()),
        )
    }

    #[tokio::test]
    async fn test_parts_follow_byte_order() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let metrics = uploader(&memory, 64, 4)
            .upload("obj", byte_stream(&data, 100))
            .await
            .unwrap();
        assert_eq!(metrics.size, 1000);
        assert_eq!(metrics.sha256_hash, sha256_hex(&data));
        assert_eq!(memory.get_object("obj").await.unwrap(), data);
        assert_eq!(memory.uploaded_parts(), 16);
    }

    #[tokio::test]
    async fn test_more_workers_than_parts() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let data = vec![7u8; 20];
        uploader(&memory, 10, 8)
            .upload("obj", byte_stream(&data, 20))
            .await
            .unwrap();
        assert_eq!(memory.get_object("obj").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_failed_part_aborts() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        memory.fail_part(3);
        let err = uploader(&memory, 10, 2)
            .upload("obj", byte_stream(&[1u8; 100], 25))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Transfer { .. }));
        assert_eq!(memory.open_uploads(), 0);
        assert_eq!(memory.aborted_uploads(), 1);
    }
}
