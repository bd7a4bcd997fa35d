//! Uploads parts through a long-lived pool of consumer tasks fed by a bounded
//! queue. The uploading task is the only producer and waits when the queue is
//! full.

use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    BlobError,
    BlobResult,
    traits::{CompletedPart, StorageBackend},
    transport::{
        chunk::{ByteStream, ChunkReader, StreamMetrics},
        put_if_single_chunk,
        session::MultipartSession,
    },
};

/// One queued part together with the channel its result goes back on.
struct PartUpload {
    key: String,
    upload_id: String,
    part_number: u32,
    data: Bytes,
    results: mpsc::UnboundedSender<BlobResult<CompletedPart>>,
}

pub struct ProducerConsumerUploader {
    backend: Arc<dyn StorageBackend>,
    chunk_size: usize,
    queue: mpsc::Sender<PartUpload>,
    consumers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ProducerConsumerUploader {
    /// Spawns `workers` consumer tasks; they stop when `cancel` fires or the
    /// uploader is dropped.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        chunk_size: usize,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        let workers = workers.max(1);
        let (queue, receiver) = mpsc::channel(workers);
        let receiver = Arc::new(Mutex::new(receiver));
        let consumers = (0..workers)
            .map(|worker| {
                tokio::spawn(consume(
                    worker,
                    backend.clone(),
                    receiver.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        debug!(workers, chunk_size, "Started upload consumer pool");
        Self {
            backend,
            chunk_size,
            queue,
            consumers,
            cancel,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.consumers.len()
    }

    pub async fn upload(&self, key: &str, stream: ByteStream) -> BlobResult<StreamMetrics> {
        let mut reader = ChunkReader::new(stream, self.chunk_size);
        if let Some(metrics) = put_if_single_chunk(self.backend.as_ref(), key, &mut reader).await? {
            return Ok(metrics);
        }

        let session = MultipartSession::open(self.backend.clone(), key).await?;
        let (results, mut received) = mpsc::unbounded_channel();
        let mut sent = 0u32;
        loop {
            let data = match reader.read_chunk().await {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(e) => return Err(session.abort(e.into()).await),
            };
            sent += 1;
            let part = PartUpload {
                key: key.to_string(),
                upload_id: session.upload_id().to_string(),
                part_number: sent,
                data,
                results: results.clone(),
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(session.interrupt().await),
                queued = self.queue.send(part) => {
                    if queued.is_err() {
                        return Err(session
                            .abort(BlobError::consistency("upload worker pool is shut down"))
                            .await);
                    }
                }
            }
        }
        drop(results);

        let mut parts = Vec::with_capacity(sent as usize);
        while parts.len() < sent as usize {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(session.interrupt().await),
                result = received.recv() => result,
            };
            match result {
                Some(Ok(part)) => parts.push(part),
                Some(Err(e)) => return Err(session.abort(e).await),
                None => {
                    return Err(session
                        .abort(BlobError::consistency(format!(
                            "upload workers returned {} of {} parts",
                            parts.len(),
                            sent
                        )))
                        .await);
                }
            }
        }
        session.complete(parts).await?;
        Ok(reader.metrics())
    }
}

impl Drop for ProducerConsumerUploader {
    fn drop(&mut self) {
        for consumer in &self.consumers {
            consumer.abort();
        }
    }
}

async fn consume(
    worker: usize,
    backend: Arc<dyn StorageBackend>,
    queue: Arc<Mutex<mpsc::Receiver<PartUpload>>>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                next = queue.recv() => next,
            }
        };
        let Some(part) = next else {
            debug!(worker, "Upload consumer stopping");
            return;
        };
        let result = backend
            .upload_part(&part.key, &part.upload_id, part.part_number, part.data)
            .await
            .map(|e_tag| CompletedPart {
                part_number: part.part_number,
                e_tag,
            });
        // The producer may already have given up on this upload.
        let _ = part.results.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::memory::InMemoryBackend,
        transport::chunk::tests::{byte_stream, sha256_hex},
    };

    #[tokio::test]
    async fn test_upload_through_pool() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let uploader = ProducerConsumerUploader::new(memory.clone(), 8, 3, CancellationToken::new());
        assert_eq!(uploader.worker_count(), 3);
        let data: Vec<u8> = (0..100u8).collect();
        let metrics = uploader.upload("obj", byte_stream(&data, 13)).await.unwrap();
        assert_eq!(metrics.sha256_hash, sha256_hex(&data));
        assert_eq!(memory.get_object("obj").await.unwrap(), data);
        assert_eq!(memory.uploaded_parts(), 13);
    }

    #[tokio::test]
    async fn test_pool_is_shared_between_concurrent_uploads() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let uploader = Arc::new(ProducerConsumerUploader::new(
            memory.clone(),
            4,
            2,
            CancellationToken::new(),
        ));
        let mut handles = Vec::new();
        for i in 0..5u8 {
            let uploader = uploader.clone();
            handles.push(tokio::spawn(async move {
                let data = vec![i; 37];
                let key = format!("obj-{i}");
                uploader.upload(&key, byte_stream(&data, 5)).await.map(|_| (key, data))
            }));
        }
        for handle in handles {
            let (key, data) = handle.await.unwrap().unwrap();
            assert_eq!(memory.get_object(&key).await.unwrap(), data);
        }
        assert_eq!(memory.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_failed_part_aborts_and_pool_survives() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let uploader = ProducerConsumerUploader::new(memory.clone(), 4, 2, CancellationToken::new());
        memory.fail_part(2);
        let err = uploader
            .upload("bad", byte_stream(&[1u8; 20], 20))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Transfer { .. }));
        assert_eq!(memory.open_uploads(), 0);

        memory.clear_failures();
        uploader
            .upload("good", byte_stream(&[2u8; 20], 20))
            .await
            .unwrap();
        assert_eq!(memory.get_object("good").await.unwrap(), vec![2u8; 20]);
    }

    #[tokio::test]
    async fn test_cancelled_pool_interrupts_uploads() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let cancel = CancellationToken::new();
        let uploader = ProducerConsumerUploader::new(memory.clone(), 4, 1, cancel.clone());
        cancel.cancel();
        let err = uploader
            .upload("obj", byte_stream(&[0u8; 64], 64))
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(memory.open_uploads(), 0);
    }
}
