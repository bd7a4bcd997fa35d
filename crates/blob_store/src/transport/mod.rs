//! Chunked transfer strategies.
//!
//! Every strategy reads the first chunk before deciding how to write: a
//! payload shorter than one chunk is written with a single request, anything
//! else (including a payload of exactly one chunk) goes through a multipart
//! session. Copies follow the same rule based on the source size.

pub mod chunk;
pub mod copier;
pub mod parallel;
pub mod producer_consumer;
pub mod requester;
pub mod sequential;
mod session;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use self::{
    chunk::{ByteStream, ChunkReader, StreamMetrics},
    copier::{ParallelCopier, SequentialCopier},
    parallel::ParallelUploader,
    producer_consumer::ProducerConsumerUploader,
    requester::ParallelRequester,
    sequential::SequentialUploader,
};
use crate::{
    BlobResult,
    config::{CopierConfig, CopierStrategy, UploaderConfig, UploaderStrategy, resolve_parallelism},
    traits::StorageBackend,
};

/// Writes the payload with one put when it is shorter than a chunk.
///
/// Returns `None` with the first chunk pushed back into `reader` when a
/// multipart upload is needed.
pub(crate) async fn put_if_single_chunk(
    backend: &dyn StorageBackend,
    key: &str,
    reader: &mut ChunkReader,
) -> BlobResult<Option<StreamMetrics>> {
    let first = reader
        .read_chunk()
        .await
        .map_err(|e| crate::BlobError::from(e).into_transfer(key, None))?
        .unwrap_or_default();
    if first.len() >= reader.chunk_size() {
        reader.unread(first);
        return Ok(None);
    }
    debug!(key = %key, size = first.len(), "Uploading object in one request");
    backend
        .put_object(key, first)
        .await
        .map_err(|e| e.into_transfer(key, None))?;
    Ok(Some(reader.metrics()))
}

/// The upload strategy chosen for a store.
pub enum Uploader {
    Sequential(SequentialUploader),
    Parallel(ParallelUploader),
    ProducerConsumer(ProducerConsumerUploader),
}

impl Uploader {
    /// Builds the configured strategy. The producer-consumer pool is spawned
    /// here and stops when `cancel` fires.
    pub fn from_config(
        config: &UploaderConfig,
        backend: Arc<dyn StorageBackend>,
        cancel: CancellationToken,
    ) -> Self {
        let workers = resolve_parallelism(config.parallelism);
        match config.strategy {
            UploaderStrategy::Sequential => {
                Uploader::Sequential(SequentialUploader::new(backend, config.chunk_size))
            }
            UploaderStrategy::Parallel => Uploader::Parallel(ParallelUploader::new(
                backend,
                config.chunk_size,
                ParallelRequester::new(workers, cancel),
            )),
            UploaderStrategy::ProducerConsumer => Uploader::ProducerConsumer(
                ProducerConsumerUploader::new(backend, config.chunk_size, workers, cancel),
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Uploader::Sequential(_) => "sequential",
            Uploader::Parallel(_) => "parallel",
            Uploader::ProducerConsumer(_) => "producer_consumer",
        }
    }

    /// Streams `stream` into `key`, returning its length and hash.
    pub async fn upload(&self, key: &str, stream: ByteStream) -> BlobResult<StreamMetrics> {
        match self {
            Uploader::Sequential(uploader) => uploader.upload(key, stream).await,
            Uploader::Parallel(uploader) => uploader.upload(key, stream).await,
            Uploader::ProducerConsumer(uploader) => uploader.upload(key, stream).await,
        }
    }
}

/// The copy strategy chosen for a store.
pub enum Copier {
    Sequential(SequentialCopier),
    Parallel(ParallelCopier),
}

impl Copier {
    pub fn from_config(
        config: &CopierConfig,
        backend: Arc<dyn StorageBackend>,
        cancel: CancellationToken,
    ) -> Self {
        match config.strategy {
            CopierStrategy::Sequential => {
                Copier::Sequential(SequentialCopier::new(backend, config.chunk_size))
            }
            CopierStrategy::Parallel => Copier::Parallel(ParallelCopier::new(
                backend,
                config.chunk_size,
                ParallelRequester::new(resolve_parallelism(config.parallelism), cancel),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Copier::Sequential(_) => "sequential",
            Copier::Parallel(_) => "parallel",
        }
    }

    pub async fn copy(&self, source: &str, destination: &str) -> BlobResult<()> {
        match self {
            Copier::Sequential(copier) => copier.copy(source, destination).await,
            Copier::Parallel(copier) => copier.copy(source, destination).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::memory::InMemoryBackend,
        transport::chunk::tests::{byte_stream, sha256_hex},
    };

    fn uploaders(memory: &Arc<InMemoryBackend>, chunk_size: usize) -> Vec<Uploader> {
        [
            UploaderStrategy::Sequential,
            UploaderStrategy::Parallel,
            UploaderStrategy::ProducerConsumer,
        ]
        .into_iter()
        .map(|strategy| {
            let config = UploaderConfig {
                strategy,
                chunk_size,
                parallelism: 3,
            };
            Uploader::from_config(&config, memory.clone(), CancellationToken::new())
        })
        .collect()
    }

    #[tokio::test]
    async fn test_strategies_are_interchangeable() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let data: Vec<u8> = (0..=255u8).cycle().take(4099).collect();
        for uploader in uploaders(&memory, 512) {
            let key = format!("obj-{}", uploader.name());
            let metrics = uploader.upload(&key, byte_stream(&data, 333)).await.unwrap();
            assert_eq!(metrics.size, data.len() as u64);
            assert_eq!(metrics.sha256_hash, sha256_hex(&data));
            assert_eq!(memory.get_object(&key).await.unwrap(), data);
        }
        assert_eq!(memory.completed_uploads(), 3);
    }

    #[tokio::test]
    async fn test_chunk_boundary() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        for uploader in uploaders(&memory, 64) {
            let before = memory.completed_uploads();
            let short = format!("short-{}", uploader.name());
            uploader.upload(&short, byte_stream(&[1u8; 63], 63)).await.unwrap();
            assert_eq!(memory.completed_uploads(), before, "63 bytes is a single put");

            let exact = format!("exact-{}", uploader.name());
            uploader.upload(&exact, byte_stream(&[2u8; 64], 64)).await.unwrap();
            assert_eq!(memory.completed_uploads(), before + 1, "64 bytes is multipart");

            let empty = format!("empty-{}", uploader.name());
            let metrics = uploader.upload(&empty, byte_stream(&[], 1)).await.unwrap();
            assert_eq!(metrics.size, 0);
            assert_eq!(memory.get_object(&empty).await.unwrap().len(), 0);
        }
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_session() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        for uploader in uploaders(&memory, 4) {
            let failing: ByteStream = futures::StreamExt::boxed(futures::stream::iter(vec![
                Ok(bytes::Bytes::from_static(b"12345678")),
                Err(anyhow::anyhow!("client disconnected")),
            ]));
            let err = uploader.upload("obj", failing).await.unwrap_err();
            assert!(matches!(err, crate::BlobError::Transfer { .. }));
            assert_eq!(memory.open_uploads(), 0);
        }
    }
}
