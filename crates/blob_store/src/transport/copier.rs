//! Backend-side copies, whole-object for small sources and ranged part
//! copies otherwise.

use std::{
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use tracing::debug;

use crate::{
    BlobError,
    BlobResult,
    traits::{CompletedPart, StorageBackend},
    transport::{requester::ParallelRequester, session::MultipartSession},
};

/// Number of parts needed to cover `size` bytes.
pub fn part_count(size: u64, chunk_size: usize) -> u32 {
    size.div_ceil(chunk_size.max(1) as u64) as u32
}

/// Byte range of part `part_number` (1-based), end exclusive.
pub fn part_range(part_number: u32, chunk_size: usize, size: u64) -> Range<u64> {
    let chunk_size = chunk_size as u64;
    let first = (part_number as u64 - 1) * chunk_size;
    let end = (part_number as u64 * chunk_size).min(size);
    first..end
}

async fn source_size(backend: &dyn StorageBackend, source: &str) -> BlobResult<u64> {
    match backend.head_object(source).await {
        Ok(Some(summary)) => Ok(summary.size),
        Ok(None) => Err(BlobError::NotFound {
            key: source.to_string(),
        }
        .into_transfer(source, None)),
        Err(e) => Err(e.into_transfer(source, None)),
    }
}

/// Copies the whole object when it fits in one chunk. Returns the source size
/// when a multipart copy is needed instead.
async fn copy_if_single_chunk(
    backend: &dyn StorageBackend,
    source: &str,
    destination: &str,
    chunk_size: usize,
) -> BlobResult<Option<u64>> {
    let size = source_size(backend, source).await?;
    if size >= chunk_size as u64 {
        return Ok(Some(size));
    }
    debug!(source = %source, destination = %destination, size, "Copying object in one request");
    backend
        .copy_object(source, destination)
        .await
        .map_err(|e| e.into_transfer(destination, None))?;
    Ok(None)
}

pub struct SequentialCopier {
    backend: Arc<dyn StorageBackend>,
    chunk_size: usize,
}

impl SequentialCopier {
    pub fn new(backend: Arc<dyn StorageBackend>, chunk_size: usize) -> Self {
        Self {
            backend,
            chunk_size,
        }
    }

    pub async fn copy(&self, source: &str, destination: &str) -> BlobResult<()> {
        let Some(size) =
            copy_if_single_chunk(self.backend.as_ref(), source, destination, self.chunk_size)
                .await?
        else {
            return Ok(());
        };

        let session = MultipartSession::open(self.backend.clone(), destination).await?;
        let mut parts = Vec::new();
        for part_number in 1..=part_count(size, self.chunk_size) {
            let range = part_range(part_number, self.chunk_size, size);
            match self
                .backend
                .upload_part_copy(source, destination, session.upload_id(), part_number, range)
                .await
            {
                Ok(e_tag) => parts.push(CompletedPart { part_number, e_tag }),
                Err(e) => return Err(session.abort(e).await),
            }
        }
        session.complete(parts).await
    }
}

pub struct ParallelCopier {
    backend: Arc<dyn StorageBackend>,
    chunk_size: usize,
    requester: ParallelRequester,
}

impl ParallelCopier {
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

    pub async fn copy(&self, source: &str, destination: &str) -> BlobResult<()> {
        let Some(size) =
            copy_if_single_chunk(self.backend.as_ref(), source, destination, self.chunk_size)
                .await?
        else {
            return Ok(());
        };

        let total_parts = part_count(size, self.chunk_size);
        let chunk_size = self.chunk_size;
        let next_part = Arc::new(AtomicU32::new(0));
        let backend = self.backend.clone();
        let source = source.to_string();
        let target = destination.to_string();
        self.requester
            .execute(self.backend.clone(), destination, move |upload_id| {
                let backend = backend.clone();
                let next_part = next_part.clone();
                let source = source.clone();
                let target = target.clone();
                async move {
                    let mut parts = Vec::new();
                    loop {
                        let part_number = next_part.fetch_add(1, Ordering::SeqCst) + 1;
                        if part_number > total_parts {
                            break;
                        }
                        let range = part_range(part_number, chunk_size, size);
                        let e_tag = backend
                            .upload_part_copy(&source, &target, &upload_id, part_number, range)
                            .await?;
                        parts.push(CompletedPart { part_number, e_tag });
                    }
                    Ok(parts)
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::backends::memory::InMemoryBackend;

    async fn seeded(data: &[u8]) -> Arc<InMemoryBackend> {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        memory
            .put_object("src", Bytes::copy_from_slice(data))
            .await
            .unwrap();
        memory
    }

    #[test]
    fn test_part_ranges() {
        assert_eq!(part_count(10, 4), 3);
        assert_eq!(part_count(8, 4), 2);
        assert_eq!(part_count(0, 4), 0);
        assert_eq!(part_range(1, 4, 10), 0..4);
        assert_eq!(part_range(3, 4, 10), 8..10);
    }

    #[tokio::test]
    async fn test_small_source_uses_single_copy() {
        let memory = seeded(b"abc").await;
        SequentialCopier::new(memory.clone(), 4)
            .copy("src", "dst")
            .await
            .unwrap();
        assert_eq!(memory.get_object("dst").await.unwrap(), "abc");
        assert_eq!(memory.uploaded_parts(), 0);
    }

    #[tokio::test]
    async fn test_sequential_ranged_copy() {
        let data: Vec<u8> = (0..50u8).collect();
        let memory = seeded(&data).await;
        SequentialCopier::new(memory.clone(), 16)
            .copy("src", "dst")
            .await
            .unwrap();
        assert_eq!(memory.get_object("dst").await.unwrap(), data);
        assert_eq!(memory.uploaded_parts(), 4);
    }

    #[tokio::test]
    async fn test_parallel_ranged_copy() {
        let data: Vec<u8> = (0..=255u8).cycle().take(777).collect();
        let memory = seeded(&data).await;
        ParallelCopier::new(
            memory.clone(),
            100,
            ParallelRequester::new(3, CancellationToken::new()),
        )
        .copy("src", "dst")
        .await
        .unwrap();
        assert_eq!(memory.get_object("dst").await.unwrap(), data);
        assert_eq!(memory.uploaded_parts(), 8);
    }

    #[tokio::test]
    async fn test_missing_source_is_a_transfer_error() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let err = SequentialCopier::new(memory, 4)
            .copy("nothing", "dst")
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Transfer { .. }));
    }

    #[tokio::test]
    async fn test_failed_part_copy_aborts() {
        let memory = seeded(&[9u8; 40]).await;
        memory.fail_part(2);
        let err = ParallelCopier::new(
            memory.clone(),
            10,
            ParallelRequester::new(2, CancellationToken::new()),
        )
        .copy("src", "dst")
        .await
        .unwrap_err();
        assert!(matches!(err, BlobError::Transfer { .. }));
        assert_eq!(memory.open_uploads(), 0);
        assert!(memory.head_object("dst").await.unwrap().is_none());
    }
}
