//! Uploads parts one after another on the calling task.

use std::sync::Arc;

use crate::{
    BlobResult,
    traits::{CompletedPart, StorageBackend},
    transport::{
        chunk::{ByteStream, ChunkReader, StreamMetrics},
        put_if_single_chunk,
        session::MultipartSession,
    },
};

pub struct SequentialUploader {
    backend: Arc<dyn StorageBackend>,
    chunk_size: usize,
}

impl SequentialUploader {
    pub fn new(backend: Arc<dyn StorageBackend>, chunk_size: usize) -> Self {
        Self {
            backend,
            chunk_size,
        }
    }

    pub async fn upload(&self, key: &str, stream: ByteStream) -> BlobResult<StreamMetrics> {
        let mut reader = ChunkReader::new(stream, self.chunk_size);
        if let Some(metrics) = put_if_single_chunk(self.backend.as_ref(), key, &mut reader).await? {
            return Ok(metrics);
        }

        let session = MultipartSession::open(self.backend.clone(), key).await?;
        let mut parts = Vec::new();
        let mut part_number = 1;
        loop {
            let chunk = match reader.read_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(session.abort(e.into()).await),
            };
            match self
                .backend
                .upload_part(key, session.upload_id(), part_number, chunk)
                .await
            {
                Ok(e_tag) => parts.push(CompletedPart { part_number, e_tag }),
                Err(e) => return Err(session.abort(e).await),
            }
            part_number += 1;
        }
        session.complete(parts).await?;
        Ok(reader.metrics())
    }
}
