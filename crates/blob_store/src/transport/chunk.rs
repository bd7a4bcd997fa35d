//! Splits an incoming byte stream into fixed-size chunks while hashing it.

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream::BoxStream};
use sha2::{Digest, Sha256};

/// Payload stream accepted by the uploaders.
pub type ByteStream = BoxStream<'static, anyhow::Result<Bytes>>;

/// Length and SHA-256 of everything read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetrics {
    pub size: u64,
    pub sha256_hash: String,
}

pub struct ChunkReader {
    stream: ByteStream,
    chunk_size: usize,
    buffer: BytesMut,
    pushed_back: Option<Bytes>,
    hasher: Sha256,
    size: u64,
    exhausted: bool,
}

impl ChunkReader {
    pub fn new(stream: ByteStream, chunk_size: usize) -> Self {
        Self {
            stream,
            chunk_size: chunk_size.max(1),
            buffer: BytesMut::new(),
            pushed_back: None,
            hasher: Sha256::new(),
            size: 0,
            exhausted: false,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns the next chunk, or `None` once the stream is drained.
    ///
    /// Every chunk is exactly `chunk_size` bytes except the last one.
    pub async fn read_chunk(&mut self) -> anyhow::Result<Option<Bytes>> {
        if let Some(chunk) = self.pushed_back.take() {
            return Ok(Some(chunk));
        }
        while self.buffer.len() < self.chunk_size && !self.exhausted {
            match self.stream.next().await {
                Some(item) => {
                    let bytes = item?;
                    self.hasher.update(&bytes);
                    self.size += bytes.len() as u64;
                    self.buffer.extend_from_slice(&bytes);
                }
                None => self.exhausted = true,
            }
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let take = self.buffer.len().min(self.chunk_size);
        Ok(Some(self.buffer.split_to(take).freeze()))
    }

    /// Hands `chunk` back so the next `read_chunk` returns it again.
    pub fn unread(&mut self, chunk: Bytes) {
        self.pushed_back = Some(chunk);
    }

    /// Metrics over the bytes consumed so far; complete once drained.
    pub fn metrics(&self) -> StreamMetrics {
        StreamMetrics {
            size: self.size,
            sha256_hash: hex::encode(self.hasher.clone().finalize()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use futures::stream;

    use super::*;

    /// A stream delivering `data` in pieces of `piece` bytes.
    pub(crate) fn byte_stream(data: &[u8], piece: usize) -> ByteStream {
        let pieces: Vec<anyhow::Result<Bytes>> = data
            .chunks(piece.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(pieces).boxed()
    }

    pub(crate) fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_chunks_are_regrouped_to_chunk_size() {
        let data: Vec<u8> = (0..25u8).collect();
        let mut reader = ChunkReader::new(byte_stream(&data, 7), 10);
        let mut sizes = Vec::new();
        while let Some(chunk) = reader.read_chunk().await.unwrap() {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(
            reader.metrics(),
            StreamMetrics {
                size: 25,
                sha256_hash: sha256_hex(&data),
            }
        );
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut reader = ChunkReader::new(byte_stream(&[], 4), 10);
        assert!(reader.read_chunk().await.unwrap().is_none());
        assert_eq!(reader.metrics().size, 0);
        assert_eq!(reader.metrics().sha256_hash, sha256_hex(&[]));
    }

    #[tokio::test]
    async fn test_unread_returns_chunk_again() {
        let mut reader = ChunkReader::new(byte_stream(b"abcdef", 6), 4);
        let first = reader.read_chunk().await.unwrap().unwrap();
        reader.unread(first.clone());
        assert_eq!(reader.read_chunk().await.unwrap(), Some(first));
        assert_eq!(reader.read_chunk().await.unwrap().unwrap(), "ef");
        assert_eq!(reader.metrics().size, 6);
    }

    #[tokio::test]
    async fn test_stream_errors_propagate() {
        let failing: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(anyhow::anyhow!("client went away")),
        ])
        .boxed();
        let mut reader = ChunkReader::new(failing, 8);
        assert!(reader.read_chunk().await.is_err());
    }
}
