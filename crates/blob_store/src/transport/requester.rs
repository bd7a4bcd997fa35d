//! Runs N workers against one multipart session.

use std::{future::Future, sync::Arc};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    BlobError,
    BlobResult,
    traits::{CompletedPart, StorageBackend},
    transport::session::MultipartSession,
};

/// Fans part transfers for one object out to a fixed number of tasks.
///
/// Each worker receives the upload id, transfers as many parts as it can
/// claim and returns their tags. The first failure or a cancellation aborts
/// the remaining workers and the session.
pub struct ParallelRequester {
    parallelism: usize,
    cancel: CancellationToken,
}

impl ParallelRequester {
    pub fn new(parallelism: usize, cancel: CancellationToken) -> Self {
        Self {
            parallelism: parallelism.max(1),
            cancel,
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub async fn execute<F, Fut>(
        &self,
        backend: Arc<dyn StorageBackend>,
        key: &str,
        worker: F,
    ) -> BlobResult<()>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = BlobResult<Vec<CompletedPart>>> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(BlobError::Interrupted {
                key: key.to_string(),
                upload_id: None,
            });
        }
        let session = MultipartSession::open(backend, key).await?;
        let mut workers = JoinSet::new();
        for _ in 0..self.parallelism {
            workers.spawn(worker(session.upload_id().to_string()));
        }

        let mut parts = Vec::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    workers.abort_all();
                    return Err(session.interrupt().await);
                }
                next = workers.join_next() => match next {
                    None => break,
                    Some(Ok(Ok(worker_parts))) => parts.extend(worker_parts),
                    Some(Ok(Err(e))) => {
                        workers.abort_all();
                        return Err(session.abort(e).await);
                    }
                    Some(Err(join_error)) => {
                        workers.abort_all();
                        return Err(session.abort(BlobError::Other {
                            source: anyhow::Error::from(join_error),
                        }).await);
                    }
                }
            }
        }
        debug!(
            key = %session.key(),
            workers = self.parallelism,
            parts = parts.len(),
            "All part workers finished"
        );
        session.complete(parts).await
    }
}
