//! Per-node usage counters persisted as small records and summed on read.

use std::{
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use futures::TryStreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    BlobResult,
    properties::{Properties, load_properties, store_properties},
    traits::{ObjectSummary, StorageBackend},
};

const BLOB_COUNT_KEY: &str = "blobCount";
const TOTAL_SIZE_KEY: &str = "totalSize";
const METRICS_SUFFIX: &str = "-metrics.properties";

/// Aggregated usage of a store across every node writing to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobStoreMetrics {
    pub blob_count: i64,
    pub total_size: i64,
}

impl BlobStoreMetrics {
    fn from_properties(props: &Properties) -> Self {
        let read = |key: &str| props.get(key).and_then(|v| v.parse().ok()).unwrap_or(0);
        Self {
            blob_count: read(BLOB_COUNT_KEY),
            total_size: read(TOTAL_SIZE_KEY),
        }
    }

    fn to_properties(self) -> Properties {
        let mut props = Properties::new();
        props.set(BLOB_COUNT_KEY, self.blob_count.to_string());
        props.set(TOTAL_SIZE_KEY, self.total_size.to_string());
        props
    }
}

pub struct MetricsAccumulator {
    backend: Arc<dyn StorageBackend>,
    metrics_prefix: String,
    record_key: String,
    blob_count: AtomicI64,
    total_size: AtomicI64,
    dirty: AtomicBool,
    flush_interval: Duration,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsAccumulator {
    /// `metrics_prefix` ends with `/` and holds one record per node.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        metrics_prefix: String,
        node_id: &str,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let record_key = format!("{}{}{}", metrics_prefix, node_id, METRICS_SUFFIX);
        Arc::new(Self {
            backend,
            metrics_prefix,
            record_key,
            blob_count: AtomicI64::new(0),
            total_size: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
            flush_interval,
            cancel,
            flusher: Mutex::new(None),
        })
    }

    /// Seeds the counters from this node's record (writing a zero record when
    /// there is none) and starts the periodic flush task.
    pub async fn start(self: &Arc<Self>) -> BlobResult<()> {
        match load_properties(self.backend.as_ref(), &self.record_key).await? {
            Some(props) => {
                let persisted = BlobStoreMetrics::from_properties(&props);
                self.blob_count.store(persisted.blob_count, Ordering::SeqCst);
                self.total_size.store(persisted.total_size, Ordering::SeqCst);
                debug!(key = %self.record_key, ?persisted, "Loaded node metrics");
            }
            None => {
                store_properties(
                    self.backend.as_ref(),
                    &self.record_key,
                    &BlobStoreMetrics::default().to_properties(),
                    None,
                )
                .await?;
            }
        }

        let accumulator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(accumulator.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = accumulator.cancel.cancelled() => {
                        debug!("Metrics flush task stopping");
                        return;
                    }
                    _ = interval.tick() => accumulator.flush_quietly().await,
                }
            }
        });
        *self.flusher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    pub fn record_addition(&self, size: u64) {
        self.blob_count.fetch_add(1, Ordering::SeqCst);
        self.total_size.fetch_add(size as i64, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn record_deletion(&self, size: u64) {
        self.blob_count.fetch_sub(1, Ordering::SeqCst);
        self.total_size.fetch_sub(size as i64, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// This node's live counters.
    pub fn local_metrics(&self) -> BlobStoreMetrics {
        BlobStoreMetrics {
            blob_count: self.blob_count.load(Ordering::SeqCst),
            total_size: self.total_size.load(Ordering::SeqCst),
        }
    }

    /// Writes this node's record if anything changed since the last flush.
    pub async fn flush(&self) -> BlobResult<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let snapshot = self.local_metrics();
        if let Err(e) = store_properties(
            self.backend.as_ref(),
            &self.record_key,
            &snapshot.to_properties(),
            None,
        )
        .await
        {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(true)
    }

    async fn flush_quietly(&self) {
        if let Err(e) = self.flush().await {
            warn!(key = %self.record_key, error = %e, "Failed to flush blob store metrics");
        }
    }

    /// Sums the persisted records of every other node with this node's live
    /// counters.
    pub async fn get_metrics(&self) -> BlobResult<BlobStoreMetrics> {
        let records: Vec<ObjectSummary> = self
            .backend
            .list_objects(&self.metrics_prefix)
            .try_collect()
            .await?;
        let mut total = self.local_metrics();
        for record in records {
            if record.key == self.record_key || !record.key.ends_with(METRICS_SUFFIX) {
                continue;
            }
            match load_properties(self.backend.as_ref(), &record.key).await {
                Ok(Some(props)) => {
                    let node = BlobStoreMetrics::from_properties(&props);
                    total.blob_count += node.blob_count;
                    total.total_size += node.total_size;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %record.key, error = %e, "Skipping unreadable metrics record")
                }
            }
        }
        Ok(total)
    }

    /// Stops the flush task and writes a final record.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.flush_quietly().await;
    }

    /// Deletes every node's record.
    pub async fn remove(&self) -> BlobResult<()> {
        let keys: Vec<String> = self
            .backend
            .list_objects(&self.metrics_prefix)
            .map_ok(|record| record.key)
            .try_collect()
            .await?;
        self.backend.delete_objects(&keys).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::InMemoryBackend;

    fn accumulator(memory: &Arc<InMemoryBackend>, node: &str) -> Arc<MetricsAccumulator> {
        MetricsAccumulator::new(
            memory.clone(),
            "p/metrics/".to_string(),
            node,
            Duration::from_secs(2),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_start_writes_zero_record() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let node = accumulator(&memory, "node-a");
        node.start().await.unwrap();
        let record = load_properties(memory.as_ref(), "p/metrics/node-a-metrics.properties")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.get("blobCount"), Some("0"));
        assert_eq!(record.get("totalSize"), Some("0"));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_flush_only_when_dirty_and_reload() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let node = accumulator(&memory, "node-a");
        node.start().await.unwrap();
        assert!(!node.flush().await.unwrap());
        node.record_addition(100);
        node.record_addition(50);
        node.record_deletion(50);
        assert!(node.flush().await.unwrap());
        node.stop().await;

        let restarted = accumulator(&memory, "node-a");
        restarted.start().await.unwrap();
        assert_eq!(
            restarted.local_metrics(),
            BlobStoreMetrics {
                blob_count: 1,
                total_size: 100
            }
        );
        restarted.stop().await;
    }

    #[tokio::test]
    async fn test_metrics_sum_across_nodes() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let a = accumulator(&memory, "node-a");
        let b = accumulator(&memory, "node-b");
        a.start().await.unwrap();
        b.start().await.unwrap();
        a.record_addition(10);
        b.record_addition(20);
        b.record_addition(30);
        b.flush().await.unwrap();

        let seen_by_a = a.get_metrics().await.unwrap();
        assert_eq!(seen_by_a, BlobStoreMetrics { blob_count: 3, total_size: 60 });
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_failed_flush_stays_dirty() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let node = accumulator(&memory, "node-a");
        node.start().await.unwrap();
        node.record_addition(1);
        memory.fail_puts(true);
        assert!(node.flush().await.is_err());
        memory.fail_puts(false);
        assert!(node.flush().await.unwrap());
        node.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let node = accumulator(&memory, "node-a");
        node.start().await.unwrap();
        node.record_addition(42);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let record = load_properties(memory.as_ref(), "p/metrics/node-a-metrics.properties")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.get("totalSize"), Some("42"));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_remove_deletes_all_records() {
        let memory = Arc::new(InMemoryBackend::new("bucket"));
        let a = accumulator(&memory, "node-a");
        let b = accumulator(&memory, "node-b");
        a.start().await.unwrap();
        b.start().await.unwrap();
        a.stop().await;
        b.stop().await;
        a.remove().await.unwrap();
        let left: Vec<ObjectSummary> = memory.list_objects("p/metrics/").try_collect().await.unwrap();
        assert!(left.is_empty());
    }
}
