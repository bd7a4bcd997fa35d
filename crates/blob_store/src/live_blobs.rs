//! Process-wide registry of blobs in use, so every caller working on one id
//! shares one `Blob` and therefore one lock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use crate::{blob::Blob, id::BlobId};

const MIN_PRUNE_THRESHOLD: usize = 1024;

struct Entries {
    blobs: HashMap<BlobId, Weak<Blob>>,
    prune_at: usize,
}

/// Weakly-held cache: an entry lives as long as some caller holds its blob.
pub struct LiveBlobCache {
    entries: Mutex<Entries>,
}

impl Default for LiveBlobCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveBlobCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                blobs: HashMap::new(),
                prune_at: MIN_PRUNE_THRESHOLD,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live blob for `id`, creating it when nobody holds one.
    pub fn get_or_insert_with(&self, id: &BlobId, create: impl FnOnce() -> Blob) -> Arc<Blob> {
        let mut entries = self.entries();
        if let Some(blob) = entries.blobs.get(id).and_then(Weak::upgrade) {
            return blob;
        }
        let blob = Arc::new(create());
        entries.blobs.insert(id.clone(), Arc::downgrade(&blob));
        if entries.blobs.len() >= entries.prune_at {
            entries.blobs.retain(|_, blob| blob.strong_count() > 0);
            entries.prune_at = (entries.blobs.len() * 2).max(MIN_PRUNE_THRESHOLD);
        }
        blob
    }

    /// Number of entries whose blob is still held somewhere.
    pub fn live_count(&self) -> usize {
        self.entries()
            .blobs
            .values()
            .filter(|blob| blob.strong_count() > 0)
            .count()
    }

    pub fn clear(&self) {
        self.entries().blobs.clear();
    }
}
