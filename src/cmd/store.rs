use std::sync::Arc;

use anyhow::Result;
use blob_store::BlobStore;
use clap::Args;
use futures::TryStreamExt;

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only direct-path blobs under this path
    #[arg(long, conflicts_with = "updated_since")]
    direct_path: Option<String>,

    /// Only blobs updated within this many days
    #[arg(long)]
    updated_since: Option<u32>,
}

impl ListArgs {
    pub async fn run(self, store: &Arc<BlobStore>) -> Result<()> {
        let mut ids = match (self.direct_path, self.updated_since) {
            (Some(prefix), _) => store.direct_path_blob_id_stream(&prefix),
            (None, Some(days)) => store.blob_ids_updated_since(days),
            (None, None) => store.blob_id_stream(),
        };
        while let Some(id) = ids.try_next().await? {
            println!("{}", id);
        }
        Ok(())
    }
}

pub async fn metrics(store: &Arc<BlobStore>) -> Result<()> {
    let metrics = store.get_metrics().await?;
    println!("blob count: {}", metrics.blob_count);
    println!("total size: {}", metrics.total_size);
    Ok(())
}

pub async fn remove(store: &Arc<BlobStore>) -> Result<()> {
    store.stop().await;
    store.remove().await?;
    println!("removed blob store {}", store.config().name);
    Ok(())
}
