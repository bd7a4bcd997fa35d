use std::{path::PathBuf, sync::Arc};

use anyhow::{Result, anyhow};
use blob_store::{
    BLOB_NAME_HEADER,
    BlobId,
    BlobStore,
    ByteStream,
    CONTENT_TYPE_HEADER,
    CREATED_BY_HEADER,
    DIRECT_PATH_HEADER,
    Headers,
    TEMPORARY_BLOB_HEADER,
};
use clap::Args;
use futures::{StreamExt, TryStreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::info;

/// Parses a `KEY=VALUE` header argument.
fn parse_header(arg: &str) -> Result<(String, String), String> {
    arg.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", arg))
}

#[derive(Debug, Args)]
pub struct HeaderArgs {
    /// Blob name recorded in the blob's headers
    #[arg(short, long)]
    name: String,

    #[arg(long)]
    content_type: Option<String>,

    /// Address the blob by its name instead of a random id
    #[arg(long)]
    direct_path: bool,

    /// Mark the blob temporary
    #[arg(long)]
    temporary: bool,

    /// Extra header, repeatable
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
}

impl HeaderArgs {
    fn into_headers(self) -> Headers {
        let mut headers: Headers = self.headers.into_iter().collect();
        headers.insert(BLOB_NAME_HEADER.to_string(), self.name);
        headers
            .entry(CREATED_BY_HEADER.to_string())
            .or_insert_with(|| std::env::var("USER").unwrap_or_else(|_| "blobstore-cli".to_string()));
        if let Some(content_type) = self.content_type {
            headers.insert(CONTENT_TYPE_HEADER.to_string(), content_type);
        }
        if self.direct_path {
            headers.insert(DIRECT_PATH_HEADER.to_string(), "true".to_string());
        }
        if self.temporary {
            headers.insert(TEMPORARY_BLOB_HEADER.to_string(), "true".to_string());
        }
        headers
    }
}

#[derive(Debug, Args)]
pub struct PutArgs {
    /// File to store
    file: PathBuf,

    #[command(flatten)]
    headers: HeaderArgs,
}

impl PutArgs {
    pub async fn run(self, store: &Arc<BlobStore>) -> Result<()> {
        let file = tokio::fs::File::open(&self.file).await?;
        let content: ByteStream = ReaderStream::new(file).map_err(anyhow::Error::from).boxed();
        let blob = store.create(content, self.headers.into_headers(), None).await?;
        let metrics = blob.metrics()?;
        info!(
            blob_id = %blob.id(),
            size = metrics.content_size,
            sha256 = %metrics.sha256_hash,
            "Stored blob"
        );
        println!("{}", blob.id());
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct GetArgs {
    blob_id: String,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    include_deleted: bool,
}

impl GetArgs {
    pub async fn run(self, store: &Arc<BlobStore>) -> Result<()> {
        let blob_id = BlobId::from(self.blob_id.as_str());
        let blob = store
            .get(&blob_id, self.include_deleted)
            .await?
            .ok_or_else(|| anyhow!("blob {} not found", blob_id))?;
        match self.output {
            Some(path) => {
                let mut file = tokio::fs::File::create(&path).await?;
                write_blob(&blob, &mut file).await
            }
            None => write_blob(&blob, &mut tokio::io::stdout()).await,
        }
    }
}

async fn write_blob<W>(blob: &blob_store::Blob, out: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut content = blob.open_stream().await?;
    while let Some(chunk) = content.try_next().await? {
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    Ok(())
}

#[derive(Debug, Args)]
pub struct CopyArgs {
    blob_id: String,

    #[command(flatten)]
    headers: HeaderArgs,
}

impl CopyArgs {
    pub async fn run(self, store: &Arc<BlobStore>) -> Result<()> {
        let blob_id = BlobId::from(self.blob_id.as_str());
        let copy = store
            .copy(&blob_id, self.headers.into_headers())
            .await?
            .ok_or_else(|| anyhow!("blob {} not found", blob_id))?;
        println!("{}", copy.id());
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    blob_id: String,

    #[arg(short, long, default_value = "deleted from the command line")]
    reason: String,

    /// Remove the records instead of soft-deleting
    #[arg(long)]
    hard: bool,
}

impl DeleteArgs {
    pub async fn run(self, store: &Arc<BlobStore>) -> Result<()> {
        let blob_id = BlobId::from(self.blob_id.as_str());
        let deleted = if self.hard {
            store.delete_hard(&blob_id).await?
        } else {
            store.delete(&blob_id, &self.reason).await?
        };
        if deleted {
            println!("deleted {}", blob_id);
        } else {
            println!("{} was already deleted or never existed", blob_id);
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct IdArgs {
    blob_id: String,
}

impl IdArgs {
    /// Clears the deletion tags and then the deleted flag so the blob is
    /// visible again.
    pub async fn undelete(self, store: &Arc<BlobStore>) -> Result<()> {
        let blob_id = BlobId::from(self.blob_id.as_str());
        if !store.undelete(&blob_id).await? {
            return Err(anyhow!("blob {} not found", blob_id));
        }
        let mut attributes = store
            .get_blob_attributes(&blob_id)
            .await?
            .ok_or_else(|| anyhow!("blob {} disappeared during undelete", blob_id))?;
        attributes.clear_deletion();
        if !store.set_blob_attributes(&blob_id, &attributes).await {
            return Err(anyhow!("unable to clear the deleted flag of {}", blob_id));
        }
        println!("restored {}", blob_id);
        Ok(())
    }

    pub async fn stat(self, store: &Arc<BlobStore>) -> Result<()> {
        let blob_id = BlobId::from(self.blob_id.as_str());
        let attributes = store
            .get_blob_attributes(&blob_id)
            .await?
            .ok_or_else(|| anyhow!("blob {} not found", blob_id))?;
        println!("id: {}", blob_id);
        println!("size: {}", attributes.metrics.content_size);
        println!("sha256: {}", attributes.metrics.sha256_hash);
        println!("created: {}", attributes.metrics.creation_time.to_rfc3339());
        println!("deleted: {}", attributes.deleted);
        if let Some(reason) = &attributes.deleted_reason {
            println!("deleted reason: {}", reason);
        }
        let mut headers: Vec<_> = attributes.headers.iter().collect();
        headers.sort();
        for (key, value) in headers {
            println!("{}: {}", key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Bucket.repo-name=maven-releases"),
            Ok(("Bucket.repo-name".to_string(), "maven-releases".to_string()))
        );
        assert_eq!(parse_header("k=a=b"), Ok(("k".to_string(), "a=b".to_string())));
        assert!(parse_header("novalue").is_err());
        assert!(parse_header("=value").is_err());
    }

    #[test]
    fn test_header_args() {
        let args = HeaderArgs {
            name: "com/acme/app.jar".to_string(),
            content_type: Some("application/java-archive".to_string()),
            direct_path: true,
            temporary: false,
            headers: vec![(CREATED_BY_HEADER.to_string(), "ci".to_string())],
        };
        let headers = args.into_headers();
        assert_eq!(headers[BLOB_NAME_HEADER], "com/acme/app.jar");
        assert_eq!(headers[CREATED_BY_HEADER], "ci");
        assert_eq!(headers[DIRECT_PATH_HEADER], "true");
        assert!(!headers.contains_key(TEMPORARY_BLOB_HEADER));
    }

    #[tokio::test]
    async fn test_put_then_get_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        let output = dir.path().join("output.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(20_000).collect();
        std::fs::write(&input, &data).unwrap();

        let mut config = blob_store::BlobStoreConfig::new("cli-test");
        config.backend = blob_store::BackendKind::Memory;
        config.uploader.chunk_size = 4096;
        let store = BlobStore::connect(config).await.unwrap();

        let file = tokio::fs::File::open(&input).await.unwrap();
        let content: ByteStream = ReaderStream::new(file).map_err(anyhow::Error::from).boxed();
        let blob = store
            .create(content, Headers::new(), None)
            .await
            .unwrap();

        GetArgs {
            blob_id: blob.id().to_string(),
            output: Some(output.clone()),
            include_deleted: false,
        }
        .run(&store)
        .await
        .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), data);
        store.stop().await;
    }

    #[tokio::test]
    async fn test_undelete_restores_visibility() {
        let mut config = blob_store::BlobStoreConfig::new("cli-test");
        config.backend = blob_store::BackendKind::Memory;
        let store = BlobStore::connect(config).await.unwrap();
        let content: ByteStream =
            futures::stream::iter(vec![Ok(bytes::Bytes::from_static(b"restore"))]).boxed();
        let id = store
            .create(content, Headers::new(), None)
            .await
            .unwrap()
            .id()
            .clone();
        store.delete(&id, "test").await.unwrap();
        assert!(store.get(&id, false).await.unwrap().is_none());

        IdArgs {
            blob_id: id.to_string(),
        }
        .undelete(&store)
        .await
        .unwrap();
        assert!(store.get(&id, false).await.unwrap().is_some());
        store.stop().await;
    }
}
