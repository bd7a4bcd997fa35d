//! Blob store configuration.

use std::{fmt, net::Ipv4Addr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{BlobError, BlobResult};

/// Soft-deleted blobs expire after this many days unless configured otherwise.
pub const DEFAULT_EXPIRATION_IN_DAYS: u32 = 3;

/// Retention value that turns every delete into a hard delete.
pub const NO_AUTOMATIC_EXPIRY_HARD_DELETE: u32 = 0;

/// Default part size for chunked uploads and copies (5 MiB, the S3 minimum).
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Which object storage implementation backs the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    S3,
    Memory,
}

/// Upload strategy selected once when the store opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploaderStrategy {
    Sequential,
    Parallel,
    #[default]
    ProducerConsumer,
}

/// Copy strategy selected once when the store opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopierStrategy {
    Sequential,
    #[default]
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploaderConfig {
    #[serde(default)]
    pub strategy: UploaderStrategy,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Worker count; 0 means one worker per available CPU.
    #[serde(default)]
    pub parallelism: usize,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            strategy: UploaderStrategy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallelism: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopierConfig {
    #[serde(default)]
    pub strategy: CopierStrategy,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Worker count; 0 means one worker per available CPU.
    #[serde(default)]
    pub parallelism: usize,
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            strategy: CopierStrategy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallelism: 0,
        }
    }
}

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Configuration for one blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    /// Store name, used to key the lifecycle rule this store owns.
    #[serde(default = "default_store_name")]
    pub name: String,

    #[serde(default)]
    pub backend: BackendKind,

    pub bucket: String,

    /// Key prefix inside the bucket, shared by every record of this store.
    #[serde(default)]
    pub prefix: Option<String>,

    /// AWS region (for S3).
    #[serde(default)]
    pub region: Option<String>,

    /// Endpoint override for S3-compatible services.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<Secret>,

    #[serde(default)]
    pub session_token: Option<Secret>,

    /// Role ARN assumed on top of the resolved credentials.
    #[serde(default)]
    pub assume_role: Option<String>,

    /// Days a soft-deleted blob is retained before the backend expires it.
    #[serde(default = "default_expiration_days")]
    pub expiration_days: u32,

    /// Request signer: `v4` (default) or `none` for anonymous access.
    #[serde(default)]
    pub signer_type: Option<String>,

    #[serde(default)]
    pub force_path_style: bool,

    #[serde(default)]
    pub uploader: UploaderConfig,

    #[serde(default)]
    pub copier: CopierConfig,

    /// Identifies this process' metrics record among the nodes sharing a store.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default = "default_metrics_flush_interval")]
    pub metrics_flush_interval: u64,

    /// Turn hard deletes into soft deletes while retention is nonzero.
    #[serde(default)]
    pub prefer_expire: bool,

    /// Turn every delete into a hard delete.
    #[serde(default)]
    pub force_hard_delete: bool,

    #[serde(default = "default_true")]
    pub prefer_async_cleanup: bool,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self::new("artifact-blobs")
    }
}

impl BlobStoreConfig {
    pub fn new(bucket: &str) -> Self {
        Self {
            name: default_store_name(),
            backend: BackendKind::default(),
            bucket: bucket.to_string(),
            prefix: None,
            region: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            assume_role: None,
            expiration_days: DEFAULT_EXPIRATION_IN_DAYS,
            signer_type: None,
            force_path_style: false,
            uploader: UploaderConfig::default(),
            copier: CopierConfig::default(),
            node_id: default_node_id(),
            metrics_flush_interval: default_metrics_flush_interval(),
            prefer_expire: false,
            force_hard_delete: false,
            prefer_async_cleanup: true,
        }
    }

    pub fn validate(&self) -> BlobResult<()> {
        if !validate_bucket_name(&self.bucket) {
            return Err(BlobError::configuration(format!(
                "invalid bucket name '{}': use 3 to 63 lower-case letters, digits, dots or \
                 hyphens, starting and ending with a letter or digit",
                self.bucket
            )));
        }
        if self.name.trim().is_empty() {
            return Err(BlobError::configuration("store name must not be empty"));
        }
        if self.uploader.chunk_size == 0 || self.copier.chunk_size == 0 {
            return Err(BlobError::configuration("chunk size must be greater than 0"));
        }
        if self.node_id.is_empty() || self.node_id.contains('/') {
            return Err(BlobError::configuration(format!(
                "invalid node id '{}'",
                self.node_id
            )));
        }
        if self.metrics_flush_interval == 0 {
            return Err(BlobError::configuration(
                "metrics flush interval must be at least one second",
            ));
        }
        if self.secret_access_key.is_some() != self.access_key_id.is_some() {
            return Err(BlobError::configuration(
                "access_key_id and secret_access_key must be configured together",
            ));
        }
        Ok(())
    }

    /// Normalised key prefix: no leading `/`, a trailing `/` when non-empty.
    pub fn bucket_prefix(&self) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{}/", prefix),
            _ => String::new(),
        }
    }

    pub fn is_soft_delete_enabled(&self) -> bool {
        self.expiration_days != NO_AUTOMATIC_EXPIRY_HARD_DELETE
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_flush_interval)
    }
}

/// Resolves a configured worker count, treating 0 as "one per CPU".
pub fn resolve_parallelism(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Checks a bucket name against the S3 naming rules.
pub fn validate_bucket_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if !(3..=63).contains(&bytes.len()) {
        return false;
    }
    let allowed = |c: &u8| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == b'.' || *c == b'-';
    if !bytes.iter().all(allowed) {
        return false;
    }
    let alphanumeric = |c: u8| c.is_ascii_lowercase() || c.is_ascii_digit();
    if !alphanumeric(bytes[0]) || !alphanumeric(bytes[bytes.len() - 1]) {
        return false;
    }
    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return false;
    }
    !starts_with_ipv4_address(name)
}

fn starts_with_ipv4_address(name: &str) -> bool {
    if name.parse::<Ipv4Addr>().is_ok() {
        return true;
    }
    let segments: Vec<&str> = name.splitn(4, '.').collect();
    if segments.len() < 4 {
        return false;
    }
    let octet = |s: &str| (1..=3).contains(&s.len()) && s.bytes().all(|c| c.is_ascii_digit());
    let leading_digits = segments[3].bytes().take_while(u8::is_ascii_digit).count();
    segments[..3].iter().all(|s| octet(s)) && (1..=3).contains(&leading_digits)
}

fn default_store_name() -> String {
    "default".to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_expiration_days() -> u32 {
    DEFAULT_EXPIRATION_IN_DAYS
}

fn default_node_id() -> String {
    "local".to_string()
}

fn default_metrics_flush_interval() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_rules() {
        for valid in ["abc", "my-bucket", "my.bucket.01", "01234.56789", "a1b"] {
            assert!(validate_bucket_name(valid), "{valid} should be valid");
        }
        for invalid in [
            "ab",
            "Bucket",
            "-bucket",
            "bucket-",
            "my..bucket",
            "my.-bucket",
            "my-.bucket",
            "192.168.5.4",
            "127.0.0.1abc",
            "under_score",
            "a".repeat(64).as_str(),
        ] {
            assert!(!validate_bucket_name(invalid), "{invalid} should be invalid");
        }
    }

    #[test]
    fn test_bucket_prefix_normalisation() {
        let mut config = BlobStoreConfig::new("bucket");
        assert_eq!(config.bucket_prefix(), "");
        config.prefix = Some("/nexus/blobs".to_string());
        assert_eq!(config.bucket_prefix(), "nexus/blobs/");
        config.prefix = Some("nexus/".to_string());
        assert_eq!(config.bucket_prefix(), "nexus/");
        config.prefix = Some("/".to_string());
        assert_eq!(config.bucket_prefix(), "");
    }

    #[test]
    fn test_yaml_defaults() {
        let config: BlobStoreConfig = serde_yaml::from_str("bucket: artifacts\n").unwrap();
        assert_eq!(config.name, "default");
        assert_eq!(config.backend, BackendKind::S3);
        assert_eq!(config.expiration_days, DEFAULT_EXPIRATION_IN_DAYS);
        assert_eq!(config.uploader.strategy, UploaderStrategy::ProducerConsumer);
        assert_eq!(config.uploader.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.copier.strategy, CopierStrategy::Parallel);
        assert_eq!(config.node_id, "local");
        assert_eq!(config.flush_interval(), Duration::from_secs(2));
        assert!(config.prefer_async_cleanup);
        assert!(config.is_soft_delete_enabled());
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_strategies_and_retention() {
        let config: BlobStoreConfig = serde_yaml::from_str(
            "bucket: artifacts\nbackend: memory\nexpiration_days: 0\nuploader:\n  strategy: \
             sequential\n  chunk_size: 1024\ncopier:\n  strategy: sequential\n",
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.uploader.strategy, UploaderStrategy::Sequential);
        assert_eq!(config.uploader.chunk_size, 1024);
        assert_eq!(config.copier.strategy, CopierStrategy::Sequential);
        assert!(!config.is_soft_delete_enabled());
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let mut config = BlobStoreConfig::new("bucket");
        config.copier.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(BlobError::Configuration { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_half_configured_credentials() {
        let mut config = BlobStoreConfig::new("bucket");
        config.access_key_id = Some("AKIA".to_string());
        assert!(config.validate().is_err());
        config.secret_access_key = Some(Secret::new("secret"));
        config.validate().unwrap();
    }

    #[test]
    fn test_secrets_are_redacted() {
        let mut config = BlobStoreConfig::new("bucket");
        config.secret_access_key = Some(Secret::new("hunter2"));
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_resolve_parallelism() {
        assert_eq!(resolve_parallelism(3), 3);
        assert!(resolve_parallelism(0) >= 1);
    }
}
