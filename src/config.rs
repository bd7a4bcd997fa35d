use std::path::Path;

use anyhow::Result;
use blob_store::BlobStoreConfig;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "BLOBSTORE_";

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub store: BlobStoreConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        CliConfig {
            env: default_env(),
            store: BlobStoreConfig::default(),
        }
    }
}

impl CliConfig {
    /// Reads the YAML file at `path`, then applies `BLOBSTORE_` environment
    /// overrides (`BLOBSTORE_STORE__BUCKET=...` sets `store.bucket`).
    pub fn from_path(path: &Path) -> Result<CliConfig> {
        let config: CliConfig = Figment::new()
            .merge(Yaml::file_exact(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<CliConfig> {
        let config: CliConfig = Figment::new()
            .merge(figment::providers::Serialized::defaults(CliConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(test)]
    fn from_yaml_str(config_str: &str) -> Result<CliConfig> {
        let config: CliConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        Ok(())
    }

    pub fn generate(path: &Path) -> Result<()> {
        let config = CliConfig::default();
        let str = serde_yaml::to_string(&config)?;
        std::fs::write(path, str)?;
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }
}

#[cfg(test)]
mod tests {
    use blob_store::{BackendKind, UploaderStrategy};

    use super::*;

    #[test]
    fn test_parse_store_section() {
        let config = CliConfig::from_yaml_str(
            r#"
env: prod
store:
  name: releases
  bucket: acme-releases
  prefix: nexus
  region: eu-west-1
  expiration_days: 7
  uploader:
    strategy: parallel
    chunk_size: 8388608
"#,
        )
        .unwrap();
        assert!(config.structured_logging());
        assert_eq!(config.store.name, "releases");
        assert_eq!(config.store.bucket, "acme-releases");
        assert_eq!(config.store.bucket_prefix(), "nexus/");
        assert_eq!(config.store.expiration_days, 7);
        assert_eq!(config.store.backend, BackendKind::S3);
        assert_eq!(config.store.uploader.strategy, UploaderStrategy::Parallel);
        assert_eq!(config.store.uploader.chunk_size, 8 * 1024 * 1024);
    }

    #[test]
    fn test_defaults() {
        let config = CliConfig::from_yaml_str("store:\n  bucket: scratch\n").unwrap();
        assert_eq!(config.env, "local");
        assert!(!config.structured_logging());
        assert_eq!(config.store.expiration_days, 3);
        assert!(config.store.prefer_async_cleanup);
    }

    #[test]
    fn test_invalid_bucket_is_rejected() {
        assert!(CliConfig::from_yaml_str("store:\n  bucket: Bad_Bucket\n").is_err());
    }

    #[test]
    fn test_generated_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobstore.yaml");
        CliConfig::generate(&path).unwrap();
        let config = CliConfig::from_path(&path).unwrap();
        assert_eq!(config.store.bucket, CliConfig::default().store.bucket);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CliConfig::from_path(&dir.path().join("absent.yaml")).is_err());
    }
}
