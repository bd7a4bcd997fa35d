//! Bucket bootstrap and the lifecycle rule that expires soft-deleted blobs.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{info, warn};

use crate::{
    BlobError,
    BlobResult,
    config::BlobStoreConfig,
    traits::{LifecycleRule, ObjectTag, StorageBackend},
};

pub const LIFECYCLE_EXPIRATION_RULE_ID_PREFIX: &str = "Expire soft-deleted blobstore objects ";

/// Rule id used before rules were keyed by store name.
pub const LEGACY_LIFECYCLE_EXPIRATION_RULE_ID: &str = "Expire soft-deleted objects";

pub const DELETED_TAG_KEY: &str = "deleted";
pub const DELETED_TAG_VALUE: &str = "true";

pub fn deleted_tag() -> ObjectTag {
    ObjectTag::new(DELETED_TAG_KEY, DELETED_TAG_VALUE)
}

pub fn lifecycle_rule_id(store_name: &str) -> String {
    format!("{}{}", LIFECYCLE_EXPIRATION_RULE_ID_PREFIX, store_name)
}

pub struct StorageLocationManager {
    backend: Arc<dyn StorageBackend>,
}

impl StorageLocationManager {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Creates the bucket when missing and reconciles this store's
    /// expiration rule with the configured retention.
    pub async fn prepare_storage_location(&self, config: &BlobStoreConfig) -> BlobResult<()> {
        let exists = self.backend.bucket_exists().await.map_err(|e| {
            BlobError::configuration(format!(
                "unable to check bucket {}: {}",
                config.bucket, e
            ))
        })?;
        if !exists {
            self.backend.create_bucket().await.map_err(|e| match e {
                e @ BlobError::Configuration { .. } => e,
                other => BlobError::configuration(format!(
                    "unable to create bucket {}: {}",
                    config.bucket, other
                )),
            })?;
            info!(bucket = %config.bucket, "Created bucket");
        }
        self.apply_expiration_rule(config).await.map_err(|e| {
            BlobError::configuration(format!(
                "unable to apply lifecycle rules to bucket {}: {}",
                config.bucket, e
            ))
        })
    }

    async fn apply_expiration_rule(&self, config: &BlobStoreConfig) -> BlobResult<()> {
        let existing = self.backend.get_lifecycle_rules().await?;
        if config.is_soft_delete_enabled() && is_expiration_rule_present(&existing, config) {
            return Ok(());
        }
        let had_rules = !existing.is_empty();
        let mut rules: Vec<LifecycleRule> = existing
            .into_iter()
            .filter(|rule| !is_managed_rule(rule, config))
            .collect();
        if config.is_soft_delete_enabled() {
            rules.push(expiration_rule(config));
        }
        if !rules.is_empty() {
            info!(
                bucket = %config.bucket,
                retention_days = config.expiration_days,
                "Updating bucket lifecycle rules"
            );
            self.backend.put_lifecycle_rules(rules).await
        } else if had_rules {
            info!(bucket = %config.bucket, "Removing bucket lifecycle configuration");
            self.backend.delete_lifecycle_configuration().await
        } else {
            Ok(())
        }
    }

    /// Deletes the bucket when it holds no objects; otherwise only drops the
    /// lifecycle rules this store owns.
    pub async fn delete_storage_location(&self, config: &BlobStoreConfig) -> BlobResult<()> {
        let first = self.backend.list_objects("").next().await.transpose()?;
        if first.is_none() {
            info!(bucket = %config.bucket, "Deleting empty bucket");
            return self.backend.delete_bucket().await;
        }
        warn!(
            bucket = %config.bucket,
            "Unable to delete non-empty bucket, removing only this store's lifecycle rule"
        );
        self.remove_expiration_rule(config).await
    }

    /// Drops this store's lifecycle rules, keeping everything else.
    pub async fn remove_expiration_rule(&self, config: &BlobStoreConfig) -> BlobResult<()> {
        let existing = self.backend.get_lifecycle_rules().await?;
        let remaining: Vec<LifecycleRule> = existing
            .iter()
            .filter(|rule| !is_managed_rule(rule, config))
            .cloned()
            .collect();
        if remaining.len() == existing.len() {
            return Ok(());
        }
        if remaining.is_empty() {
            self.backend.delete_lifecycle_configuration().await
        } else {
            self.backend.put_lifecycle_rules(remaining).await
        }
    }

    pub async fn is_storage_available(&self) -> bool {
        match self.backend.bucket_exists().await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(bucket = %self.backend.bucket(), error = %e, "Bucket is not available");
                false
            }
        }
    }
}

fn is_managed_rule(rule: &LifecycleRule, config: &BlobStoreConfig) -> bool {
    rule.id == lifecycle_rule_id(&config.name) || rule.id == LEGACY_LIFECYCLE_EXPIRATION_RULE_ID
}

fn expiration_rule(config: &BlobStoreConfig) -> LifecycleRule {
    let prefix = config.bucket_prefix();
    LifecycleRule {
        id: lifecycle_rule_id(&config.name),
        enabled: true,
        prefix: (!prefix.is_empty()).then_some(prefix),
        tags: vec![deleted_tag()],
        expiration_days: Some(config.expiration_days),
        transitions: Vec::new(),
    }
}

/// Whether `rules` already hold this store's rule with the configured
/// retention and filter.
pub fn is_expiration_rule_present(rules: &[LifecycleRule], config: &BlobStoreConfig) -> bool {
    let wanted = expiration_rule(config);
    rules.iter().any(|rule| rule == &wanted)
}
