//! S3 backend using object_store for object I/O and aws-sdk-s3 for multipart
//! sessions, tagging, lifecycle rules and bucket management.

use std::{
    ops::Range,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig, sts::AssumeRoleProvider};
use aws_credential_types::{
    Credentials,
    provider::{ProvideCredentials, SharedCredentialsProvider},
};
use aws_sdk_s3::{
    Client as S3Client,
    config::Region,
    error::{DisplayErrorContext, ProvideErrorMetadata},
    primitives::ByteStream,
    types::{
        BucketLifecycleConfiguration,
        BucketLocationConstraint,
        CompletedMultipartUpload,
        CompletedPart as S3CompletedPart,
        CreateBucketConfiguration,
        Delete,
        ExpirationStatus,
        LifecycleExpiration,
        LifecycleRule as S3LifecycleRule,
        LifecycleRuleAndOperator,
        LifecycleRuleFilter,
        ObjectIdentifier,
        Tag,
        Tagging,
        Transition,
        TransitionStorageClass,
    },
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use object_store::{
    CredentialProvider,
    ObjectMeta,
    ObjectStore,
    PutPayload,
    aws::{AmazonS3, AmazonS3Builder, AwsCredential},
    path::Path as ObjectPath,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    BlobError,
    BlobResult,
    config::BlobStoreConfig,
    traits::{
        CompletedPart,
        LifecycleRule,
        LifecycleTransition,
        ObjectSummary,
        ObjectTag,
        StorageBackend,
    },
};

const SESSION_NAME: &str = "artifact-blobstore";
const CREDENTIAL_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// How requests are signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerType {
    V4,
    Anonymous,
}

impl SignerType {
    pub fn parse(value: Option<&str>) -> BlobResult<Self> {
        match value.map(str::trim) {
            None | Some("") => Ok(SignerType::V4),
            Some(v) if v.eq_ignore_ascii_case("v4") || v == "AWSS3V4SignerType" => {
                Ok(SignerType::V4)
            }
            Some(v) if v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("anonymous") => {
                Ok(SignerType::Anonymous)
            }
            Some(other) => Err(BlobError::configuration(format!(
                "unsupported signer type '{}', expected 'v4' or 'none'",
                other
            ))),
        }
    }
}

/// S3 blob store backend.
pub struct S3Backend {
    /// object_store client for data I/O.
    object_store: Arc<AmazonS3>,

    /// AWS SDK S3 client for everything object_store does not cover.
    s3_client: S3Client,

    bucket: String,

    region: Option<String>,
}

impl S3Backend {
    pub async fn new(config: &BlobStoreConfig) -> BlobResult<Self> {
        let signer = SignerType::parse(config.signer_type.as_deref())?;
        let sdk_config = Self::load_sdk_config(config, signer).await?;

        let mut s3_config =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            s3_config = s3_config.endpoint_url(endpoint);
        }
        let s3_client = S3Client::from_conf(s3_config.build());

        let region = sdk_config.region().map(|r| r.to_string());
        let mut builder = AmazonS3Builder::new().with_bucket_name(&config.bucket);
        if let Some(region) = &region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        match (signer, sdk_config.credentials_provider()) {
            (SignerType::Anonymous, _) => builder = builder.with_skip_signature(true),
            (SignerType::V4, Some(provider)) => {
                builder = builder.with_credentials(Arc::new(SdkCredentialBridge::new(provider)));
            }
            (SignerType::V4, None) => {
                return Err(BlobError::configuration(
                    "no AWS credentials could be resolved; configure access keys or a default \
                     credential chain",
                ));
            }
        }
        let object_store = builder.build().map_err(|e| {
            BlobError::configuration(format!(
                "unable to build S3 client for bucket {}: {}",
                config.bucket, e
            ))
        })?;

        debug!(
            bucket = %config.bucket,
            region = ?region,
            endpoint = ?config.endpoint,
            "Created S3 backend"
        );

        Ok(Self {
            object_store: Arc::new(object_store),
            s3_client,
            bucket: config.bucket.clone(),
            region,
        })
    }

    async fn load_sdk_config(config: &BlobStoreConfig, signer: SignerType) -> BlobResult<SdkConfig> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if signer == SignerType::Anonymous {
            return Ok(loader.no_credentials().load().await);
        }
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id,
                secret.expose(),
                config.session_token.as_ref().map(|t| t.expose().to_string()),
                None,
                "blob-store-config",
            ));
        }
        let base = loader.load().await;

        let Some(role_arn) = &config.assume_role else {
            return Ok(base);
        };
        debug!(role = %role_arn, "Assuming role for S3 access");
        let provider = AssumeRoleProvider::builder(role_arn)
            .session_name(SESSION_NAME)
            .configure(&base)
            .build()
            .await;
        Ok(base
            .into_builder()
            .credentials_provider(SharedCredentialsProvider::new(provider))
            .build())
    }

    fn path(key: &str) -> ObjectPath {
        ObjectPath::from(key)
    }
}

/// Feeds credentials resolved by the AWS SDK chain into object_store,
/// caching them until shortly before they expire.
#[derive(Debug)]
struct SdkCredentialBridge {
    provider: SharedCredentialsProvider,
    cached: Mutex<Option<(Arc<AwsCredential>, Option<SystemTime>)>>,
}

impl SdkCredentialBridge {
    fn new(provider: SharedCredentialsProvider) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CredentialProvider for SdkCredentialBridge {
    type Credential = AwsCredential;

    async fn get_credential(&self) -> object_store::Result<Arc<AwsCredential>> {
        let mut cached = self.cached.lock().await;
        if let Some((credential, expiry)) = cached.as_ref() {
            let fresh = expiry.is_none_or(|at| SystemTime::now() + CREDENTIAL_REFRESH_MARGIN < at);
            if fresh {
                return Ok(Arc::clone(credential));
            }
        }
        let resolved = self
            .provider
            .provide_credentials()
            .await
            .map_err(|e| object_store::Error::Generic {
                store: "S3",
                source: Box::new(e),
            })?;
        let credential = Arc::new(AwsCredential {
            key_id: resolved.access_key_id().to_string(),
            secret_key: resolved.secret_access_key().to_string(),
            token: resolved.session_token().map(str::to_string),
        });
        *cached = Some((Arc::clone(&credential), resolved.expiry()));
        Ok(credential)
    }
}

fn sdk_error<E>(operation: &str, err: E) -> BlobError
where
    E: std::error::Error + Send + Sync + 'static,
{
    BlobError::backend(anyhow::anyhow!(
        "S3 {} failed: {}",
        operation,
        DisplayErrorContext(&err)
    ))
}

fn build_error(what: &str, err: impl std::fmt::Display) -> BlobError {
    BlobError::backend(anyhow::anyhow!("invalid S3 {}: {}", what, err))
}

fn summary(meta: ObjectMeta) -> ObjectSummary {
    ObjectSummary {
        key: meta.location.to_string(),
        size: meta.size,
        last_modified: meta.last_modified,
    }
}

/// Percent-encodes a key for the `x-amz-copy-source` header.
fn encode_copy_source(bucket: &str, key: &str) -> String {
    let mut encoded = String::with_capacity(bucket.len() + key.len() + 1);
    encoded.push_str(bucket);
    encoded.push('/');
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    encoded
}

fn tag_to_sdk(tag: &ObjectTag) -> BlobResult<Tag> {
    Tag::builder()
        .key(&tag.key)
        .value(&tag.value)
        .build()
        .map_err(|e| build_error("tag", e))
}

fn tag_from_sdk(tag: &Tag) -> ObjectTag {
    ObjectTag::new(tag.key(), tag.value())
}

fn rule_to_sdk(rule: &LifecycleRule) -> BlobResult<S3LifecycleRule> {
    let tags = rule
        .tags
        .iter()
        .map(tag_to_sdk)
        .collect::<BlobResult<Vec<_>>>()?;
    let filter = match (&rule.prefix, tags.as_slice()) {
        (None, []) => LifecycleRuleFilter::builder().prefix("").build(),
        (Some(prefix), []) => LifecycleRuleFilter::builder().prefix(prefix).build(),
        (None, [tag]) => LifecycleRuleFilter::builder().tag(tag.clone()).build(),
        (prefix, _) => LifecycleRuleFilter::builder()
            .and(
                LifecycleRuleAndOperator::builder()
                    .set_prefix(prefix.clone())
                    .set_tags(Some(tags.clone()))
                    .build(),
            )
            .build(),
    };
    let status = if rule.enabled {
        ExpirationStatus::Enabled
    } else {
        ExpirationStatus::Disabled
    };
    let mut builder = S3LifecycleRule::builder()
        .id(&rule.id)
        .filter(filter)
        .status(status);
    if let Some(days) = rule.expiration_days {
        builder = builder.expiration(LifecycleExpiration::builder().days(days as i32).build());
    }
    for transition in &rule.transitions {
        builder = builder.transitions(
            Transition::builder()
                .days(transition.days as i32)
                .storage_class(TransitionStorageClass::from(transition.storage_class.as_str()))
                .build(),
        );
    }
    builder.build().map_err(|e| build_error("lifecycle rule", e))
}

fn rule_from_sdk(rule: &S3LifecycleRule) -> LifecycleRule {
    let (prefix, tags) = match rule.filter() {
        Some(filter) => match filter.and() {
            Some(and) => (
                and.prefix().map(str::to_string),
                and.tags().iter().map(tag_from_sdk).collect(),
            ),
            None => (
                filter.prefix().map(str::to_string),
                filter.tag().map(tag_from_sdk).into_iter().collect(),
            ),
        },
        None => (None, Vec::new()),
    };
    LifecycleRule {
        id: rule.id().unwrap_or_default().to_string(),
        enabled: *rule.status() == ExpirationStatus::Enabled,
        prefix: prefix.filter(|p| !p.is_empty()),
        tags,
        expiration_days: rule
            .expiration()
            .and_then(|e| e.days())
            .map(|days| days.max(0) as u32),
        transitions: rule
            .transitions()
            .iter()
            .filter_map(|t| {
                Some(LifecycleTransition {
                    days: t.days()?.max(0) as u32,
                    storage_class: t.storage_class()?.as_str().to_string(),
                })
            })
            .collect(),
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn bucket_exists(&self) -> BlobResult<bool> {
        match self.s3_client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e)
                if e.as_service_error().is_some_and(|se| se.is_not_found())
                    || e.raw_response().map(|r| r.status().as_u16()) == Some(404) =>
            {
                Ok(false)
            }
            Err(e) => Err(sdk_error("head bucket", e)),
        }
    }

    async fn create_bucket(&self) -> BlobResult<()> {
        let mut request = self.s3_client.create_bucket().bucket(&self.bucket);
        if let Some(region) = self.region.as_deref().filter(|r| *r != "us-east-1") {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        match request.send().await {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("AccessDenied") => Err(BlobError::configuration(format!(
                "insufficient permissions to create bucket {}; create it manually or grant \
                 s3:CreateBucket",
                self.bucket
            ))),
            Err(e) => Err(sdk_error("create bucket", e)),
        }
    }

    async fn delete_bucket(&self) -> BlobResult<()> {
        self.s3_client
            .delete_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| sdk_error("delete bucket", e))?;
        Ok(())
    }

    async fn get_lifecycle_rules(&self) -> BlobResult<Vec<LifecycleRule>> {
        match self
            .s3_client
            .get_bucket_lifecycle_configuration()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(output) => Ok(output.rules().iter().map(rule_from_sdk).collect()),
            Err(e) if e.code() == Some("NoSuchLifecycleConfiguration") => Ok(Vec::new()),
            Err(e) => Err(sdk_error("get lifecycle configuration", e)),
        }
    }

    async fn put_lifecycle_rules(&self, rules: Vec<LifecycleRule>) -> BlobResult<()> {
        let rules = rules
            .iter()
            .map(rule_to_sdk)
            .collect::<BlobResult<Vec<_>>>()?;
        let configuration = BucketLifecycleConfiguration::builder()
            .set_rules(Some(rules))
            .build()
            .map_err(|e| build_error("lifecycle configuration", e))?;
        self.s3_client
            .put_bucket_lifecycle_configuration()
            .bucket(&self.bucket)
            .lifecycle_configuration(configuration)
            .send()
            .await
            .map_err(|e| sdk_error("put lifecycle configuration", e))?;
        Ok(())
    }

    async fn delete_lifecycle_configuration(&self) -> BlobResult<()> {
        self.s3_client
            .delete_bucket_lifecycle()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| sdk_error("delete lifecycle configuration", e))?;
        Ok(())
    }

    async fn put_object(&self, key: &str, data: Bytes) -> BlobResult<()> {
        self.object_store
            .put(&Self::path(key), PutPayload::from(data))
            .await?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> BlobResult<Bytes> {
        let result = self.object_store.get(&Self::path(key)).await?;
        let bytes = result.bytes().await.map_err(|e| BlobError::Backend {
            source: anyhow::Error::from(e),
        })?;
        Ok(bytes)
    }

    async fn get_object_stream(
        &self,
        key: &str,
    ) -> BlobResult<BoxStream<'static, BlobResult<Bytes>>> {
        let result = self.object_store.get(&Self::path(key)).await?;
        Ok(result.into_stream().map_err(BlobError::from).boxed())
    }

    async fn head_object(&self, key: &str) -> BlobResult<Option<ObjectSummary>> {
        match self.object_store.head(&Self::path(key)).await {
            Ok(meta) => Ok(Some(summary(meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, key: &str) -> BlobResult<()> {
        self.object_store.delete(&Self::path(key)).await?;
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> BlobResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let objects = keys
            .iter()
            .map(|key| {
                ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .map_err(|e| build_error("object identifier", e))
            })
            .collect::<BlobResult<Vec<_>>>()?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(false)
            .build()
            .map_err(|e| build_error("delete request", e))?;
        let output = self
            .s3_client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| sdk_error("delete objects", e))?;
        for failure in output.errors() {
            warn!(
                key = ?failure.key(),
                code = ?failure.code(),
                message = ?failure.message(),
                "S3 refused to delete object"
            );
        }
        Ok(output.deleted().len())
    }

    fn list_objects(&self, prefix: &str) -> BoxStream<'static, BlobResult<ObjectSummary>> {
        let prefix = prefix.trim_end_matches('/');
        let listing = if prefix.is_empty() {
            self.object_store.list(None)
        } else {
            self.object_store.list(Some(&Self::path(prefix)))
        };
        listing
            .map(|entry| entry.map(summary).map_err(BlobError::from))
            .boxed()
    }

    async fn copy_object(&self, source: &str, destination: &str) -> BlobResult<()> {
        self.object_store
            .copy(&Self::path(source), &Self::path(destination))
            .await?;
        Ok(())
    }

    async fn set_object_tags(&self, key: &str, tags: Vec<ObjectTag>) -> BlobResult<()> {
        let tag_set = tags.iter().map(tag_to_sdk).collect::<BlobResult<Vec<_>>>()?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| build_error("tagging", e))?;
        match self
            .s3_client
            .put_object_tagging()
            .bucket(&self.bucket)
            .key(key)
            .tagging(tagging)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("NotImplemented") => Err(BlobError::Unsupported {
                operation: "object tagging".to_string(),
            }),
            Err(e) => Err(sdk_error("put object tagging", e)),
        }
    }

    async fn create_multipart_upload(&self, key: &str) -> BlobResult<String> {
        let output = self
            .s3_client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("create multipart upload", e))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| BlobError::backend(anyhow::anyhow!("No upload ID returned from S3")))?;

        Ok(upload_id.to_string())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BlobResult<String> {
        let output = self
            .s3_client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| sdk_error("upload part", e))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| BlobError::backend(anyhow::anyhow!("No ETag returned for part {}", part_number)))
    }

    async fn upload_part_copy(
        &self,
        source: &str,
        destination: &str,
        upload_id: &str,
        part_number: u32,
        range: Range<u64>,
    ) -> BlobResult<String> {
        let output = self
            .s3_client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(destination)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .copy_source(encode_copy_source(&self.bucket, source))
            .copy_source_range(format!("bytes={}-{}", range.start, range.end.saturating_sub(1)))
            .send()
            .await
            .map_err(|e| sdk_error("upload part copy", e))?;

        output
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .map(str::to_string)
            .ok_or_else(|| {
                BlobError::backend(anyhow::anyhow!("No ETag returned for copied part {}", part_number))
            })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> BlobResult<()> {
        let parts: Vec<S3CompletedPart> = parts
            .into_iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .e_tag(part.e_tag)
                    .part_number(part.part_number as i32)
                    .build()
            })
            .collect();

        let multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.s3_client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(multipart_upload)
            .send()
            .await
            .map_err(|e| sdk_error("complete multipart upload", e))?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BlobResult<()> {
        self.s3_client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| sdk_error("abort multipart upload", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signer_type_parsing() {
        assert_eq!(SignerType::parse(None).unwrap(), SignerType::V4);
        assert_eq!(SignerType::parse(Some("V4")).unwrap(), SignerType::V4);
        assert_eq!(SignerType::parse(Some("none")).unwrap(), SignerType::Anonymous);
        assert!(matches!(
            SignerType::parse(Some("S3SignerType")),
            Err(BlobError::Configuration { .. })
        ));
    }

    #[test]
    fn test_copy_source_encoding() {
        assert_eq!(
            encode_copy_source("bucket", "p/content/directpath/a b+c.bytes"),
            "bucket/p/content/directpath/a%20b%2Bc.bytes"
        );
    }

    #[test]
    fn test_lifecycle_rule_conversion() {
        let rule = LifecycleRule {
            id: "Expire soft-deleted blobstore objects default".to_string(),
            enabled: true,
            prefix: Some("nexus/".to_string()),
            tags: vec![ObjectTag::new("deleted", "true")],
            expiration_days: Some(3),
            transitions: Vec::new(),
        };
        let sdk_rule = rule_to_sdk(&rule).unwrap();
        assert!(sdk_rule.filter().and_then(|f| f.and()).is_some());
        assert_eq!(rule_from_sdk(&sdk_rule), rule);

        let tag_only = LifecycleRule {
            prefix: None,
            ..rule
        };
        let sdk_rule = rule_to_sdk(&tag_only).unwrap();
        assert!(sdk_rule.filter().and_then(|f| f.tag()).is_some());
        assert_eq!(rule_from_sdk(&sdk_rule), tag_only);
    }
}
