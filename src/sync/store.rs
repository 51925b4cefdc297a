//! Durable object storage for scope snapshots.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;

use crate::errors::SyncError;

/// `bucket/objectKey`, split at the first `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl FromStr for ObjectLocation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self::new(bucket, key))
            }
            _ => Err(SyncError::InvalidLocation(s.to_string())),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>>;
    async fn put(&self, location: &ObjectLocation, bytes: Vec<u8>) -> Result<()>;
    /// Create the bucket if it does not exist yet.
    async fn ensure_bucket(&self, bucket: &str) -> Result<()>;
}

// ── S3 / MinIO ───────────────────────────────────────────────────────

pub struct S3Store {
    client: S3Client,
}

impl S3Store {
    /// Client for an S3-compatible endpoint (`host:port`) with static
    /// credentials and path-style addressing.
    pub fn new(endpoint: &str, use_ssl: bool, region: &str, access_key: &str, secret_key: &str) -> Self {
        let scheme = if use_ssl { "https" } else { "http" };
        let creds = Credentials::new(access_key, secret_key, None, None, "jobforge-static");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(format!("{}://{}", scheme, endpoint))
            .force_path_style(true)
            .credentials_provider(creds)
            .build();
        Self {
            client: S3Client::from_conf(config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("get_object failed: {}", DisplayErrorContext(&e)))?;
        let bytes = output
            .body
            .collect()
            .await
            .context("Failed to read object body")?
            .into_bytes();
        Ok(bytes.to_vec())
    }

    async fn put(&self, location: &ObjectLocation, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .content_type("application/zip")
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("put_object failed: {}", DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        if self.client.head_bucket().bucket(bucket).send().await.is_ok() {
            return Ok(());
        }
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {
                tracing::info!(bucket, "created bucket");
                Ok(())
            }
            Err(e)
                if e.as_service_error().is_some_and(|se| {
                    se.is_bucket_already_owned_by_you() || se.is_bucket_already_exists()
                }) =>
            {
                Ok(())
            }
            Err(e) => bail!("create_bucket failed: {}", DisplayErrorContext(&e)),
        }
    }
}

// ── Local directory ──────────────────────────────────────────────────

/// Directory-backed store; each bucket is a subdirectory of `root`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, location: &ObjectLocation) -> Result<PathBuf> {
        let unsafe_part = |s: &str| s.split('/').any(|p| p == ".." || p.is_empty());
        if unsafe_part(&location.bucket) || unsafe_part(&location.key) {
            bail!("Refusing unsafe object location '{}'", location);
        }
        Ok(self.root.join(&location.bucket).join(&location.key))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>> {
        let path = self.path_for(location)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn put(&self, location: &ObjectLocation, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        // Write-then-rename so readers never see a partial archive
        let tmp = path.with_extension("zip.partial");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move {} into place", path.display()))?;
        Ok(())
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        let dir = self.root.join(bucket);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create bucket directory {}", dir.display()))
    }
}
