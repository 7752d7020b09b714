use std::{env, fmt::Debug, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::{blob_storage::Metrics, Timer};
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey, DynamoCommit, S3ConditionalPut},
    parse_url,
    parse_url_opts,
    path::Path,
    ObjectStore,
    ObjectStoreScheme,
    PutPayload,
};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Image not found")]
    NotFound,

    #[error("{message}")]
    Store {
        message: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    fn store(message: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Error::Store {
            message,
            source: source.into(),
        }
    }

    fn from_object_store(message: &'static str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => Error::NotFound,
            other => Error::store(message, other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub url: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

/// Byte storage for original images, addressed by owner and identifier.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes the blob, replacing any previous one for the same image.
    async fn store(&self, owner: &str, identifier: &str, data: Bytes) -> Result<PutResult, Error>;

    async fn delete(&self, owner: &str, identifier: &str) -> Result<(), Error>;

    async fn get_image(&self, owner: &str, identifier: &str) -> Result<Bytes, Error>;

    async fn get_last_modified(&self, owner: &str, identifier: &str)
        -> Result<DateTime<Utc>, Error>;

    /// Whether the backend is reachable.
    async fn status(&self) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    pub path: Option<String>,
    pub dynamodb_table: Option<String>,
}

impl BlobStorageConfig {
    pub fn new(path: &str, dynamodb_table: Option<String>) -> Self {
        BlobStorageConfig {
            path: Some(format!("file://{}", path)),
            dynamodb_table,
        }
    }

    fn default_path() -> String {
        let dir = env::current_dir()
            .map(|cwd| cwd.join("imagehost_storage/blobs"))
            .unwrap_or_else(|_| env::temp_dir().join("imagehost_storage/blobs"));
        format!("file://{}", dir.display())
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let blob_store_path = Self::default_path();
        info!("using blob store path: {}", blob_store_path);
        BlobStorageConfig {
            path: Some(blob_store_path),
            dynamodb_table: None,
        }
    }
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    metrics: Arc<Metrics>,
}

impl Debug for BlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStorage")
            .field("path", &self.path)
            .finish()
    }
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> anyhow::Result<Self> {
        let url = config
            .path
            .clone()
            .unwrap_or_else(BlobStorageConfig::default_path);
        let (object_store, path) = Self::build_object_store(&url, config.dynamodb_table)?;
        Ok(Self {
            object_store: Arc::new(object_store),
            path,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn build_object_store(
        url_str: &str,
        ddb_table: Option<String>,
    ) -> anyhow::Result<(Box<dyn ObjectStore>, Path)> {
        let url = &url_str.parse::<Url>()?;
        let (scheme, _) = ObjectStoreScheme::parse(url)?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                let Some(ddb_table) = ddb_table else {
                    return Err(anyhow!("dynamodb_table is required for AmazonS3"));
                };
                // AWS_* variables take priority over instance metadata credentials.
                let opts: Vec<(AmazonS3ConfigKey, String)> = std::env::vars_os()
                    .filter_map(|(os_key, os_value)| {
                        let (key, value) = (os_key.to_str()?, os_value.to_str()?);
                        if !key.starts_with("AWS_") {
                            return None;
                        }
                        let config_key = key.to_ascii_lowercase().parse().ok()?;
                        Some((config_key, String::from(value)))
                    })
                    .collect();

                let mut s3_builder = AmazonS3Builder::new().with_url(url_str);
                for (key, value) in opts.iter() {
                    s3_builder = s3_builder.with_config(*key, value.clone());
                }
                let s3 = s3_builder
                    .with_conditional_put(S3ConditionalPut::Dynamo(DynamoCommit::new(ddb_table)))
                    .build()?;
                let (_, path) = parse_url_opts(url, opts)?;
                Ok((Box::new(s3), path))
            }
            _ => Ok(parse_url(url)?),
        }
    }

    /// Images are sharded by the first three characters of their identifier
    /// so that no single directory grows without bound.
    pub fn image_path(&self, owner: &str, identifier: &str) -> Path {
        let mut path = self.path.child(owner);
        for c in identifier.chars().take(3) {
            path = path.child(c.to_string());
        }
        path.child(identifier)
    }
}

#[async_trait]
impl BlobStore for BlobStorage {
    async fn store(&self, owner: &str, identifier: &str, data: Bytes) -> Result<PutResult, Error> {
        let labels = [KeyValue::new("op", "store")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &labels);

        let path = self.image_path(owner, identifier);
        let sha256_hash = hex::encode(Sha256::digest(&data));
        let size_bytes = data.len() as u64;
        self.object_store
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|e| Error::store("Could not store image", e))?;
        debug!(%path, size_bytes, "stored image blob");
        Ok(PutResult {
            url: path.to_string(),
            size_bytes,
            sha256_hash,
        })
    }

    async fn delete(&self, owner: &str, identifier: &str) -> Result<(), Error> {
        let labels = [KeyValue::new("op", "delete")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &labels);

        let path = self.image_path(owner, identifier);
        self.object_store
            .delete(&path)
            .await
            .map_err(|e| Error::from_object_store("Could not delete image", e))
    }

    async fn get_image(&self, owner: &str, identifier: &str) -> Result<Bytes, Error> {
        let labels = [KeyValue::new("op", "get")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &labels);

        let path = self.image_path(owner, identifier);
        let result = self
            .object_store
            .get(&path)
            .await
            .map_err(|e| Error::from_object_store("Could not read image", e))?;
        result
            .bytes()
            .await
            .map_err(|e| Error::from_object_store("Could not read image", e))
    }

    async fn get_last_modified(
        &self,
        owner: &str,
        identifier: &str,
    ) -> Result<DateTime<Utc>, Error> {
        let labels = [KeyValue::new("op", "head")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &labels);

        let path = self.image_path(owner, identifier);
        let meta = self
            .object_store
            .head(&path)
            .await
            .map_err(|e| Error::from_object_store("Could not fetch last modification date", e))?;
        Ok(meta.last_modified)
    }

    async fn status(&self) -> bool {
        match self.object_store.list_with_delimiter(Some(&self.path)).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => true,
            Err(err) => {
                info!("blob store status check failed: {:?}", err);
                false
            }
        }
    }
}
