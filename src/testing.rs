use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use blob_store::{BlobStorage, BlobStorageConfig, BlobStore, PutResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use data_model::{
    test_objects::tests::{TEST_OWNER, TEST_SECRET},
    Image,
    ImageQuery,
    MetadataRecord,
    MimeType,
};
use metadata_store::{MemoryMetadataStore, MetadataStore};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::{MetadataStoreConfig, ServerConfig},
    service::Service,
    transformations::TransformationRegistry,
};

/// A store call, by identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InsertImage(String),
    DeleteImage(String),
    Load(String),
    UpdateMetadata(String),
    GetMetadata(String),
    DeleteMetadata(String),
    GetImages,
    MetadataLastModified(Option<String>),
    NumImages,
    MimeType(String),
    Store(String),
    Delete(String),
    GetImage(String),
    GetLastModified(String),
}

#[derive(Default)]
struct CallLog(Mutex<Vec<Call>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    fn snapshot(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }
}

fn memory_blob_config() -> BlobStorageConfig {
    BlobStorageConfig {
        path: Some("memory:///images".to_string()),
        dynamodb_table: None,
    }
}

fn injected(message: &'static str) -> anyhow::Error {
    anyhow::anyhow!("injected failure: {message}")
}

/// Wraps a metadata store, logging every call and failing on demand.
pub struct RecordingMetadataStore {
    inner: Arc<dyn MetadataStore>,
    calls: CallLog,
    fail_inserts: AtomicBool,
}

impl RecordingMetadataStore {
    pub fn new(inner: Arc<dyn MetadataStore>) -> Self {
        Self {
            inner,
            calls: CallLog::default(),
            fail_inserts: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.snapshot()
    }

    pub fn clear_calls(&self) {
        self.calls.0.lock().unwrap().clear();
    }

    pub fn inner(&self) -> &dyn MetadataStore {
        self.inner.as_ref()
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for RecordingMetadataStore {
    async fn insert_image(&self, image: &Image) -> Result<(), metadata_store::Error> {
        self.calls.push(Call::InsertImage(image.identifier.clone()));
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(metadata_store::Error::backend(
                metadata_store::SAVE_IMAGE_FAILED,
                injected("insert"),
            ));
        }
        self.inner.insert_image(image).await
    }

    async fn delete_image(&self, owner: &str, identifier: &str) -> Result<(), metadata_store::Error> {
        self.calls.push(Call::DeleteImage(identifier.to_string()));
        self.inner.delete_image(owner, identifier).await
    }

    async fn load(&self, owner: &str, identifier: &str) -> Result<Image, metadata_store::Error> {
        self.calls.push(Call::Load(identifier.to_string()));
        self.inner.load(owner, identifier).await
    }

    async fn update_metadata(
        &self,
        owner: &str,
        identifier: &str,
        metadata: MetadataRecord,
    ) -> Result<(), metadata_store::Error> {
        self.calls.push(Call::UpdateMetadata(identifier.to_string()));
        self.inner.update_metadata(owner, identifier, metadata).await
    }

    async fn get_metadata(
        &self,
        owner: &str,
        identifier: &str,
    ) -> Result<MetadataRecord, metadata_store::Error> {
        self.calls.push(Call::GetMetadata(identifier.to_string()));
        self.inner.get_metadata(owner, identifier).await
    }

    async fn delete_metadata(&self, owner: &str, identifier: &str) -> Result<(), metadata_store::Error> {
        self.calls.push(Call::DeleteMetadata(identifier.to_string()));
        self.inner.delete_metadata(owner, identifier).await
    }

    async fn get_images(
        &self,
        owner: &str,
        query: &ImageQuery,
    ) -> Result<Vec<Image>, metadata_store::Error> {
        self.calls.push(Call::GetImages);
        self.inner.get_images(owner, query).await
    }

    async fn get_last_modified(
        &self,
        owner: &str,
        identifier: Option<&str>,
    ) -> Result<DateTime<Utc>, metadata_store::Error> {
        self.calls
            .push(Call::MetadataLastModified(identifier.map(str::to_string)));
        self.inner.get_last_modified(owner, identifier).await
    }

    async fn get_num_images(&self, owner: &str) -> Result<usize, metadata_store::Error> {
        self.calls.push(Call::NumImages);
        self.inner.get_num_images(owner).await
    }

    async fn get_image_mime_type(
        &self,
        owner: &str,
        identifier: &str,
    ) -> Result<MimeType, metadata_store::Error> {
        self.calls.push(Call::MimeType(identifier.to_string()));
        self.inner.get_image_mime_type(owner, identifier).await
    }

    async fn status(&self) -> bool {
        self.inner.status().await
    }
}

/// Wraps a blob store, logging every call and failing on demand.
pub struct RecordingBlobStore {
    inner: Arc<dyn BlobStore>,
    calls: CallLog,
    fail_stores: AtomicBool,
    fail_deletes: AtomicBool,
    down: AtomicBool,
}

impl RecordingBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            calls: CallLog::default(),
            fail_stores: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            down: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Self {
        let storage = BlobStorage::new(memory_blob_config()).expect("memory blob storage");
        Self::new(Arc::new(storage))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.snapshot()
    }

    pub fn clear_calls(&self) {
        self.calls.0.lock().unwrap().clear();
    }

    pub fn inner(&self) -> &dyn BlobStore {
        self.inner.as_ref()
    }

    pub fn fail_stores(&self, fail: bool) {
        self.fail_stores.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for RecordingBlobStore {
    async fn store(
        &self,
        owner: &str,
        identifier: &str,
        data: Bytes,
    ) -> Result<PutResult, blob_store::Error> {
        self.calls.push(Call::Store(identifier.to_string()));
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(blob_store::Error::Store {
                message: "Could not store image",
                source: injected("store"),
            });
        }
        self.inner.store(owner, identifier, data).await
    }

    async fn delete(&self, owner: &str, identifier: &str) -> Result<(), blob_store::Error> {
        self.calls.push(Call::Delete(identifier.to_string()));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(blob_store::Error::Store {
                message: "Could not delete image",
                source: injected("delete"),
            });
        }
        self.inner.delete(owner, identifier).await
    }

    async fn get_image(&self, owner: &str, identifier: &str) -> Result<Bytes, blob_store::Error> {
        self.calls.push(Call::GetImage(identifier.to_string()));
        self.inner.get_image(owner, identifier).await
    }

    async fn get_last_modified(
        &self,
        owner: &str,
        identifier: &str,
    ) -> Result<DateTime<Utc>, blob_store::Error> {
        self.calls.push(Call::GetLastModified(identifier.to_string()));
        self.inner.get_last_modified(owner, identifier).await
    }

    async fn status(&self) -> bool {
        !self.down.load(Ordering::SeqCst) && self.inner.status().await
    }
}

pub struct TestService {
    pub service: Service,
    pub metadata: Arc<RecordingMetadataStore>,
    pub blobs: Arc<RecordingBlobStore>,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_registry(TransformationRegistry::with_builtins()).await
    }

    pub async fn with_registry(registry: TransformationRegistry) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let mut cfg = ServerConfig {
            metadata_store: MetadataStoreConfig::Memory,
            blob_storage: memory_blob_config(),
            ..Default::default()
        };
        cfg.auth
            .owners
            .insert(TEST_OWNER.to_string(), TEST_SECRET.to_string());

        let metadata = Arc::new(RecordingMetadataStore::new(Arc::new(
            MemoryMetadataStore::new(),
        )));
        let blobs = Arc::new(RecordingBlobStore::in_memory());
        let service = Service::with_stores(cfg, metadata.clone(), blobs.clone(), registry);

        Ok(Self {
            service,
            metadata,
            blobs,
        })
    }

    /// Serves the router on an ephemeral local port and returns its base URL.
    pub async fn spawn(&self) -> Result<String> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let router = self.service.router();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(format!("http://{addr}"))
    }
}
