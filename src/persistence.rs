use std::sync::Arc;

use blob_store::{BlobStore, PutResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use data_model::Image;
use metadata_store::MetadataStore;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Metadata(#[from] metadata_store::Error),

    #[error(transparent)]
    Blob(#[from] blob_store::Error),
}

/// Orders the calls to the metadata store and the blob store.
///
/// A create writes metadata first and removes it again when the blob write
/// fails. A delete removes both unconditionally and does not roll anything
/// back, so a failed blob delete leaves the blob behind.
pub struct PersistenceCoordinator {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    metrics: Arc<metrics::metadata_storage::Metrics>,
}

impl PersistenceCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        metrics: Arc<metrics::metadata_storage::Metrics>,
    ) -> Self {
        Self {
            metadata,
            blobs,
            metrics,
        }
    }

    #[tracing::instrument(skip_all, fields(owner = %image.owner, identifier = %image.identifier))]
    pub async fn store(&self, image: &Image, blob: Bytes) -> Result<PutResult, PersistenceError> {
        self.metadata.insert_image(image).await?;

        match self.blobs.store(&image.owner, &image.identifier, blob).await {
            Ok(put_result) => {
                info!(size_bytes = put_result.size_bytes, "image stored");
                Ok(put_result)
            }
            Err(blob_err) => {
                error!(error = %blob_err, "blob write failed, removing metadata");
                self.metrics.compensations.add(1, &[]);
                if let Err(err) = self
                    .metadata
                    .delete_image(&image.owner, &image.identifier)
                    .await
                {
                    error!(error = %err, "unable to remove metadata after failed blob write");
                }
                Err(blob_err.into())
            }
        }
    }

    /// Deletes the metadata and then the blob. Both deletes are always
    /// attempted; the first error is returned.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, owner: &str, identifier: &str) -> Result<(), PersistenceError> {
        let metadata_result = self.metadata.delete_image(owner, identifier).await;
        let blob_result = self.blobs.delete(owner, identifier).await;

        if metadata_result.is_ok() {
            if let Err(err) = &blob_result {
                warn!(error = %err, "metadata removed but the blob was not");
            }
        }
        metadata_result?;
        blob_result?;
        Ok(())
    }

    /// The stored image fields, without the blob.
    pub async fn fetch(&self, owner: &str, identifier: &str) -> Result<Image, PersistenceError> {
        Ok(self.metadata.load(owner, identifier).await?)
    }

    pub async fn load_blob(&self, image: &mut Image) -> Result<(), PersistenceError> {
        let blob = self
            .blobs
            .get_image(&image.owner, &image.identifier)
            .await?;
        image.set_blob(blob);
        Ok(())
    }

    /// The authoritative modification date of an image.
    pub async fn last_modified(
        &self,
        owner: &str,
        identifier: &str,
    ) -> Result<DateTime<Utc>, PersistenceError> {
        Ok(self.blobs.get_last_modified(owner, identifier).await?)
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_image, TEST_IDENTIFIER, TEST_OWNER};
    use metadata_store::MemoryMetadataStore;

    use super::*;
    use crate::testing::{Call, RecordingBlobStore, RecordingMetadataStore};

    struct Fixture {
        metadata: Arc<RecordingMetadataStore>,
        blobs: Arc<RecordingBlobStore>,
        coordinator: PersistenceCoordinator,
    }

    fn fixture() -> Fixture {
        let metadata = Arc::new(RecordingMetadataStore::new(Arc::new(
            MemoryMetadataStore::new(),
        )));
        let blobs = Arc::new(RecordingBlobStore::in_memory());
        let coordinator = PersistenceCoordinator::new(
            metadata.clone(),
            blobs.clone(),
            Arc::new(metrics::metadata_storage::Metrics::new()),
        );
        Fixture {
            metadata,
            blobs,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_store_and_fetch() {
        let f = fixture();
        let mut image = mock_image(TEST_OWNER, TEST_IDENTIFIER, 100, 50);
        let blob = image.take_blob().unwrap();
        f.coordinator.store(&image, blob.clone()).await.unwrap();

        let mut fetched = f.coordinator.fetch(TEST_OWNER, TEST_IDENTIFIER).await.unwrap();
        assert!(!fetched.has_blob());
        assert_eq!((100, 50), (fetched.width, fetched.height));

        f.coordinator.load_blob(&mut fetched).await.unwrap();
        assert_eq!(Some(&blob), fetched.blob());
        assert_eq!(
            vec![
                Call::InsertImage(TEST_IDENTIFIER.to_string()),
                Call::Load(TEST_IDENTIFIER.to_string()),
            ],
            f.metadata.calls()
        );
    }

    #[tokio::test]
    async fn test_failed_metadata_insert_never_writes_the_blob() {
        let f = fixture();
        f.metadata.fail_inserts(true);
        let mut image = mock_image(TEST_OWNER, TEST_IDENTIFIER, 10, 10);
        let blob = image.take_blob().unwrap();

        let err = f.coordinator.store(&image, blob).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Metadata(_)));
        assert!(f.blobs.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_blob_write_removes_metadata() {
        let f = fixture();
        f.blobs.fail_stores(true);
        for (owner, identifier) in [(TEST_OWNER, "first"), (TEST_OWNER, "second"), ("other", "first")] {
            let mut image = mock_image(owner, identifier, 10, 10);
            let blob = image.take_blob().unwrap();

            let err = f.coordinator.store(&image, blob).await.unwrap_err();
            assert!(matches!(err, PersistenceError::Blob(blob_store::Error::Store { .. })));
            assert!(matches!(
                f.coordinator.fetch(owner, identifier).await,
                Err(PersistenceError::Metadata(metadata_store::Error::ImageNotFound))
            ));
            assert_eq!(0, f.metadata.inner().get_num_images(owner).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_remove_missing_image_calls_both_stores() {
        let f = fixture();
        let err = f.coordinator.remove(TEST_OWNER, "missing").await.unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::Metadata(metadata_store::Error::ImageNotFound)
        ));
        assert_eq!(vec![Call::DeleteImage("missing".to_string())], f.metadata.calls());
        assert_eq!(vec![Call::Delete("missing".to_string())], f.blobs.calls());
    }

    #[tokio::test]
    async fn test_remove_does_not_roll_back() {
        let f = fixture();
        let mut image = mock_image(TEST_OWNER, TEST_IDENTIFIER, 10, 10);
        let blob = image.take_blob().unwrap();
        f.coordinator.store(&image, blob).await.unwrap();

        f.blobs.fail_deletes(true);
        let err = f.coordinator.remove(TEST_OWNER, TEST_IDENTIFIER).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Blob(_)));
        assert!(f.coordinator.fetch(TEST_OWNER, TEST_IDENTIFIER).await.is_err());
        assert!(f
            .blobs
            .inner()
            .get_image(TEST_OWNER, TEST_IDENTIFIER)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_last_modified_comes_from_the_blob_store() {
        let f = fixture();
        let mut image = mock_image(TEST_OWNER, TEST_IDENTIFIER, 10, 10);
        let blob = image.take_blob().unwrap();
        f.coordinator.store(&image, blob).await.unwrap();

        f.coordinator
            .last_modified(TEST_OWNER, TEST_IDENTIFIER)
            .await
            .unwrap();
        assert!(f.blobs.calls().contains(&Call::GetLastModified(TEST_IDENTIFIER.to_string())));
        assert!(matches!(
            f.coordinator.last_modified(TEST_OWNER, "missing").await,
            Err(PersistenceError::Blob(blob_store::Error::NotFound))
        ));
    }
}
